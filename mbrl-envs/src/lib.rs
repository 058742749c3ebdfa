pub mod pendulum;
pub mod point_mass;

pub use pendulum::Pendulum;
pub use point_mass::PointMass;

use anyhow::Result;
use mbrl_core::{env::Env, error::ConfigError};

pub const ENV_NAMES: [&str; 3] = ["point_mass", "point_mass_1d", "pendulum"];

/// Builds an environment from its registered name.
pub fn make_env(name: &str) -> Result<Box<dyn Env>> {
    let env: Box<dyn Env> = match name {
        "point_mass" => Box::new(PointMass::new(2)),
        "point_mass_1d" => Box::new(PointMass::new(1)),
        "pendulum" => Box::new(Pendulum::default()),
        _ => {
            return Err(ConfigError::UnknownEnv {
                name: name.to_string(),
            }
            .into());
        }
    };
    Ok(env)
}
