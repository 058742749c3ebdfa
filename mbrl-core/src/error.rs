use derive_more::{Display, Error};

/// Problems with the job configuration. These are detected before any training happens.
#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("could not parse configuration: {reason}")]
    Parse { reason: String },
    #[display("invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[display("unknown environment `{name}`")]
    UnknownEnv { name: String },
    #[display("environment `{env}` has no analytic reward, `learn_reward` has to be enabled")]
    RewardUnavailable { env: String },
}

/// Numerical conditions that would silently corrupt the rest of the run.
#[derive(Debug, Display, Error)]
pub enum NumericalError {
    #[display("degenerate curvature in the natural gradient step: xᵀFx = {curvature}")]
    DegenerateCurvature { curvature: f32 },
    #[display("parameter vector has length {got}, expected {expected}")]
    ParamLength { expected: usize, got: usize },
}
