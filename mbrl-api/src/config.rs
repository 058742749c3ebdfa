use anyhow::{Context, Result};
use candle_core::Device;
use mbrl_agents::{baseline::BaselineConfig, npg::NpgConfig};
use mbrl_core::{error::ConfigError, models::WorldModelConfig, sequential::Activation};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};

pub const JOB_DATA_FILE: &str = "job_data.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartState {
    /// Initial states observed in the real environment.
    Init,
    /// A mix of initial states and states from the replay buffer.
    Buffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

/// A training job, read from a JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub env_name: String,
    pub seed: u64,
    pub num_models: usize,
    pub policy_size: Vec<usize>,
    pub init_log_std: f32,
    pub min_log_std: f32,
    pub step_size: f32,
    pub horizon: usize,
    pub num_iter: usize,
    pub init_samples: usize,
    pub iter_samples: usize,
    pub buffer_size: usize,
    pub inner_steps: usize,
    pub update_paths: usize,
    pub fit_epochs: usize,
    pub refresh_fit: bool,

    #[serde(default)]
    pub eval_rollouts: usize,
    #[serde(default = "default_save_freq")]
    pub save_freq: usize,
    #[serde(default = "default_device")]
    pub device: DeviceKind,
    #[serde(default = "default_one")]
    pub hvp_frac: f32,
    #[serde(default = "default_start_state")]
    pub start_state: StartState,
    #[serde(default = "default_true")]
    pub learn_reward: bool,
    #[serde(default = "default_replay_buffer_size")]
    pub replay_buffer_size: usize,
    #[serde(default)]
    pub buffer_frac: Option<f32>,
    #[serde(default)]
    pub refresh_policy: bool,
    #[serde(default)]
    pub init_policy: Option<PathBuf>,

    #[serde(default = "default_gamma")]
    pub gamma: f32,
    #[serde(default = "default_cg_iters")]
    pub cg_iters: usize,
    #[serde(default = "default_cg_damping")]
    pub cg_damping: f32,

    #[serde(default = "default_hidden_size")]
    pub hidden_size: Vec<usize>,
    #[serde(default = "default_activation")]
    pub activation: Activation,
    #[serde(default = "default_lr")]
    pub fit_lr: f64,
    #[serde(default)]
    pub fit_wd: f64,
    #[serde(default = "default_batch_size")]
    pub fit_mb_size: usize,
    #[serde(default)]
    pub fit_max_grad_norm: Option<f32>,

    #[serde(default = "default_baseline_size")]
    pub baseline_size: Vec<usize>,
    #[serde(default = "default_baseline_epochs")]
    pub baseline_epochs: usize,
    #[serde(default = "default_lr")]
    pub baseline_lr: f64,
    #[serde(default = "default_baseline_reg")]
    pub baseline_reg: f64,
    #[serde(default = "default_batch_size")]
    pub baseline_batch_size: usize,
    #[serde(default = "default_baseline_action_samples")]
    pub baseline_action_samples: usize,
}

fn default_save_freq() -> usize {
    10
}

fn default_device() -> DeviceKind {
    DeviceKind::Cpu
}

fn default_one() -> f32 {
    1.
}

fn default_start_state() -> StartState {
    StartState::Init
}

fn default_true() -> bool {
    true
}

fn default_replay_buffer_size() -> usize {
    1_000_000
}

fn default_gamma() -> f32 {
    0.995
}

fn default_cg_iters() -> usize {
    10
}

fn default_cg_damping() -> f32 {
    1e-4
}

fn default_hidden_size() -> Vec<usize> {
    vec![64, 64]
}

fn default_activation() -> Activation {
    Activation::Relu
}

fn default_lr() -> f64 {
    1e-3
}

fn default_batch_size() -> usize {
    256
}

fn default_baseline_size() -> Vec<usize> {
    vec![128, 128]
}

fn default_baseline_epochs() -> usize {
    2
}

fn default_baseline_reg() -> f64 {
    1e-3
}

fn default_baseline_action_samples() -> usize {
    4
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        reason: reason.to_string(),
    }
}

impl JobConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|err| ConfigError::Parse {
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_models == 0 {
            return Err(invalid("num_models", "at least one model is required"));
        }
        if self.save_freq == 0 {
            return Err(invalid("save_freq", "must be positive"));
        }
        if self.init_samples == 0 {
            return Err(invalid("init_samples", "must be positive"));
        }
        if self.horizon == 0 {
            return Err(invalid("horizon", "must be positive"));
        }
        if self.update_paths == 0 {
            return Err(invalid("update_paths", "must be positive"));
        }
        if self.fit_mb_size == 0 || self.baseline_batch_size == 0 {
            return Err(invalid("fit_mb_size", "batch sizes must be positive"));
        }
        if !(self.step_size > 0.) {
            return Err(invalid("step_size", "must be positive"));
        }
        if !(self.hvp_frac > 0. && self.hvp_frac <= 1.) {
            return Err(invalid("hvp_frac", "must be in (0, 1]"));
        }
        if let Some(frac) = self.buffer_frac {
            if !(0. ..=1.).contains(&frac) {
                return Err(invalid("buffer_frac", "must be in [0, 1]"));
            }
        }
        if !(0. ..=1.).contains(&self.gamma) {
            return Err(invalid("gamma", "must be in [0, 1]"));
        }
        if self.start_state == StartState::Buffer
            && self.buffer_frac.is_none()
            && self.update_paths < 2
        {
            return Err(invalid(
                "update_paths",
                "buffer start states without buffer_frac need at least two update paths",
            ));
        }
        Ok(())
    }

    /// Writes the resolved configuration, defaults included, to `<dir>/job_data.json`.
    pub fn write_job_data(&self, dir: &Path) -> Result<()> {
        let file = File::create(dir.join(JOB_DATA_FILE))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn device(&self) -> Result<Device> {
        match self.device {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Cuda => {
                let device = Device::cuda_if_available(0)?;
                if !device.is_cuda() {
                    tracing::warn!("cuda requested but not available, falling back to cpu");
                }
                Ok(device)
            }
        }
    }

    pub fn world_model_config(&self) -> WorldModelConfig {
        WorldModelConfig {
            hidden_size: self.hidden_size.clone(),
            activation: self.activation,
            fit_lr: self.fit_lr,
            fit_wd: self.fit_wd,
            fit_mb_size: self.fit_mb_size,
            fit_epochs: self.fit_epochs,
            fit_max_grad_norm: self.fit_max_grad_norm,
            learn_reward: self.learn_reward,
        }
    }

    pub fn baseline_config(&self) -> BaselineConfig {
        BaselineConfig {
            hidden_size: self.baseline_size.clone(),
            epochs: self.baseline_epochs,
            learning_rate: self.baseline_lr,
            reg_coef: self.baseline_reg,
            batch_size: self.baseline_batch_size,
            action_samples: self.baseline_action_samples,
        }
    }

    pub fn npg_config(&self) -> NpgConfig {
        NpgConfig {
            normalized_step_size: self.step_size,
            gamma: self.gamma,
            cg_iters: self.cg_iters,
            cg_damping: self.cg_damping,
            hvp_sample_frac: self.hvp_frac,
        }
    }

    /// Number of initial-state and replay-buffer start states for one update in buffer mode.
    pub fn buffer_start_split(&self) -> (usize, usize) {
        match self.buffer_frac {
            Some(frac) => {
                let paths = self.update_paths as f32;
                (
                    (paths * (1. - frac)) as usize + 1,
                    (paths * frac) as usize + 1,
                )
            }
            None => (self.update_paths / 2, self.update_paths / 2),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    pub const MINIMAL: &str = r#"{
        "env_name": "point_mass_1d",
        "seed": 123,
        "num_models": 2,
        "policy_size": [32, 32],
        "init_log_std": -0.5,
        "min_log_std": -2.0,
        "step_size": 0.05,
        "horizon": 20,
        "num_iter": 3,
        "init_samples": 500,
        "iter_samples": 100,
        "buffer_size": 10000,
        "inner_steps": 2,
        "update_paths": 10,
        "fit_epochs": 5,
        "refresh_fit": false
    }"#;

    #[test]
    fn optional_keys_take_defaults() -> Result<()> {
        let config = JobConfig::from_json(MINIMAL)?;
        assert_eq!(config.eval_rollouts, 0);
        assert_eq!(config.save_freq, 10);
        assert_eq!(config.device, DeviceKind::Cpu);
        assert_eq!(config.hvp_frac, 1.);
        assert_eq!(config.start_state, StartState::Init);
        assert!(config.learn_reward);
        assert_eq!(config.replay_buffer_size, 1_000_000);
        assert_eq!(config.buffer_frac, None);
        assert!(!config.refresh_policy);
        assert_eq!(config.hidden_size, vec![64, 64]);
        assert_eq!(config.activation, Activation::Relu);
        assert_eq!(config.baseline_action_samples, 4);
        Ok(())
    }

    #[test]
    fn invalid_start_state_is_a_config_error() {
        let json = MINIMAL.replace("\"refresh_fit\": false", "\"refresh_fit\": false, \"start_state\": \"random\"");
        let err = JobConfig::from_json(&json).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_required_key_is_a_config_error() {
        let json = MINIMAL.replace("\"seed\": 123,", "");
        let err = JobConfig::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("seed"));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let json = MINIMAL.replace("\"num_models\": 2", "\"num_models\": 0");
        let err = JobConfig::from_json(&json).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidValue { key: "num_models", .. })
        ));
    }

    #[test]
    fn buffer_split_follows_fraction() -> Result<()> {
        let mut config = JobConfig::from_json(MINIMAL)?;
        assert_eq!(config.buffer_start_split(), (5, 5));
        config.buffer_frac = Some(0.25);
        assert_eq!(config.buffer_start_split(), (8, 3));
        Ok(())
    }

    #[test]
    fn buffer_start_without_fraction_needs_two_paths() -> Result<()> {
        let json = MINIMAL.replace(
            "\"update_paths\": 10",
            "\"update_paths\": 1, \"start_state\": \"buffer\"",
        );
        let err = JobConfig::from_json(&json).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidValue { key: "update_paths", .. })
        ));

        let with_frac = json.replace("\"start_state\"", "\"buffer_frac\": 0.5, \"start_state\"");
        let config = JobConfig::from_json(&with_frac)?;
        assert_eq!(config.buffer_start_split(), (1, 1));
        Ok(())
    }

    #[test]
    fn log_std_floor_may_exceed_initial_value() -> Result<()> {
        let json = MINIMAL.replace("\"min_log_std\": -2.0", "\"min_log_std\": 0.0");
        let config = JobConfig::from_json(&json)?;
        assert_eq!(config.min_log_std, 0.);
        Ok(())
    }
}
