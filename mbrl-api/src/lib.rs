pub mod checkpoint;
pub mod config;
pub mod logger;
pub mod plot;
pub mod trainer;

use anyhow::{Context, Result};
use config::JobConfig;
use mbrl_core::Algorithm;
use mbrl_envs::make_env;
use std::path::Path;
use trainer::{DefaultTrainerHooks, Trainer};

/// Runs the training job described by `config`, writing every artifact to `output`.
pub fn run_job(output: &Path, config: JobConfig) -> Result<()> {
    std::fs::create_dir_all(output)
        .with_context(|| format!("creating output directory {}", output.display()))?;
    config.write_job_data(output)?;
    let env = make_env(&config.env_name)?;
    tracing::info!(env = %config.env_name, seed = config.seed, "starting job");
    let mut trainer = Trainer::new(config, env, output.to_path_buf(), DefaultTrainerHooks)?;
    trainer.train()
}

/// Reads the job configuration from `config_path` and runs it.
pub fn run_job_file(output: &Path, config_path: &Path) -> Result<()> {
    let config = JobConfig::from_file(config_path)?;
    run_job(output, config)
}
