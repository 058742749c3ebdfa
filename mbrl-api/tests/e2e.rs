use anyhow::{Result, bail};
use mbrl_api::{
    checkpoint::{agent_file, load_agent, load_policy, policy_file},
    config::JobConfig,
    logger::{DataLog, LOG_FILE},
    plot::PLOT_FILE,
    run_job,
    trainer::{DefaultTrainerHooks, HookResult, Trainer, TrainerHooks},
};
use mbrl_core::{
    Algorithm,
    env::{Env, EnvironmentDescription, SnapShot},
    error::ConfigError,
    path::Path,
};
use mbrl_envs::{PointMass, make_env};
use std::path::Path as FsPath;

fn job(extra: &str) -> Result<JobConfig> {
    let json = format!(
        r#"{{
            "env_name": "point_mass_1d",
            "seed": 7,
            "num_models": 1,
            "policy_size": [8],
            "init_log_std": -0.5,
            "min_log_std": -2.0,
            "step_size": 0.05,
            "horizon": 5,
            "num_iter": 2,
            "init_samples": 50,
            "iter_samples": 20,
            "buffer_size": 1000,
            "inner_steps": 1,
            "update_paths": 4,
            "fit_epochs": 2,
            "refresh_fit": false,
            "hidden_size": [16],
            "baseline_size": [16],
            "fit_mb_size": 32,
            "baseline_batch_size": 32{extra}
        }}"#
    );
    JobConfig::from_json(&json)
}

fn read_log(dir: &FsPath) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let written = std::fs::read_to_string(dir.join(LOG_FILE))?;
    let mut lines = written
        .lines()
        .map(|line| line.split(',').map(String::from).collect::<Vec<_>>());
    let headers = lines.next().unwrap_or_default();
    Ok((headers, lines.collect()))
}

fn column(headers: &[String], rows: &[Vec<String>], key: &str) -> Vec<f32> {
    let idx = headers.iter().position(|h| h == key).expect("column is logged");
    rows.iter().map(|row| row[idx].parse().expect("numeric cell")).collect()
}

#[test]
fn point_mass_job_writes_log_and_final_checkpoint() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("run");
    run_job(&output, job(r#", "eval_rollouts": 1"#)?)?;

    let (headers, rows) = read_log(&output)?;
    assert_eq!(rows.len(), 2);
    let occupancy = column(&headers, &rows, "buffer_occupancy");
    assert!(occupancy.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(column(&headers, &rows, "iter_samples"), vec![50., 25.]);
    for key in ["rollout_score", "dyn_loss_0", "dyn_loss_gen_0", "rew_loss_0", "alpha", "kl_dist", "eval_score", "iter_time"] {
        assert!(headers.iter().any(|h| h == key), "missing {key}");
    }

    assert!(output.join("job_data.json").exists());
    assert!(output.join(PLOT_FILE).exists());
    assert!(agent_file(&output, "final").exists());
    assert!(policy_file(&output, "final").exists());
    assert!(!agent_file(&output, "0").exists());
    assert!(!agent_file(&output, "1").exists());

    let device = candle_core::Device::Cpu;
    let (agent, buffer) = load_agent(&agent_file(&output, "final"), &device)?;
    assert_eq!(buffer.len(), 75);
    let policy = load_policy(&policy_file(&output, "final"), &device)?;
    assert_eq!(policy.get_param_values()?, agent.policy.get_param_values()?);
    Ok(())
}

#[test]
fn intermediate_checkpoints_follow_save_freq() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = job(r#", "save_freq": 1, "start_state": "buffer", "buffer_frac": 0.5"#)?;
    run_job(dir.path(), config)?;
    assert!(!agent_file(dir.path(), "0").exists());
    assert!(agent_file(dir.path(), "1").exists());
    assert!(policy_file(dir.path(), "1").exists());
    assert!(agent_file(dir.path(), "final").exists());
    Ok(())
}

#[test]
fn refreshed_models_and_policy_with_fisher_subsampling() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = job("")?;
    config.refresh_fit = true;
    config.refresh_policy = true;
    config.hvp_frac = 0.5;
    run_job(dir.path(), config)?;

    let (headers, rows) = read_log(dir.path())?;
    assert_eq!(rows.len(), 2);
    assert!(column(&headers, &rows, "alpha").iter().all(|a| a.is_finite() && *a > 0.));
    assert!(column(&headers, &rows, "dyn_loss_0").iter().all(|l| l.is_finite()));
    assert!(agent_file(dir.path(), "final").exists());
    Ok(())
}

#[test]
fn initial_policy_is_loaded_and_checked() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let first = dir.path().join("first");
    run_job(&first, job("")?)?;
    let saved = policy_file(&first, "final");
    let expected = load_policy(&saved, &candle_core::Device::Cpu)?.get_param_values()?;

    let mut config = job("")?;
    config.init_policy = Some(saved.clone());
    let trainer = Trainer::new(
        config,
        make_env("point_mass_1d")?,
        dir.path().join("second"),
        DefaultTrainerHooks,
    )?;
    assert_eq!(trainer.agent().policy.get_param_values()?, expected);

    let mut config = job("")?;
    config.env_name = "point_mass".to_string();
    config.init_policy = Some(saved);
    let err = Trainer::new(
        config,
        make_env("point_mass")?,
        dir.path().join("third"),
        DefaultTrainerHooks,
    )
    .err()
    .expect("policy dimensions do not match the environment");
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::InvalidValue { key: "init_policy", .. })
    ));
    Ok(())
}

/// Point mass whose success metric always fails and whose analytic reward can be hidden.
struct FlakyMetric {
    inner: PointMass,
    analytic_reward: bool,
}

impl Env for FlakyMetric {
    fn name(&self) -> &str {
        "flaky_metric"
    }

    fn reset(&mut self, seed: u64) -> Result<Vec<f32>> {
        self.inner.reset(seed)
    }

    fn step(&mut self, action: &[f32]) -> Result<SnapShot> {
        self.inner.step(action)
    }

    fn env_description(&self) -> EnvironmentDescription {
        self.inner.env_description()
    }

    fn horizon(&self) -> usize {
        self.inner.horizon()
    }

    fn reward(&self, state: &[f32], action: &[f32], next_state: &[f32]) -> Option<f32> {
        self.analytic_reward
            .then(|| self.inner.reward(state, action, next_state))
            .flatten()
    }

    fn evaluate_success(&self, _paths: &[Path]) -> Result<Option<f32>> {
        bail!("success metric is broken")
    }
}

struct StopAfterFirst {
    iterations: usize,
}

impl TrainerHooks for StopAfterFirst {
    fn post_iteration_hook(&mut self, _iter: usize, log: &DataLog) -> Result<HookResult> {
        self.iterations += 1;
        assert_eq!(log.num_rows(), self.iterations);
        Ok(HookResult::Break)
    }
}

#[test]
fn failing_metric_is_omitted_and_hooks_can_stop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let env = Box::new(FlakyMetric {
        inner: PointMass::new(1),
        analytic_reward: true,
    });
    let config = job(r#", "eval_rollouts": 1, "learn_reward": false"#)?;
    let hooks = StopAfterFirst { iterations: 0 };
    let mut trainer = Trainer::new(config, env, dir.path().to_path_buf(), hooks)?;
    trainer.train()?;

    let log = trainer.log();
    assert_eq!(log.num_rows(), 1);
    assert!(log.columns().iter().all(|c| c != "rollout_metric" && c != "eval_metric"));
    assert!(log.columns().iter().all(|c| c != "rew_loss_0"));
    assert!(log.latest("eval_score").is_some());
    assert!(agent_file(dir.path(), "final").exists());
    Ok(())
}

#[test]
fn configuration_errors_stop_before_training() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let mut config = job("")?;
    config.env_name = "half_cheetah".to_string();
    let err = run_job(dir.path(), config).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::UnknownEnv { .. })
    ));

    let env = Box::new(FlakyMetric {
        inner: PointMass::new(1),
        analytic_reward: false,
    });
    let config = job(r#", "learn_reward": false"#)?;
    let err = Trainer::new(config, env, dir.path().to_path_buf(), StopAfterFirst { iterations: 0 })
        .err()
        .expect("reward is neither learned nor analytic");
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::RewardUnavailable { .. })
    ));

    let err = job(r#", "start_state": "anywhere""#).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::Parse { .. })
    ));
    assert!(!dir.path().join(LOG_FILE).exists());
    Ok(())
}
