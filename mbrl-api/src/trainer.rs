use crate::{
    checkpoint::{load_policy, save_checkpoint},
    config::{JobConfig, StartState},
    logger::DataLog,
    plot::make_train_plots,
};
use anyhow::Result;
use candle_core::Device;
use mbrl_agents::{baseline::QBaseline, npg::Npg};
use mbrl_core::{
    Algorithm,
    env::Env,
    error::ConfigError,
    models::ModelEnsemble,
    path::{Path, TransitionBatch, mean_score, total_steps},
    policies::{GaussianMlp, Policy},
    replay_buffer::ReplayBuffer,
    rng::{sample_indices, seeded},
    sampler::{evaluate_policy, sample_data_batch},
    sequential::Activation,
};
use rand::rngs::StdRng;
use std::{collections::VecDeque, path::PathBuf, time::Instant};

const PLOT_KEYS: [&str; 4] = ["rollout_score", "eval_score", "rollout_metric", "eval_metric"];
const SAMPLE_KEY: &str = "iter_samples";

pub enum HookResult {
    Continue,
    Break,
}

macro_rules! process_hook_result {
    ($hook_res:expr) => {
        match $hook_res? {
            HookResult::Continue => {}
            HookResult::Break => break,
        }
    };
}

pub trait TrainerHooks {
    fn init_hook(&mut self, _config: &JobConfig) -> Result<HookResult> {
        Ok(HookResult::Continue)
    }

    /// Called once the metrics of iteration `iter` are in the log.
    fn post_iteration_hook(&mut self, iter: usize, log: &DataLog) -> Result<HookResult>;

    fn shutdown_hook(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct DefaultTrainerHooks;

impl TrainerHooks for DefaultTrainerHooks {
    fn post_iteration_hook(&mut self, iter: usize, log: &DataLog) -> Result<HookResult> {
        tracing::info!(
            iter,
            rollout_score = log.latest("rollout_score"),
            running_score = log.latest("running_score"),
            eval_score = log.latest("eval_score"),
            buffer_occupancy = log.latest("buffer_occupancy"),
            iter_time = log.latest("iter_time"),
            "iteration finished"
        );
        Ok(HookResult::Continue)
    }
}

fn fresh_policy(config: &JobConfig, obs_dim: usize, act_dim: usize, device: &Device) -> Result<GaussianMlp> {
    GaussianMlp::new(
        obs_dim,
        act_dim,
        &config.policy_size,
        Activation::Tanh,
        config.init_log_std,
        config.min_log_std,
        config.seed,
        device,
    )
}

/// Failures of the optional success metric only cost the metric.
fn success_metric(env: &dyn Env, paths: &[Path], iter: usize, component: &str) -> Option<f32> {
    match env.evaluate_success(paths) {
        Ok(metric) => metric,
        Err(err) => {
            tracing::warn!(iter, component, error = %err, "success metric failed");
            None
        }
    }
}

/// Alternates real data collection, world model fitting and natural gradient steps on rollouts
/// in the fitted models.
pub struct Trainer<H: TrainerHooks = DefaultTrainerHooks> {
    config: JobConfig,
    output: PathBuf,
    env: Box<dyn Env>,
    agent: Npg,
    replay_buffer: ReplayBuffer,
    // most recent real paths, at most `buffer_size` transitions
    paths: VecDeque<Path>,
    init_states: Vec<Vec<f32>>,
    device: Device,
    rng: StdRng,
    log: DataLog,
    hooks: H,
}

impl<H: TrainerHooks> Trainer<H> {
    pub fn new(config: JobConfig, env: Box<dyn Env>, output: PathBuf, hooks: H) -> Result<Self> {
        config.validate()?;
        let description = env.env_description();
        let (obs_dim, act_dim) = (description.observation_size(), description.action_size());
        let (state, action) = (vec![0.; obs_dim], vec![0.; act_dim]);
        if !config.learn_reward && env.reward(&state, &action, &state).is_none() {
            return Err(ConfigError::RewardUnavailable {
                env: env.name().to_string(),
            }
            .into());
        }
        let device = config.device()?;

        let policy = match &config.init_policy {
            Some(path) => {
                let policy = load_policy(path, &device)?;
                if policy.observation_dim() != obs_dim || policy.action_dim() != act_dim {
                    return Err(ConfigError::InvalidValue {
                        key: "init_policy",
                        reason: format!(
                            "policy maps {} observations to {} actions, environment needs {obs_dim} to {act_dim}",
                            policy.observation_dim(),
                            policy.action_dim()
                        ),
                    }
                    .into());
                }
                tracing::info!(path = %path.display(), "loaded initial policy");
                policy
            }
            None => fresh_policy(&config, obs_dim, act_dim, &device)?,
        };
        let baseline = QBaseline::new(obs_dim, act_dim, config.baseline_config(), config.seed, &device)?;
        let ensemble = ModelEnsemble::new(
            config.num_models,
            obs_dim,
            act_dim,
            config.world_model_config(),
            config.seed,
            &device,
        )?;
        let agent = Npg::new(policy, baseline, ensemble, config.npg_config());
        let replay_buffer = ReplayBuffer::new(config.replay_buffer_size, obs_dim, act_dim);
        let rng = seeded(config.seed);
        Ok(Self {
            config,
            output,
            env,
            agent,
            replay_buffer,
            paths: VecDeque::new(),
            init_states: vec![],
            device,
            rng,
            log: DataLog::new(),
            hooks,
        })
    }

    pub fn agent(&self) -> &Npg {
        &self.agent
    }

    pub fn log(&self) -> &DataLog {
        &self.log
    }

    pub fn replay_buffer(&self) -> &ReplayBuffer {
        &self.replay_buffer
    }

    fn obs_dim(&self) -> usize {
        self.agent.policy.observation_dim()
    }

    fn act_dim(&self) -> usize {
        self.agent.policy.action_dim()
    }

    /// Collects real data with the current policy and ingests it. Returns the number of collected
    /// transitions.
    fn collect_real_data(&mut self, iter: usize) -> Result<usize> {
        let samples_to_collect = if iter == 0 {
            self.config.init_samples
        } else {
            self.config.iter_samples
        };
        let horizon = self.env.horizon();
        let mut data_rng = seeded(self.config.seed + iter as u64);
        let iter_paths = sample_data_batch(
            samples_to_collect,
            &mut self.env,
            &self.agent.policy,
            false,
            horizon,
            &mut data_rng,
        )?;

        let batch = TransitionBatch::from_paths(&iter_paths, self.obs_dim(), self.act_dim());
        self.replay_buffer.store(&batch);
        self.init_states
            .extend(iter_paths.iter().map(|path| path.initial_observation().to_vec()));

        self.log.log_kv("fit_epochs", self.config.fit_epochs as f32);
        self.log.log_kv("rollout_score", mean_score(&iter_paths));
        self.log.log_kv("iter_samples", total_steps(&iter_paths) as f32);
        self.log.log_kv("buffer_occupancy", self.replay_buffer.len() as f32);
        if let Some(metric) = success_metric(self.env.as_ref(), &iter_paths, iter, "rollout") {
            self.log.log_kv("rollout_metric", metric);
        }

        self.paths.extend(iter_paths);
        while self.paths.len() > 1
            && total_steps(self.paths.make_contiguous()) > self.config.buffer_size
        {
            self.paths.pop_front();
        }
        Ok(samples_to_collect)
    }

    fn fit_models(&mut self, iter: usize, samples_to_collect: usize) -> Result<()> {
        if self.config.refresh_fit {
            let seed = self.config.seed + 123 * iter as u64;
            self.agent.learned_model.refresh(seed, &self.device)?;
        }
        let data = TransitionBatch::from_paths(self.paths.iter(), self.obs_dim(), self.act_dim());
        let newest = data.tail(samples_to_collect);
        let reports = self
            .agent
            .learned_model
            .fit(&data, &newest, &self.device, &mut self.rng)?;
        for (idx, report) in reports.iter().enumerate() {
            self.log.log_kv(&format!("dyn_loss_{idx}"), report.dynamics_loss);
            self.log
                .log_kv(&format!("dyn_loss_gen_{idx}"), report.generalization_loss);
            if let Some(reward_loss) = report.reward_loss {
                self.log.log_kv(&format!("rew_loss_{idx}"), reward_loss);
            }
            tracing::debug!(iter, model = idx, gap = report.generalization_gap(), "generalization gap");
        }
        Ok(())
    }

    fn start_states(&mut self) -> Vec<Vec<f32>> {
        let from_init = |count: usize, rng: &mut StdRng, init_states: &[Vec<f32>]| {
            sample_indices(rng, init_states.len(), count)
                .into_iter()
                .map(|idx| init_states[idx].clone())
                .collect::<Vec<_>>()
        };
        match self.config.start_state {
            StartState::Init => from_init(self.config.update_paths, &mut self.rng, &self.init_states),
            StartState::Buffer => {
                let (num_init, num_buffer) = self.config.buffer_start_split();
                let mut states = from_init(num_init, &mut self.rng, &self.init_states);
                states.extend(self.replay_buffer.sample_states(num_buffer, &mut self.rng));
                states
            }
        }
    }

    fn improve_policy(&mut self) -> Result<()> {
        for _ in 0..self.config.inner_steps {
            let init_states = self.start_states();
            let stats = self.agent.train_step(
                &init_states,
                self.config.horizon,
                self.env.as_ref(),
                &mut self.rng,
            )?;
            for (key, value) in stats.entries() {
                self.log.log_kv(key, value);
            }
        }
        self.log.log_kv("policy_std", self.agent.policy.std()?);
        Ok(())
    }

    fn evaluate(&mut self, iter: usize) -> Result<()> {
        if self.config.eval_rollouts == 0 {
            return Ok(());
        }
        let horizon = self.env.horizon();
        let eval_paths = evaluate_policy(
            &mut self.env,
            &self.agent.policy,
            self.config.eval_rollouts,
            horizon,
            &mut self.rng,
        )?;
        self.log.log_kv("eval_score", mean_score(&eval_paths));
        if let Some(metric) = success_metric(self.env.as_ref(), &eval_paths, iter, "eval") {
            self.log.log_kv("eval_metric", metric);
        }
        Ok(())
    }

    fn iteration(&mut self, iter: usize) -> Result<()> {
        let start = Instant::now();
        self.log.new_row();
        tracing::info!(iter, "collecting real environment data");
        let samples_to_collect = self.collect_real_data(iter)?;

        self.fit_models(iter, samples_to_collect)?;

        if self.config.refresh_policy {
            self.agent.policy = fresh_policy(&self.config, self.obs_dim(), self.act_dim(), &self.device)?;
        }

        self.improve_policy()?;
        self.evaluate(iter)?;

        if iter > 0 && iter % self.config.save_freq == 0 {
            save_checkpoint(&self.output, &iter.to_string(), &mut self.agent, &self.replay_buffer)?;
        }

        self.log.log_kv("iter_time", start.elapsed().as_secs_f32());
        self.log.save_log(&self.output)?;
        make_train_plots(&self.log, &PLOT_KEYS, SAMPLE_KEY, &self.output)?;
        Ok(())
    }
}

impl<H: TrainerHooks> Algorithm for Trainer<H> {
    fn train(&mut self) -> Result<()> {
        if let HookResult::Break = self.hooks.init_hook(&self.config)? {
            return self.hooks.shutdown_hook();
        }
        for iter in 0..self.config.num_iter {
            self.iteration(iter)?;
            process_hook_result!(self.hooks.post_iteration_hook(iter, &self.log));
        }
        save_checkpoint(&self.output, "final", &mut self.agent, &self.replay_buffer)?;
        self.hooks.shutdown_hook()
    }
}
