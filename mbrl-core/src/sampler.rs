use crate::{
    env::{Env, SnapShot},
    error::ConfigError,
    models::ModelEnsemble,
    path::{Path, rows_to_tensor},
    policies::Policy,
};
use anyhow::Result;
use rand::{Rng, rngs::StdRng};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
pub enum CollectionBound {
    Trajectories(usize),
    /// Whole paths are collected until at least this many steps exist.
    Samples(usize),
}

/// Lazily rolls out paths in the real environment. The iterator stops after the first error.
pub struct EnvPathIter<'a, E: Env + ?Sized, P: Policy> {
    env: &'a mut E,
    policy: &'a P,
    rng: &'a mut StdRng,
    eval_mode: bool,
    horizon: usize,
    bound: CollectionBound,
    paths_done: usize,
    steps_done: usize,
    failed: bool,
}

impl<'a, E: Env + ?Sized, P: Policy> EnvPathIter<'a, E, P> {
    pub fn new(
        env: &'a mut E,
        policy: &'a P,
        rng: &'a mut StdRng,
        eval_mode: bool,
        horizon: usize,
        bound: CollectionBound,
    ) -> Self {
        Self {
            env,
            policy,
            rng,
            eval_mode,
            horizon,
            bound,
            paths_done: 0,
            steps_done: 0,
            failed: false,
        }
    }

    fn rollout(&mut self) -> Result<Path> {
        let seed = self.rng.random::<u64>();
        let mut path = Path::new(self.env.reset(seed)?);
        for _ in 0..self.horizon {
            let (action, info) = self.policy.get_action(path.last_observation(), self.rng)?;
            let action = if self.eval_mode {
                info.evaluation
            } else {
                action
            };
            let SnapShot {
                state,
                reward,
                terminated,
                truncated,
            } = self.env.step(&action)?;
            path.push_step(action, info.mean, reward, state);
            if terminated {
                path.terminated = true;
                break;
            }
            if truncated {
                break;
            }
        }
        path.success = self.env.path_success(&path);
        Ok(path)
    }
}

impl<E: Env + ?Sized, P: Policy> Iterator for EnvPathIter<'_, E, P> {
    type Item = Result<Path>;

    fn next(&mut self) -> Option<Self::Item> {
        let exhausted = match self.bound {
            CollectionBound::Trajectories(n) => self.paths_done >= n,
            CollectionBound::Samples(n) => self.steps_done >= n,
        };
        if exhausted || self.failed {
            return None;
        }
        match self.rollout() {
            Ok(path) => {
                self.paths_done += 1;
                self.steps_done += path.len();
                Some(Ok(path))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

pub fn sample_data_batch<E: Env + ?Sized, P: Policy>(
    num_samples: usize,
    env: &mut E,
    policy: &P,
    eval_mode: bool,
    horizon: usize,
    rng: &mut StdRng,
) -> Result<Vec<Path>> {
    let bound = CollectionBound::Samples(num_samples);
    EnvPathIter::new(env, policy, rng, eval_mode, horizon, bound).collect()
}

pub fn sample_paths<E: Env + ?Sized, P: Policy>(
    num_traj: usize,
    env: &mut E,
    policy: &P,
    eval_mode: bool,
    horizon: usize,
    rng: &mut StdRng,
) -> Result<Vec<Path>> {
    let bound = CollectionBound::Trajectories(num_traj);
    EnvPathIter::new(env, policy, rng, eval_mode, horizon, bound).collect()
}

/// Real environment rollouts with the deterministic mean action.
pub fn evaluate_policy<E: Env + ?Sized, P: Policy>(
    env: &mut E,
    policy: &P,
    num_episodes: usize,
    horizon: usize,
    rng: &mut StdRng,
) -> Result<Vec<Path>> {
    sample_paths(num_episodes, env, policy, true, horizon, rng)
}

/// Lazily rolls out paths in the learned models. Path `i` is simulated by ensemble member
/// `i mod K`; the paths of one member are rolled out as a batch the first time one of them is
/// requested. Paths are yielded grouped by member.
pub struct ModelPathIter<'a, E: Env + ?Sized, P: Policy> {
    ensemble: &'a ModelEnsemble,
    env: &'a E,
    policy: &'a P,
    rng: &'a mut StdRng,
    eval_mode: bool,
    horizon: usize,
    pending: VecDeque<(usize, Vec<Vec<f32>>)>,
    ready: VecDeque<Path>,
}

impl<'a, E: Env + ?Sized, P: Policy> ModelPathIter<'a, E, P> {
    pub fn new(
        ensemble: &'a ModelEnsemble,
        env: &'a E,
        policy: &'a P,
        init_states: &[Vec<f32>],
        horizon: usize,
        eval_mode: bool,
        rng: &'a mut StdRng,
    ) -> Self {
        let num_models = ensemble.len().max(1);
        let mut groups = vec![vec![]; num_models];
        for (idx, state) in init_states.iter().enumerate() {
            groups[idx % num_models].push(state.clone());
        }
        let pending = groups
            .into_iter()
            .enumerate()
            .filter(|(_, states)| !states.is_empty())
            .collect();
        Self {
            ensemble,
            env,
            policy,
            rng,
            eval_mode,
            horizon,
            pending,
            ready: VecDeque::new(),
        }
    }

    fn rollout_member(&mut self, member: usize, init_states: Vec<Vec<f32>>) -> Result<()> {
        let ensemble = self.ensemble;
        let model = &ensemble.members()[member];
        let obs_dim = model.state_dim();
        let device = self.policy.device().clone();
        let mut paths: Vec<Path> = init_states.into_iter().map(Path::new).collect();
        let mut active: Vec<usize> = (0..paths.len()).collect();
        for _ in 0..self.horizon {
            if active.is_empty() {
                break;
            }
            let rows: Vec<Vec<f32>> = active
                .iter()
                .map(|idx| paths[*idx].last_observation().to_vec())
                .collect();
            let obs = rows_to_tensor(&rows, obs_dim, &device)?;
            let actions = self
                .policy
                .get_action_batch(&obs, self.rng, self.eval_mode)?;
            let means = self.policy.get_action_batch(&obs, self.rng, true)?;
            let next_obs = model.predict(&obs, &actions)?;
            let learned_rewards = if model.has_reward() {
                Some(model.predict_reward(&obs, &actions)?.to_vec1::<f32>()?)
            } else {
                None
            };
            let actions = actions.to_vec2::<f32>()?;
            let means = means.to_vec2::<f32>()?;
            let next_obs = next_obs.to_vec2::<f32>()?;
            let mut still_active = Vec::with_capacity(active.len());
            for (row, path_idx) in active.iter().enumerate() {
                let next = &next_obs[row];
                if next.iter().any(|x| !x.is_finite()) {
                    tracing::debug!(member, step = paths[*path_idx].len(), "model rollout diverged");
                    continue;
                }
                let reward = match &learned_rewards {
                    Some(rewards) => rewards[row],
                    None => self
                        .env
                        .reward(&rows[row], &actions[row], next)
                        .ok_or_else(|| ConfigError::RewardUnavailable {
                            env: self.env.name().to_string(),
                        })?,
                };
                let path = &mut paths[*path_idx];
                path.push_step(actions[row].clone(), means[row].clone(), reward, next.clone());
                if self.env.is_terminal(next) {
                    path.terminated = true;
                } else {
                    still_active.push(*path_idx);
                }
            }
            active = still_active;
        }
        for mut path in paths.into_iter().filter(|path| !path.is_empty()) {
            path.success = self.env.path_success(&path);
            self.ready.push_back(path);
        }
        Ok(())
    }
}

impl<E: Env + ?Sized, P: Policy> Iterator for ModelPathIter<'_, E, P> {
    type Item = Result<Path>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(path) = self.ready.pop_front() {
                return Some(Ok(path));
            }
            let (member, states) = self.pending.pop_front()?;
            if let Err(err) = self.rollout_member(member, states) {
                self.pending.clear();
                return Some(Err(err));
            }
        }
    }
}
