use anyhow::Result;
use candle_core::{Device, Tensor};

/// A single rollout. `observations` holds one more entry than `actions`, the last one being the
/// state the rollout ended in.
#[derive(Debug, Clone, Default)]
pub struct Path {
    pub observations: Vec<Vec<f32>>,
    pub actions: Vec<Vec<f32>>,
    pub rewards: Vec<f32>,
    /// Policy mean of every step.
    pub means: Vec<Vec<f32>>,
    pub terminated: bool,
    /// Set by the environment's success test, `None` when it has none.
    pub success: Option<bool>,
}

impl Path {
    pub fn new(initial_observation: Vec<f32>) -> Self {
        Self {
            observations: vec![initial_observation],
            ..Default::default()
        }
    }

    pub fn push_step(
        &mut self,
        action: Vec<f32>,
        mean: Vec<f32>,
        reward: f32,
        next_observation: Vec<f32>,
    ) {
        self.actions.push(action);
        self.means.push(mean);
        self.rewards.push(reward);
        self.observations.push(next_observation);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn total_reward(&self) -> f32 {
        self.rewards.iter().sum()
    }

    pub fn initial_observation(&self) -> &[f32] {
        &self.observations[0]
    }

    pub fn last_observation(&self) -> &[f32] {
        &self.observations[self.observations.len() - 1]
    }
}

pub fn total_steps(paths: &[Path]) -> usize {
    paths.iter().map(Path::len).sum()
}

pub fn mean_score<'a>(paths: impl IntoIterator<Item = &'a Path>) -> f32 {
    let (sum, count) = paths
        .into_iter()
        .fold((0f32, 0usize), |(sum, count), p| (sum + p.total_reward(), count + 1));
    if count == 0 { 0. } else { sum / count as f32 }
}

/// Row major, flattened transition fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionBatch {
    pub obs_dim: usize,
    pub act_dim: usize,
    pub s: Vec<f32>,
    pub a: Vec<f32>,
    pub r: Vec<f32>,
    pub sp: Vec<f32>,
    pub terminated: Vec<bool>,
}

pub struct TransitionTensors {
    pub s: Tensor,
    pub a: Tensor,
    pub r: Tensor,
    pub sp: Tensor,
}

impl TransitionBatch {
    pub fn empty(obs_dim: usize, act_dim: usize) -> Self {
        Self {
            obs_dim,
            act_dim,
            ..Default::default()
        }
    }

    /// Flattens paths in order. Only the last transition of a path can carry the terminal flag.
    pub fn from_paths<'a>(
        paths: impl IntoIterator<Item = &'a Path>,
        obs_dim: usize,
        act_dim: usize,
    ) -> Self {
        let mut batch = Self::empty(obs_dim, act_dim);
        for path in paths {
            let steps = path.len();
            for t in 0..steps {
                batch.push(
                    &path.observations[t],
                    &path.actions[t],
                    path.rewards[t],
                    &path.observations[t + 1],
                    path.terminated && t + 1 == steps,
                );
            }
        }
        batch
    }

    pub fn push(&mut self, s: &[f32], a: &[f32], r: f32, sp: &[f32], terminated: bool) {
        self.s.extend_from_slice(s);
        self.a.extend_from_slice(a);
        self.r.push(r);
        self.sp.extend_from_slice(sp);
        self.terminated.push(terminated);
    }

    pub fn len(&self) -> usize {
        self.r.len()
    }

    pub fn is_empty(&self) -> bool {
        self.r.is_empty()
    }

    pub fn state(&self, idx: usize) -> &[f32] {
        &self.s[idx * self.obs_dim..(idx + 1) * self.obs_dim]
    }

    /// The newest `n` transitions (or all of them if there are fewer).
    pub fn tail(&self, n: usize) -> Self {
        let start = self.len().saturating_sub(n);
        Self {
            obs_dim: self.obs_dim,
            act_dim: self.act_dim,
            s: self.s[start * self.obs_dim..].to_vec(),
            a: self.a[start * self.act_dim..].to_vec(),
            r: self.r[start..].to_vec(),
            sp: self.sp[start * self.obs_dim..].to_vec(),
            terminated: self.terminated[start..].to_vec(),
        }
    }

    pub fn to_tensors(&self, device: &Device) -> Result<TransitionTensors> {
        let n = self.len();
        Ok(TransitionTensors {
            s: Tensor::from_slice(&self.s, (n, self.obs_dim), device)?,
            a: Tensor::from_slice(&self.a, (n, self.act_dim), device)?,
            r: Tensor::from_slice(&self.r, (n, 1), device)?,
            sp: Tensor::from_slice(&self.sp, (n, self.obs_dim), device)?,
        })
    }
}

/// Stacks equally sized rows into a `(rows, dim)` tensor.
pub fn rows_to_tensor(rows: &[Vec<f32>], dim: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(data, (rows.len(), dim), device)?)
}
