use crate::path::Path;
use anyhow::Result;

#[derive(Debug, Clone)]
pub enum Space {
    Discrete(usize),
    Continous {
        min: Option<Vec<f32>>,
        max: Option<Vec<f32>>,
        size: usize,
    },
}

impl Space {
    pub fn continous_from_dims(dims: Vec<usize>) -> Self {
        Self::Continous {
            min: None,
            max: None,
            size: dims.iter().product(),
        }
    }

    pub fn bounded(min: Vec<f32>, max: Vec<f32>) -> Self {
        let size = min.len();
        Self::Continous {
            min: Some(min),
            max: Some(max),
            size,
        }
    }

    pub fn size(&self) -> usize {
        match &self {
            Self::Discrete(size) => *size,
            Self::Continous { size, .. } => *size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvironmentDescription {
    pub observation_space: Space,
    pub action_space: Space,
}

impl EnvironmentDescription {
    pub fn new(observation_space: Space, action_space: Space) -> Self {
        Self {
            observation_space,
            action_space,
        }
    }

    pub fn action_size(&self) -> usize {
        self.action_space.size()
    }

    pub fn observation_size(&self) -> usize {
        self.observation_space.size()
    }
}

pub struct SnapShot {
    pub state: Vec<f32>,
    pub reward: f32,
    pub terminated: bool,
    pub truncated: bool,
}

pub trait Env {
    fn name(&self) -> &str;

    fn reset(&mut self, seed: u64) -> Result<Vec<f32>>;

    fn step(&mut self, action: &[f32]) -> Result<SnapShot>;

    fn env_description(&self) -> EnvironmentDescription;

    /// Maximum number of steps of a real episode.
    fn horizon(&self) -> usize;

    /// Analytic reward, used for learned model rollouts when the reward is not learned.
    fn reward(&self, _state: &[f32], _action: &[f32], _next_state: &[f32]) -> Option<f32> {
        None
    }

    /// Termination function applied to learned model rollouts.
    fn is_terminal(&self, _state: &[f32]) -> bool {
        false
    }

    /// Whether a finished path solved the task. `None` means the environment has no success test.
    fn path_success(&self, _path: &Path) -> Option<bool> {
        None
    }

    /// Domain specific success metric. `Ok(None)` means the environment has none.
    fn evaluate_success(&self, _paths: &[Path]) -> Result<Option<f32>> {
        Ok(None)
    }
}

impl<E: Env + ?Sized> Env for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn reset(&mut self, seed: u64) -> Result<Vec<f32>> {
        (**self).reset(seed)
    }

    fn step(&mut self, action: &[f32]) -> Result<SnapShot> {
        (**self).step(action)
    }

    fn env_description(&self) -> EnvironmentDescription {
        (**self).env_description()
    }

    fn horizon(&self) -> usize {
        (**self).horizon()
    }

    fn reward(&self, state: &[f32], action: &[f32], next_state: &[f32]) -> Option<f32> {
        (**self).reward(state, action, next_state)
    }

    fn is_terminal(&self, state: &[f32]) -> bool {
        (**self).is_terminal(state)
    }

    fn path_success(&self, path: &Path) -> Option<bool> {
        (**self).path_success(path)
    }

    fn evaluate_success(&self, paths: &[Path]) -> Result<Option<f32>> {
        (**self).evaluate_success(paths)
    }
}
