pub mod gaussian_mlp;

pub use gaussian_mlp::GaussianMlp;

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use std::fmt::Debug;

/// Per step information returned alongside a sampled action.
#[derive(Debug, Clone)]
pub struct ActionInfo {
    pub mean: Vec<f32>,
    pub log_std: Vec<f32>,
    /// The action used in evaluation mode.
    pub evaluation: Vec<f32>,
}

/// Distribution parameters of one generation evaluated on a batch.
#[derive(Debug, Clone)]
pub struct DistInfo {
    pub ll: Tensor,
    pub mean: Tensor,
    pub log_std: Tensor,
}

pub trait Policy: Debug {
    fn observation_dim(&self) -> usize;

    fn action_dim(&self) -> usize;

    fn get_action(&self, observation: &[f32], rng: &mut StdRng) -> Result<(Vec<f32>, ActionInfo)>;

    /// Batched sampling on `(n, obs_dim)` observations. With `mean_action` the noise is skipped.
    fn get_action_batch(
        &self,
        observations: &Tensor,
        rng: &mut StdRng,
        mean_action: bool,
    ) -> Result<Tensor>;

    fn log_likelihood(&self, observations: &Tensor, actions: &Tensor) -> Result<Tensor>;

    fn std(&self) -> Result<f32>;

    fn entropy(&self) -> Result<f32>;

    fn device(&self) -> &Device;
}
