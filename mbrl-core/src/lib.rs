pub mod env;
pub mod error;
pub mod models;
pub mod path;
pub mod policies;
pub mod replay_buffer;
pub mod rng;
pub mod sampler;
pub mod sequential;
pub mod tensors;
pub mod utils;

use anyhow::Result;

/// A learning algorithm. Currently only the model based trainer implements this trait.
pub trait Algorithm {
    fn train(&mut self) -> Result<()>;
}
