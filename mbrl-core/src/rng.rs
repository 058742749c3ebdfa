// Every component receives its generator explicitly, there is no global generator state.

use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn standard_normal(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.sample::<f32, _>(StandardNormal)).collect()
}

/// Uniform draws with replacement from `0..upper`.
pub fn sample_indices(rng: &mut StdRng, upper: usize, n: usize) -> Vec<usize> {
    (0..n).map(|_| rng.random_range(0..upper)).collect()
}
