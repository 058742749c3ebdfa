pub mod fisher;

use crate::{baseline::QBaseline, conjugate_gradient::cg_solve};
use anyhow::{Result, bail};
use bincode::{
    Decode, Encode,
    de::Decoder,
    enc::Encoder,
    error::{DecodeError, EncodeError},
};
use candle_core::{Device, Tensor};
use fisher::FisherVectorProduct;
use mbrl_core::{
    env::Env,
    error::NumericalError,
    models::ModelEnsemble,
    path::{Path, mean_score, rows_to_tensor},
    policies::{GaussianMlp, Policy},
    sampler::ModelPathIter,
    tensors::{Advantages, Returns},
    utils::flat::dot,
};
use rand::{rngs::StdRng, seq::index::sample};
use std::time::Instant;

const CG_RESIDUAL_TOL: f32 = 1e-10;

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct NpgConfig {
    /// KL trust region radius `δ`.
    pub normalized_step_size: f32,
    pub gamma: f32,
    pub cg_iters: usize,
    pub cg_damping: f32,
    /// Fraction of the batch the Fisher-vector product is evaluated on.
    pub hvp_sample_frac: f32,
}

impl Default for NpgConfig {
    fn default() -> Self {
        Self {
            normalized_step_size: 0.05,
            gamma: 0.995,
            cg_iters: 10,
            cg_damping: 1e-4,
            hvp_sample_frac: 1.,
        }
    }
}

/// Diagnostics of one optimisation step.
#[derive(Debug, Clone, Default)]
pub struct NpgStats {
    pub alpha: f32,
    pub kl_dist: f32,
    pub surr_improvement: f32,
    pub running_score: f32,
    pub vpg_norm: f32,
    pub npg_norm: f32,
    pub curvature: f32,
    pub baseline_loss_before: f32,
    pub baseline_loss_after: f32,
    pub num_paths: usize,
    pub num_samples: usize,
    pub time_sampling: f32,
    pub time_vpg: f32,
    pub time_npg: f32,
    pub time_vf: f32,
}

impl NpgStats {
    pub fn entries(&self) -> Vec<(&'static str, f32)> {
        vec![
            ("alpha", self.alpha),
            ("kl_dist", self.kl_dist),
            ("surr_improvement", self.surr_improvement),
            ("running_score", self.running_score),
            ("vpg_norm", self.vpg_norm),
            ("npg_norm", self.npg_norm),
            ("curvature", self.curvature),
            ("baseline_loss_before", self.baseline_loss_before),
            ("baseline_loss_after", self.baseline_loss_after),
            ("time_sampling", self.time_sampling),
            ("time_vpg", self.time_vpg),
            ("time_npg", self.time_npg),
            ("time_VF", self.time_vf),
        ]
    }
}

/// Flattened model rollouts with their returns and normalised advantages.
pub struct ProcessedBatch {
    pub observations: Tensor,
    pub actions: Tensor,
    pub returns: Returns,
    pub advantages: Advantages,
}

struct StepStats {
    alpha: f32,
    kl_dist: f32,
    surr_improvement: f32,
    vpg_norm: f32,
    npg_norm: f32,
    curvature: f32,
    time_vpg: f32,
    time_npg: f32,
}

/// Solves `F x = g` with conjugate gradient and sizes the step so that the quadratic KL model
/// equals `δ`. Returns `x`, `α` and `xᵀFx`.
fn natural_step<F>(fvp: F, vpg_grad: &Tensor, config: &NpgConfig) -> Result<(Tensor, f32, f32)>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    let npg_grad = cg_solve(&fvp, vpg_grad, config.cg_iters, CG_RESIDUAL_TOL)?;
    let curvature = dot(&npg_grad, &fvp(&npg_grad)?)?;
    if !curvature.is_finite() || curvature < 0. {
        return Err(NumericalError::DegenerateCurvature { curvature }.into());
    }
    let alpha = (2. * config.normalized_step_size / (curvature + 1e-10)).sqrt();
    Ok((npg_grad, alpha, curvature))
}

/// Natural policy gradient on learned model rollouts, with a soft Q baseline.
#[derive(Debug)]
pub struct Npg {
    pub policy: GaussianMlp,
    pub baseline: QBaseline,
    pub learned_model: ModelEnsemble,
    pub config: NpgConfig,
    running_score: Option<f32>,
}

impl Npg {
    pub fn new(
        policy: GaussianMlp,
        baseline: QBaseline,
        learned_model: ModelEnsemble,
        config: NpgConfig,
    ) -> Self {
        Self {
            policy,
            baseline,
            learned_model,
            config,
            running_score: None,
        }
    }

    pub fn running_score(&self) -> Option<f32> {
        self.running_score
    }

    pub fn device(&self) -> &Device {
        self.policy.device()
    }

    /// One update: rollouts from `init_states` in the learned models, advantage estimation, a
    /// natural gradient step on the policy and a baseline fit.
    pub fn train_step<E: Env + ?Sized>(
        &mut self,
        init_states: &[Vec<f32>],
        horizon: usize,
        env: &E,
        rng: &mut StdRng,
    ) -> Result<NpgStats> {
        self.policy.snapshot_old()?;

        let start = Instant::now();
        let paths = ModelPathIter::new(
            &self.learned_model,
            env,
            &self.policy,
            init_states,
            horizon,
            false,
            rng,
        )
        .collect::<Result<Vec<_>>>()?;
        let time_sampling = start.elapsed().as_secs_f32();
        if paths.is_empty() {
            bail!("learned model rollouts produced no transitions");
        }

        let score = mean_score(&paths);
        let running_score = match self.running_score {
            Some(running) => 0.9 * running + 0.1 * score,
            None => score,
        };
        self.running_score = Some(running_score);

        let batch = self.process_paths(&paths, rng)?;
        let step = self.train_from_batch(&batch, rng)?;

        let start = Instant::now();
        let (baseline_loss_before, baseline_loss_after) =
            self.baseline
                .fit(&batch.observations, &batch.actions, &batch.returns, rng)?;
        let time_vf = start.elapsed().as_secs_f32();

        let stats = NpgStats {
            alpha: step.alpha,
            kl_dist: step.kl_dist,
            surr_improvement: step.surr_improvement,
            running_score,
            vpg_norm: step.vpg_norm,
            npg_norm: step.npg_norm,
            curvature: step.curvature,
            baseline_loss_before,
            baseline_loss_after,
            num_paths: paths.len(),
            num_samples: batch.observations.dim(0)?,
            time_sampling,
            time_vpg: step.time_vpg,
            time_npg: step.time_npg,
            time_vf,
        };
        tracing::debug!(
            alpha = stats.alpha,
            kl_dist = stats.kl_dist,
            surr_improvement = stats.surr_improvement,
            running_score,
            "npg step"
        );
        Ok(stats)
    }

    /// Discounted returns bootstrapped with the baseline value where a path was cut off by the
    /// horizon, advantages `returns - V(s)` normalised to zero mean and unit variance.
    pub fn process_paths(&self, paths: &[Path], rng: &mut StdRng) -> Result<ProcessedBatch> {
        let obs_dim = self.policy.observation_dim();
        let act_dim = self.policy.action_dim();
        let device = self.device().clone();
        let all_states: Vec<Vec<f32>> = paths
            .iter()
            .flat_map(|p| p.observations.iter().cloned())
            .collect();
        let all_states = rows_to_tensor(&all_states, obs_dim, &device)?;
        let values = self
            .baseline
            .value(&all_states, &self.policy, rng)?
            .to_vec1::<f32>()?;

        let mut returns = vec![];
        let mut advantages = vec![];
        let mut offset = 0;
        for path in paths {
            let steps = path.len();
            let path_values = &values[offset..offset + steps + 1];
            let mut running = if path.terminated {
                0.
            } else {
                path_values[steps]
            };
            let mut path_returns = vec![0f32; steps];
            for t in (0..steps).rev() {
                running = path.rewards[t] + self.config.gamma * running;
                path_returns[t] = running;
            }
            advantages.extend(path_returns.iter().zip(path_values).map(|(ret, v)| ret - v));
            returns.extend(path_returns);
            offset += steps + 1;
        }

        let n = advantages.len() as f32;
        let mean = advantages.iter().sum::<f32>() / n;
        let std = (advantages.iter().map(|a| (a - mean).powi(2)).sum::<f32>() / n).sqrt();
        for advantage in advantages.iter_mut() {
            *advantage = (*advantage - mean) / (std + 1e-6);
        }

        let observations: Vec<Vec<f32>> = paths
            .iter()
            .flat_map(|p| p.observations[..p.len()].iter().cloned())
            .collect();
        let actions: Vec<Vec<f32>> = paths.iter().flat_map(|p| p.actions.iter().cloned()).collect();
        let num_samples = returns.len();
        Ok(ProcessedBatch {
            observations: rows_to_tensor(&observations, obs_dim, &device)?,
            actions: rows_to_tensor(&actions, act_dim, &device)?,
            returns: Returns(Tensor::from_vec(returns, num_samples, &device)?),
            advantages: Advantages(Tensor::from_vec(advantages, num_samples, &device)?),
        })
    }

    fn cpi_surrogate(&self, batch: &ProcessedBatch) -> Result<Tensor> {
        let old = self.policy.old_dist_info(&batch.observations, &batch.actions)?;
        let new = self.policy.new_dist_info(&batch.observations, &batch.actions)?;
        let ratio = self.policy.likelihood_ratio(&new, &old)?;
        Ok(ratio.mul(&batch.advantages)?.mean_all()?)
    }

    fn kl_old_new(&self, batch: &ProcessedBatch) -> Result<f32> {
        let old = self.policy.old_dist_info(&batch.observations, &batch.actions)?;
        let new = self.policy.new_dist_info(&batch.observations, &batch.actions)?;
        Ok(self.policy.mean_kl(&new, &old)?.to_scalar::<f32>()?)
    }

    fn fisher_observations(&self, observations: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
        let num_samples = observations.dim(0)?;
        let frac = self.config.hvp_sample_frac.clamp(0., 1.);
        let num_hvp = ((frac * num_samples as f32) as usize).clamp(1, num_samples);
        if num_hvp == num_samples {
            return Ok(observations.clone());
        }
        let idx: Vec<u32> = sample(rng, num_samples, num_hvp)
            .into_iter()
            .map(|i| i as u32)
            .collect();
        let idx = Tensor::from_vec(idx, num_hvp, observations.device())?;
        Ok(observations.index_select(&idx, 0)?)
    }

    fn train_from_batch(&mut self, batch: &ProcessedBatch, rng: &mut StdRng) -> Result<StepStats> {
        let start = Instant::now();
        let surrogate = self.cpi_surrogate(batch)?;
        let surr_before = surrogate.to_scalar::<f32>()?;
        let vpg_grad = self.policy.flat_grad(&surrogate)?;
        let time_vpg = start.elapsed().as_secs_f32();

        let start = Instant::now();
        let hvp_observations = self.fisher_observations(&batch.observations, rng)?;
        let fvp = FisherVectorProduct::new(&self.policy, hvp_observations, self.config.cg_damping)?;
        let (npg_grad, alpha, curvature) =
            natural_step(|v| fvp.apply(v), &vpg_grad, &self.config)?;
        let current = Tensor::new(self.policy.get_param_values()?.as_slice(), self.device())?;
        let updated = current.add(&npg_grad.affine(alpha as f64, 0.)?)?;
        self.policy
            .set_param_values(&updated.to_vec1::<f32>()?, true, false)?;
        let time_npg = start.elapsed().as_secs_f32();

        let surr_after = self.cpi_surrogate(batch)?.to_scalar::<f32>()?;
        let kl_dist = self.kl_old_new(batch)?;
        Ok(StepStats {
            alpha,
            kl_dist,
            surr_improvement: surr_after - surr_before,
            vpg_norm: dot(&vpg_grad, &vpg_grad)?.sqrt(),
            npg_norm: dot(&npg_grad, &npg_grad)?.sqrt(),
            curvature,
            time_vpg,
            time_npg,
        })
    }

    /// Moves the policy, the baseline and every ensemble member.
    pub fn relocate(&mut self, device: &Device) -> Result<()> {
        self.policy.relocate(device)?;
        self.baseline.relocate(device)?;
        self.learned_model.relocate(device)
    }
}

impl Encode for Npg {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.policy.encode(encoder)?;
        self.baseline.encode(encoder)?;
        self.learned_model.encode(encoder)?;
        self.config.encode(encoder)?;
        self.running_score.encode(encoder)
    }
}

impl<Ctx> Decode<Ctx> for Npg {
    fn decode<D: Decoder<Context = Ctx>>(decoder: &mut D) -> Result<Self, DecodeError> {
        Ok(Self {
            policy: GaussianMlp::decode(decoder)?,
            baseline: QBaseline::decode(decoder)?,
            learned_model: ModelEnsemble::decode(decoder)?,
            config: NpgConfig::decode(decoder)?,
            running_score: Option::<f32>::decode(decoder)?,
        })
    }
}
