pub mod world_model;

pub use world_model::{WorldModel, WorldModelConfig};

use crate::{path::TransitionBatch, utils::encoding::DecodedTensors};
use anyhow::Result;
use bincode::{
    Decode, Encode,
    de::Decoder,
    enc::Encoder,
    error::{DecodeError, EncodeError},
};
use candle_core::Device;
use rand::rngs::StdRng;

/// Losses of one ensemble member after a fit.
#[derive(Debug, Clone, Copy)]
pub struct FitReport {
    pub dynamics_loss: f32,
    /// Loss on the newest transitions, measured before fitting on them.
    pub generalization_loss: f32,
    pub reward_loss: Option<f32>,
}

impl FitReport {
    pub fn generalization_gap(&self) -> f32 {
        self.generalization_loss - self.dynamics_loss
    }
}

/// K independently seeded world models. Learned model rollouts assign path `i` to member
/// `i mod K`.
#[derive(Debug)]
pub struct ModelEnsemble {
    state_dim: usize,
    act_dim: usize,
    config: WorldModelConfig,
    members: Vec<WorldModel>,
}

impl ModelEnsemble {
    pub fn new(
        num_models: usize,
        state_dim: usize,
        act_dim: usize,
        config: WorldModelConfig,
        base_seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let members = (0..num_models as u64)
            .map(|i| WorldModel::new(state_dim, act_dim, &config, base_seed + i, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            state_dim,
            act_dim,
            config,
            members,
        })
    }

    /// Rebuilds every member from scratch, member `i` seeded with `base_seed + i`.
    pub fn refresh(&mut self, base_seed: u64, device: &Device) -> Result<()> {
        let num_models = self.members.len();
        tracing::debug!(num_models, base_seed, "refreshing world models");
        *self = Self::new(
            num_models,
            self.state_dim,
            self.act_dim,
            self.config.clone(),
            base_seed,
            device,
        )?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[WorldModel] {
        &self.members
    }

    pub fn member_for_path(&self, path_idx: usize) -> &WorldModel {
        &self.members[path_idx % self.members.len()]
    }

    /// Fits every member on `data`. The generalization loss is computed on `newest` before the
    /// member sees it.
    pub fn fit(
        &mut self,
        data: &TransitionBatch,
        newest: &TransitionBatch,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Vec<FitReport>> {
        let data = data.to_tensors(device)?;
        let newest = newest.to_tensors(device)?;
        let mut reports = Vec::with_capacity(self.members.len());
        for (idx, model) in self.members.iter_mut().enumerate() {
            let generalization_loss = model.compute_loss(&newest.s, &newest.a, &newest.sp)?;
            let dynamics_losses = model.fit_dynamics(&data.s, &data.a, &data.sp, rng)?;
            let reward_loss = if self.config.learn_reward {
                model.fit_reward(&data.s, &data.a, &data.r, rng)?.last().copied()
            } else {
                None
            };
            let report = FitReport {
                dynamics_loss: dynamics_losses.last().copied().unwrap_or(f32::NAN),
                generalization_loss,
                reward_loss,
            };
            tracing::debug!(
                model = idx,
                dynamics_loss = report.dynamics_loss,
                generalization_loss,
                "fitted world model"
            );
            reports.push(report);
        }
        Ok(reports)
    }

    pub fn relocate(&mut self, device: &Device) -> Result<()> {
        for model in self.members.iter_mut() {
            model.relocate(device)?;
        }
        Ok(())
    }
}

impl Encode for ModelEnsemble {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.state_dim.encode(encoder)?;
        self.act_dim.encode(encoder)?;
        self.config.encode(encoder)?;
        self.members.len().encode(encoder)?;
        for model in &self.members {
            model.encode_parameters(encoder)?;
        }
        Ok(())
    }
}

impl<Ctx> Decode<Ctx> for ModelEnsemble {
    fn decode<D: Decoder<Context = Ctx>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let state_dim = usize::decode(decoder)?;
        let act_dim = usize::decode(decoder)?;
        let config = WorldModelConfig::decode(decoder)?;
        let num_models = usize::decode(decoder)?;
        let members = (0..num_models)
            .map(|_| {
                let tensors = DecodedTensors::decode(decoder)?;
                WorldModel::from_decoded(state_dim, act_dim, &config, &tensors)
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;
        Ok(Self {
            state_dim,
            act_dim,
            config,
            members,
        })
    }
}
