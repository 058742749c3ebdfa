use crate::{
    rng::seeded,
    sequential::{Activation, FitOptions, MlpLayout, RegressionNet},
    utils::encoding::{DecodedTensors, encode_tensors},
};
use anyhow::{Result, bail};
use bincode::{
    Decode, Encode,
    enc::Encoder,
    error::{DecodeError, EncodeError},
};
use candle_core::{D, DType, Device, Tensor};
use rand::rngs::StdRng;

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct WorldModelConfig {
    pub hidden_size: Vec<usize>,
    pub activation: Activation,
    pub fit_lr: f64,
    pub fit_wd: f64,
    pub fit_mb_size: usize,
    pub fit_epochs: usize,
    pub fit_max_grad_norm: Option<f32>,
    pub learn_reward: bool,
}

impl Default for WorldModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: vec![64, 64],
            activation: Activation::Relu,
            fit_lr: 1e-3,
            fit_wd: 0.,
            fit_mb_size: 256,
            fit_epochs: 25,
            fit_max_grad_norm: None,
            learn_reward: true,
        }
    }
}

impl WorldModelConfig {
    fn fit_options(&self) -> FitOptions {
        FitOptions {
            epochs: self.fit_epochs,
            learning_rate: self.fit_lr,
            weight_decay: self.fit_wd,
            batch_size: self.fit_mb_size,
            max_grad_norm: self.fit_max_grad_norm,
        }
    }
}

const MIN_STD: f64 = 1e-6;

/// Per feature shift and scale.
#[derive(Debug, Clone)]
pub struct Normalizer {
    pub mean: Tensor,
    pub std: Tensor,
}

impl Normalizer {
    pub fn identity(dim: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            mean: Tensor::zeros(dim, DType::F32, device)?,
            std: Tensor::ones(dim, DType::F32, device)?,
        })
    }

    /// Statistics of the rows of `data`. The scale never drops below `1e-6`.
    pub fn from_data(data: &Tensor) -> Result<Self> {
        let mean = data.mean(0)?;
        let var = data.broadcast_sub(&mean)?.sqr()?.mean(0)?;
        let std = var.sqrt()?.maximum(MIN_STD)?;
        Ok(Self { mean, std })
    }

    pub fn normalize(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(xs.broadcast_sub(&self.mean)?.broadcast_div(&self.std)?)
    }

    pub fn denormalize(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(xs.broadcast_mul(&self.std)?.broadcast_add(&self.mean)?)
    }

    fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            mean: self.mean.to_device(device)?,
            std: self.std.to_device(device)?,
        })
    }
}

/// Learned dynamics `(s, a) -> s'` and optionally reward `(s, a) -> r`. The dynamics network
/// predicts the normalized state delta.
#[derive(Debug)]
pub struct WorldModel {
    state_dim: usize,
    act_dim: usize,
    fit_options: FitOptions,
    dynamics: RegressionNet,
    reward: Option<RegressionNet>,
    state_norm: Normalizer,
    action_norm: Normalizer,
    delta_norm: Normalizer,
}

fn layouts(state_dim: usize, act_dim: usize, config: &WorldModelConfig) -> (MlpLayout, MlpLayout) {
    let input_dim = state_dim + act_dim;
    (
        MlpLayout::new(input_dim, &config.hidden_size, state_dim, config.activation),
        MlpLayout::new(input_dim, &config.hidden_size, 1, config.activation),
    )
}

impl WorldModel {
    pub fn new(
        state_dim: usize,
        act_dim: usize,
        config: &WorldModelConfig,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = seeded(seed);
        let (dynamics_layout, reward_layout) = layouts(state_dim, act_dim, config);
        let dynamics = RegressionNet::new(dynamics_layout, &mut rng, device)?;
        let reward = if config.learn_reward {
            Some(RegressionNet::new(reward_layout, &mut rng, device)?)
        } else {
            None
        };
        Ok(Self {
            state_dim,
            act_dim,
            fit_options: config.fit_options(),
            dynamics,
            reward,
            state_norm: Normalizer::identity(state_dim, device)?,
            action_norm: Normalizer::identity(act_dim, device)?,
            delta_norm: Normalizer::identity(state_dim, device)?,
        })
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    pub fn act_dim(&self) -> usize {
        self.act_dim
    }

    pub fn has_reward(&self) -> bool {
        self.reward.is_some()
    }

    fn inputs(&self, s: &Tensor, a: &Tensor) -> Result<Tensor> {
        let s = self.state_norm.normalize(s)?;
        let a = self.action_norm.normalize(a)?;
        Ok(Tensor::cat(&[&s, &a], D::Minus1)?)
    }

    fn delta_targets(&self, s: &Tensor, sp: &Tensor) -> Result<Tensor> {
        self.delta_norm.normalize(&sp.sub(s)?)
    }

    /// Refreshes the normalization statistics and fits the dynamics network. Returns the mean
    /// training loss of every epoch.
    pub fn fit_dynamics(
        &mut self,
        s: &Tensor,
        a: &Tensor,
        sp: &Tensor,
        rng: &mut StdRng,
    ) -> Result<Vec<f32>> {
        self.state_norm = Normalizer::from_data(s)?;
        self.action_norm = Normalizer::from_data(a)?;
        self.delta_norm = Normalizer::from_data(&sp.sub(s)?)?;
        let inputs = self.inputs(s, a)?;
        let targets = self.delta_targets(s, sp)?;
        self.dynamics.fit(&inputs, &targets, &self.fit_options, rng)
    }

    /// Fits the reward head on `(n, 1)` rewards.
    pub fn fit_reward(
        &mut self,
        s: &Tensor,
        a: &Tensor,
        r: &Tensor,
        rng: &mut StdRng,
    ) -> Result<Vec<f32>> {
        let inputs = self.inputs(s, a)?;
        match self.reward.as_mut() {
            Some(reward) => reward.fit(&inputs, r, &self.fit_options, rng),
            None => bail!("world model has no reward head"),
        }
    }

    /// Dynamics loss in the normalized delta space the network is trained in.
    pub fn compute_loss(&self, s: &Tensor, a: &Tensor, sp: &Tensor) -> Result<f32> {
        let inputs = self.inputs(s, a)?;
        let targets = self.delta_targets(s, sp)?;
        self.dynamics.loss(&inputs, &targets)
    }

    pub fn predict(&self, s: &Tensor, a: &Tensor) -> Result<Tensor> {
        let delta = self.dynamics.predict(&self.inputs(s, a)?)?;
        Ok(s.add(&self.delta_norm.denormalize(&delta)?)?)
    }

    /// Predicted rewards, shape `(n,)`.
    pub fn predict_reward(&self, s: &Tensor, a: &Tensor) -> Result<Tensor> {
        match &self.reward {
            Some(reward) => Ok(reward.predict(&self.inputs(s, a)?)?.squeeze(1)?),
            None => bail!("world model has no reward head"),
        }
    }

    pub fn relocate(&mut self, device: &Device) -> Result<()> {
        self.dynamics.relocate(device)?;
        if let Some(reward) = self.reward.as_mut() {
            reward.relocate(device)?;
        }
        self.state_norm = self.state_norm.to_device(device)?;
        self.action_norm = self.action_norm.to_device(device)?;
        self.delta_norm = self.delta_norm.to_device(device)?;
        Ok(())
    }

    /// Writes the parameters and normalization statistics. Dimensions and configuration are
    /// owned by the ensemble.
    pub fn encode_parameters<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        let dynamics = self.dynamics.tensors();
        let reward = self.reward.as_ref().map(|r| r.tensors()).unwrap_or_default();
        let mut named: Vec<(String, &Tensor)> = vec![
            ("state_mean".to_string(), &self.state_norm.mean),
            ("state_std".to_string(), &self.state_norm.std),
            ("action_mean".to_string(), &self.action_norm.mean),
            ("action_std".to_string(), &self.action_norm.std),
            ("delta_mean".to_string(), &self.delta_norm.mean),
            ("delta_std".to_string(), &self.delta_norm.std),
        ];
        named.extend(dynamics.iter().enumerate().map(|(i, t)| (format!("dyn.{i}"), t)));
        named.extend(reward.iter().enumerate().map(|(i, t)| (format!("rew.{i}"), t)));
        encode_tensors(encoder, &named)
    }

    pub fn from_decoded(
        state_dim: usize,
        act_dim: usize,
        config: &WorldModelConfig,
        tensors: &DecodedTensors,
    ) -> Result<Self, DecodeError> {
        let (dynamics_layout, reward_layout) = layouts(state_dim, act_dim, config);
        let load_net = |layout: MlpLayout, prefix: &str| -> Result<RegressionNet, DecodeError> {
            let blocks = (0..layout.shapes().len())
                .map(|i| tensors.load(&format!("{prefix}.{i}")))
                .collect::<Result<Vec<_>, _>>()?;
            RegressionNet::from_tensors(layout, &blocks)
                .map_err(|err| DecodeError::OtherString(err.to_string()))
        };
        let normalizer = |name: &str| -> Result<Normalizer, DecodeError> {
            Ok(Normalizer {
                mean: tensors.load(&format!("{name}_mean"))?,
                std: tensors.load(&format!("{name}_std"))?,
            })
        };
        let reward = if config.learn_reward {
            Some(load_net(reward_layout, "rew")?)
        } else {
            None
        };
        Ok(Self {
            state_dim,
            act_dim,
            fit_options: config.fit_options(),
            dynamics: load_net(dynamics_layout, "dyn")?,
            reward,
            state_norm: normalizer("state")?,
            action_norm: normalizer("action")?,
            delta_norm: normalizer("delta")?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn linear_system(n: usize, device: &Device) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let s: Vec<f32> = (0..n).map(|i| (i as f32 / n as f32) * 2. - 1.).collect();
        let a: Vec<f32> = (0..n).map(|i| ((i * 7) % n) as f32 / n as f32 - 0.5).collect();
        let sp: Vec<f32> = s.iter().zip(&a).map(|(s, a)| s + 0.1 * a).collect();
        let r: Vec<f32> = s.iter().map(|s| -s.abs()).collect();
        Ok((
            Tensor::from_vec(s, (n, 1), device)?,
            Tensor::from_vec(a, (n, 1), device)?,
            Tensor::from_vec(sp, (n, 1), device)?,
            Tensor::from_vec(r, (n, 1), device)?,
        ))
    }

    #[test]
    fn fitting_reduces_dynamics_loss() -> Result<()> {
        let device = Device::Cpu;
        let config = WorldModelConfig {
            hidden_size: vec![32],
            fit_epochs: 30,
            fit_mb_size: 32,
            fit_lr: 5e-3,
            ..Default::default()
        };
        let mut model = WorldModel::new(1, 1, &config, 11, &device)?;
        let (s, a, sp, r) = linear_system(128, &device)?;
        let mut rng = seeded(0);
        let losses = model.fit_dynamics(&s, &a, &sp, &mut rng)?;
        assert_eq!(losses.len(), 30);
        assert!(losses[losses.len() - 1] < losses[0]);
        let reward_losses = model.fit_reward(&s, &a, &r, &mut rng)?;
        assert_eq!(reward_losses.len(), 30);
        assert_eq!(model.predict(&s, &a)?.dims(), &[128, 1]);
        assert_eq!(model.predict_reward(&s, &a)?.dims(), &[128]);
        Ok(())
    }

    #[test]
    fn normalizer_round_trips_rows() -> Result<()> {
        let device = Device::Cpu;
        let data = Tensor::new(&[[1f32, 5.], [3., 5.]], &device)?;
        let norm = Normalizer::from_data(&data)?;
        assert_eq!(norm.mean.to_vec1::<f32>()?, vec![2., 5.]);
        let std = norm.std.to_vec1::<f32>()?;
        assert_eq!(std[0], 1.);
        assert!((std[1] - 1e-6).abs() < 1e-9);
        let back = norm.denormalize(&norm.normalize(&data)?)?;
        assert_eq!(back.to_vec2::<f32>()?, data.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn missing_reward_head_is_an_error() -> Result<()> {
        let config = WorldModelConfig {
            learn_reward: false,
            ..Default::default()
        };
        let model = WorldModel::new(2, 1, &config, 0, &Device::Cpu)?;
        let s = Tensor::zeros((3, 2), DType::F32, &Device::Cpu)?;
        let a = Tensor::zeros((3, 1), DType::F32, &Device::Cpu)?;
        assert!(!model.has_reward());
        assert!(model.predict_reward(&s, &a).is_err());
        Ok(())
    }
}
