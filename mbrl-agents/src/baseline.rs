use anyhow::Result;
use bincode::{
    Decode, Encode,
    de::Decoder,
    enc::Encoder,
    error::{DecodeError, EncodeError},
};
use candle_core::{D, Device, Tensor};
use mbrl_core::{
    policies::Policy,
    rng::seeded,
    sequential::{Activation, FitOptions, MlpLayout, RegressionNet},
    utils::encoding::{DecodedTensors, encode_tensors},
};
use rand::rngs::StdRng;

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct BaselineConfig {
    pub hidden_size: Vec<usize>,
    pub epochs: usize,
    pub learning_rate: f64,
    /// L2 regularisation, applied as decoupled weight decay.
    pub reg_coef: f64,
    pub batch_size: usize,
    /// Number of policy actions averaged when turning Q into a state value.
    pub action_samples: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            hidden_size: vec![128, 128],
            epochs: 2,
            learning_rate: 1e-3,
            reg_coef: 1e-3,
            batch_size: 256,
            action_samples: 4,
        }
    }
}

/// State-action value baseline `Q(s, a)` regressed on discounted returns.
#[derive(Debug)]
pub struct QBaseline {
    config: BaselineConfig,
    net: RegressionNet,
}

impl QBaseline {
    pub fn new(
        obs_dim: usize,
        act_dim: usize,
        config: BaselineConfig,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let layout = MlpLayout::new(obs_dim + act_dim, &config.hidden_size, 1, Activation::Relu);
        let net = RegressionNet::new(layout, &mut seeded(seed), device)?;
        Ok(Self { config, net })
    }

    fn inputs(observations: &Tensor, actions: &Tensor) -> Result<Tensor> {
        Ok(Tensor::cat(&[observations, actions], D::Minus1)?)
    }

    /// `Q(s, a)` for every row, shape `(n,)`.
    pub fn predict(&self, observations: &Tensor, actions: &Tensor) -> Result<Tensor> {
        let q = self.net.predict(&Self::inputs(observations, actions)?)?;
        Ok(q.squeeze(1)?)
    }

    /// Soft state value `mean_k Q(s, a_k)` with `a_k` sampled from the policy.
    pub fn value<P: Policy>(
        &self,
        observations: &Tensor,
        policy: &P,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        let samples = self.config.action_samples.max(1);
        let mut total = self.predict(observations, &policy.get_action_batch(observations, rng, false)?)?;
        for _ in 1..samples {
            let actions = policy.get_action_batch(observations, rng, false)?;
            total = total.add(&self.predict(observations, &actions)?)?;
        }
        Ok(total.affine(1. / samples as f64, 0.)?)
    }

    /// Regresses `Q` on `returns`. Returns the squared error before and after fitting.
    pub fn fit(
        &mut self,
        observations: &Tensor,
        actions: &Tensor,
        returns: &Tensor,
        rng: &mut StdRng,
    ) -> Result<(f32, f32)> {
        let inputs = Self::inputs(observations, actions)?;
        let targets = returns.unsqueeze(1)?;
        let loss_before = self.net.loss(&inputs, &targets)?;
        let options = FitOptions {
            epochs: self.config.epochs,
            learning_rate: self.config.learning_rate,
            weight_decay: self.config.reg_coef,
            batch_size: self.config.batch_size,
            max_grad_norm: None,
        };
        self.net.fit(&inputs, &targets, &options, rng)?;
        let loss_after = self.net.loss(&inputs, &targets)?;
        Ok((loss_before, loss_after))
    }

    pub fn relocate(&mut self, device: &Device) -> Result<()> {
        self.net.relocate(device)
    }
}

impl Encode for QBaseline {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.config.encode(encoder)?;
        self.net.layout.encode(encoder)?;
        let tensors = self.net.tensors();
        let named: Vec<(String, &Tensor)> = tensors
            .iter()
            .enumerate()
            .map(|(idx, t)| (format!("q.{idx}"), t))
            .collect();
        encode_tensors(encoder, &named)
    }
}

impl<Ctx> Decode<Ctx> for QBaseline {
    fn decode<D: Decoder<Context = Ctx>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let config = BaselineConfig::decode(decoder)?;
        let layout = MlpLayout::decode(decoder)?;
        let tensors = DecodedTensors::decode(decoder)?;
        let blocks = (0..layout.shapes().len())
            .map(|idx| tensors.load(&format!("q.{idx}")))
            .collect::<Result<Vec<_>, _>>()?;
        let net = RegressionNet::from_tensors(layout, &blocks)
            .map_err(|err| DecodeError::OtherString(err.to_string()))?;
        Ok(Self { config, net })
    }
}
