use super::{ActionInfo, DistInfo, Policy};
use crate::{
    error::NumericalError,
    rng::{seeded, standard_normal},
    sequential::{Activation, MlpLayout, var_tensors, vars_from_tensors},
    tensors::FlatGrad,
    utils::{
        encoding::{DecodedTensors, encode_tensors},
        flat::{flatten, unflatten},
    },
};
use anyhow::Result;
use bincode::{
    Decode, Encode,
    de::Decoder,
    enc::Encoder,
    error::{DecodeError, EncodeError},
};
use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use std::f32::consts::PI;

const LAST_LAYER_SCALE: f32 = 1e-2;

/// Diagonal Gaussian policy whose mean is an MLP and whose log standard deviation is a free
/// parameter vector. Keeps two generations of parameters: the current one, which is trained, and
/// the old one, a frozen snapshot used for likelihood ratios and KL divergences.
#[derive(Debug)]
pub struct GaussianMlp {
    layout: MlpLayout,
    min_log_std: f32,
    device: Device,
    // mean net blocks followed by log_std
    params: Vec<Var>,
    old_params: Vec<Tensor>,
}

fn deep_copy(tensors: &[Tensor]) -> candle_core::Result<Vec<Tensor>> {
    tensors.iter().map(|t| Ok(t.copy()?.detach())).collect()
}

fn log_likelihood(mean: &Tensor, log_std: &Tensor, actions: &Tensor) -> Result<Tensor> {
    let act_dim = mean.dim(1)?;
    let zs = actions
        .sub(mean)?
        .broadcast_div(&log_std.exp()?.unsqueeze(0)?)?;
    let log_2pi = (2. * PI).ln() as f64;
    let ll = zs
        .sqr()?
        .sum(1)?
        .affine(-0.5, -(0.5 * act_dim as f64 * log_2pi))?
        .broadcast_sub(&log_std.sum_all()?)?;
    Ok(ll)
}

impl GaussianMlp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        obs_dim: usize,
        act_dim: usize,
        hidden: &[usize],
        activation: Activation,
        init_log_std: f32,
        min_log_std: f32,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let layout = MlpLayout::new(obs_dim, hidden, act_dim, activation);
        let mut rng = seeded(seed);
        let mut tensors = layout.init(&mut rng, device, LAST_LAYER_SCALE)?;
        tensors.push(Tensor::full(init_log_std.max(min_log_std), act_dim, device)?);
        Self::from_tensors(layout, min_log_std, tensors, device)
    }

    fn from_tensors(
        layout: MlpLayout,
        min_log_std: f32,
        tensors: Vec<Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let old_params = deep_copy(&tensors)?;
        let params = vars_from_tensors(&deep_copy(&tensors)?)?;
        Ok(Self {
            layout,
            min_log_std,
            device: device.clone(),
            params,
            old_params,
        })
    }

    pub fn layout(&self) -> &MlpLayout {
        &self.layout
    }

    pub fn param_shapes(&self) -> Vec<Vec<usize>> {
        let mut shapes = self.layout.shapes();
        shapes.push(vec![self.layout.output_dim()]);
        shapes
    }

    pub fn num_params(&self) -> usize {
        self.layout.num_params() + self.layout.output_dim()
    }

    /// Number of parameters of the mean network, i.e. the offset of the log-std block.
    pub fn num_net_params(&self) -> usize {
        self.layout.num_params()
    }

    pub fn vars(&self) -> &[Var] {
        &self.params
    }

    fn current(&self) -> Vec<Tensor> {
        var_tensors(&self.params)
    }

    fn split<'a>(&self, tensors: &'a [Tensor]) -> (&'a [Tensor], &'a Tensor) {
        let last = tensors.len() - 1;
        (&tensors[..last], &tensors[last])
    }

    pub fn get_param_values(&self) -> Result<Vec<f32>> {
        Ok(flatten(&self.current())?.to_vec1::<f32>()?)
    }

    pub fn get_old_param_values(&self) -> Result<Vec<f32>> {
        Ok(flatten(&self.old_params)?.to_vec1::<f32>()?)
    }

    /// Assigns the flat vector to the selected generations. The log-std block is clamped to
    /// `min_log_std` after assignment.
    pub fn set_param_values(&mut self, values: &[f32], set_new: bool, set_old: bool) -> Result<()> {
        let expected = self.num_params();
        if values.len() != expected {
            return Err(NumericalError::ParamLength {
                expected,
                got: values.len(),
            }
            .into());
        }
        let flat = Tensor::from_slice(values, expected, &self.device)?;
        let mut blocks = unflatten(&flat, &self.param_shapes())?;
        let last = blocks.len() - 1;
        blocks[last] = blocks[last].maximum(self.min_log_std)?;
        if set_new {
            for (var, block) in self.params.iter().zip(blocks.iter()) {
                var.set(&block.contiguous()?)?;
            }
        }
        if set_old {
            self.old_params = deep_copy(&blocks)?;
        }
        Ok(())
    }

    /// Commits the current parameters as the old generation.
    pub fn snapshot_old(&mut self) -> Result<()> {
        self.old_params = deep_copy(&self.current())?;
        Ok(())
    }

    pub fn log_std(&self) -> &Tensor {
        self.params[self.params.len() - 1].as_tensor()
    }

    pub fn mean(&self, observations: &Tensor) -> Result<Tensor> {
        let current = self.current();
        let (net, _) = self.split(&current);
        self.layout.forward(net, observations)
    }

    fn dist_info(params: &[Tensor], layout: &MlpLayout, obs: &Tensor, act: &Tensor) -> Result<DistInfo> {
        let last = params.len() - 1;
        let mean = layout.forward(&params[..last], obs)?;
        let log_std = params[last].clone();
        let ll = log_likelihood(&mean, &log_std, act)?;
        Ok(DistInfo { ll, mean, log_std })
    }

    /// Distribution of the current generation. The result is differentiable w.r.t. `vars()`.
    pub fn new_dist_info(&self, observations: &Tensor, actions: &Tensor) -> Result<DistInfo> {
        Self::dist_info(&self.current(), &self.layout, observations, actions)
    }

    pub fn old_dist_info(&self, observations: &Tensor, actions: &Tensor) -> Result<DistInfo> {
        Self::dist_info(&self.old_params, &self.layout, observations, actions)
    }

    pub fn likelihood_ratio(&self, new: &DistInfo, old: &DistInfo) -> Result<Tensor> {
        Ok(new.ll.sub(&old.ll)?.exp()?)
    }

    /// Mean over samples of `KL(old || new)`, as a scalar tensor.
    pub fn mean_kl(&self, new: &DistInfo, old: &DistInfo) -> Result<Tensor> {
        let old_var = old.log_std.affine(2., 0.)?.exp()?.unsqueeze(0)?;
        let new_var = new.log_std.affine(2., 0.)?.exp()?.unsqueeze(0)?;
        let numerator = old
            .mean
            .sub(&new.mean)?
            .sqr()?
            .broadcast_add(&old_var.sub(&new_var)?)?;
        let denominator = new_var.affine(2., 1e-8)?;
        let log_ratio = new.log_std.sub(&old.log_std)?.unsqueeze(0)?;
        let kl = numerator
            .broadcast_div(&denominator)?
            .broadcast_add(&log_ratio)?
            .sum(1)?;
        Ok(kl.mean_all()?)
    }

    /// Directional derivative of the mean network output along the flat mean-net `tangent`,
    /// evaluated at the current parameters.
    pub fn mean_jvp(&self, observations: &Tensor, tangent: &Tensor) -> Result<Tensor> {
        let current = self.current();
        let (net, _) = self.split(&current);
        let tangents = unflatten(tangent, &self.layout.shapes())?;
        let (_, jvp) = self.layout.forward_with_tangent(net, &tangents, observations)?;
        Ok(jvp)
    }

    /// Gradient of `sum(mean ⊙ weights)` w.r.t. the mean network, flattened.
    pub fn mean_vjp(&self, observations: &Tensor, weights: &Tensor) -> Result<Tensor> {
        let projected = self.mean(observations)?.mul(weights)?.sum_all()?;
        let last = self.params.len() - 1;
        self.flat_grad_of(&projected, &self.params[..last])
    }

    fn flat_grad_of(&self, loss: &Tensor, vars: &[Var]) -> Result<Tensor> {
        let grads = loss.backward()?;
        let blocks = vars
            .iter()
            .map(|var| match grads.get(var) {
                Some(grad) => Ok(grad.clone()),
                None => var.as_tensor().zeros_like(),
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(flatten(&blocks)?)
    }

    /// Gradient of a scalar loss w.r.t. every current parameter, laid out like
    /// `get_param_values`.
    pub fn flat_grad(&self, loss: &Tensor) -> Result<FlatGrad> {
        Ok(FlatGrad(self.flat_grad_of(loss, &self.params)?))
    }

    pub fn relocate(&mut self, device: &Device) -> Result<()> {
        let moved = self
            .current()
            .iter()
            .map(|t| t.to_device(device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        self.params = vars_from_tensors(&moved)?;
        self.old_params = self
            .old_params
            .iter()
            .map(|t| t.to_device(device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        self.device = device.clone();
        Ok(())
    }
}

impl Policy for GaussianMlp {
    fn observation_dim(&self) -> usize {
        self.layout.input_dim
    }

    fn action_dim(&self) -> usize {
        self.layout.output_dim()
    }

    fn get_action(&self, observation: &[f32], rng: &mut StdRng) -> Result<(Vec<f32>, ActionInfo)> {
        let obs = Tensor::from_slice(observation, (1, observation.len()), &self.device)?;
        let mean = self.mean(&obs)?.squeeze(0)?.to_vec1::<f32>()?;
        let log_std = self.log_std().to_vec1::<f32>()?;
        let noise = standard_normal(rng, mean.len());
        let action = mean
            .iter()
            .zip(log_std.iter())
            .zip(noise.iter())
            .map(|((m, l), n)| m + l.exp() * n)
            .collect();
        let info = ActionInfo {
            evaluation: mean.clone(),
            mean,
            log_std,
        };
        Ok((action, info))
    }

    fn get_action_batch(
        &self,
        observations: &Tensor,
        rng: &mut StdRng,
        mean_action: bool,
    ) -> Result<Tensor> {
        let mean = self.mean(observations)?.detach();
        if mean_action {
            return Ok(mean);
        }
        let (n, act_dim) = mean.dims2()?;
        let noise = Tensor::from_vec(standard_normal(rng, n * act_dim), (n, act_dim), &self.device)?;
        let std = self.log_std().exp()?.unsqueeze(0)?;
        Ok(mean.add(&noise.broadcast_mul(&std)?)?.detach())
    }

    fn log_likelihood(&self, observations: &Tensor, actions: &Tensor) -> Result<Tensor> {
        Ok(self.new_dist_info(observations, actions)?.ll)
    }

    fn std(&self) -> Result<f32> {
        Ok(self.log_std().exp()?.mean_all()?.to_scalar::<f32>()?)
    }

    fn entropy(&self) -> Result<f32> {
        let log_std = self.log_std().to_vec1::<f32>()?;
        let per_dim = 0.5 * ((2. * PI).ln() + 1.);
        Ok(log_std.iter().map(|l| l + per_dim).sum())
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl Encode for GaussianMlp {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.layout.encode(encoder)?;
        self.min_log_std.encode(encoder)?;
        let current = self.current();
        let named: Vec<(String, &Tensor)> = current
            .iter()
            .enumerate()
            .map(|(idx, t)| (format!("param.{idx}"), t))
            .chain(
                self.old_params
                    .iter()
                    .enumerate()
                    .map(|(idx, t)| (format!("old.{idx}"), t)),
            )
            .collect();
        encode_tensors(encoder, &named)
    }
}

impl<Ctx> Decode<Ctx> for GaussianMlp {
    fn decode<D: Decoder<Context = Ctx>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let layout = MlpLayout::decode(decoder)?;
        let min_log_std = f32::decode(decoder)?;
        let tensors = DecodedTensors::decode(decoder)?;
        let num_blocks = layout.layers.len() * 2 + 1;
        let load_all = |prefix: &str| -> Result<Vec<Tensor>, DecodeError> {
            (0..num_blocks)
                .map(|idx| tensors.load(&format!("{prefix}.{idx}")))
                .collect()
        };
        let params = vars_from_tensors(&load_all("param")?)
            .map_err(|err| DecodeError::OtherString(err.to_string()))?;
        let old_params = load_all("old")?;
        Ok(Self {
            layout,
            min_log_std,
            device: Device::Cpu,
            params,
            old_params,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn policy(hidden: &[usize]) -> Result<GaussianMlp> {
        GaussianMlp::new(3, 2, hidden, Activation::Tanh, -0.5, -1.0, 7, &Device::Cpu)
    }

    fn batch(device: &Device) -> Result<(Tensor, Tensor)> {
        let obs = Tensor::new(
            &[[0.1f32, -0.3, 0.7], [1.0, 0.2, -0.4], [-0.6, 0.5, 0.0], [0.3, 0.3, 0.3]],
            device,
        )?;
        let act = Tensor::new(&[[0.2f32, -0.1], [0.0, 0.4], [-0.5, 0.1], [0.9, -0.9]], device)?;
        Ok((obs, act))
    }

    #[test]
    fn set_then_get_clamps_log_std() -> Result<()> {
        let mut policy = policy(&[4])?;
        let mut values: Vec<f32> = (0..policy.num_params()).map(|i| i as f32 * 0.01).collect();
        let n = values.len();
        values[n - 2] = -3.;
        values[n - 1] = 0.25;
        policy.set_param_values(&values, true, true)?;
        let got = policy.get_param_values()?;
        assert_eq!(&got[..n - 2], &values[..n - 2]);
        assert_eq!(&got[n - 2..], &[-1.0, 0.25]);
        policy.set_param_values(&got, true, false)?;
        assert_eq!(policy.get_param_values()?, got);
        assert_eq!(policy.get_old_param_values()?, got);
        Ok(())
    }

    #[test]
    fn initial_log_std_respects_floor() -> Result<()> {
        let policy = GaussianMlp::new(3, 2, &[4], Activation::Tanh, -3., -1., 7, &Device::Cpu)?;
        assert_eq!(policy.log_std().to_vec1::<f32>()?, vec![-1., -1.]);
        Ok(())
    }

    #[test]
    fn wrong_length_is_rejected() -> Result<()> {
        let mut policy = policy(&[4])?;
        let err = policy.set_param_values(&[0.; 3], true, true).unwrap_err();
        assert!(err.downcast_ref::<NumericalError>().is_some());
        Ok(())
    }

    #[test]
    fn log_likelihood_is_permutation_invariant() -> Result<()> {
        let policy = policy(&[5])?;
        let (obs, act) = batch(&Device::Cpu)?;
        let ll = policy.log_likelihood(&obs, &act)?.to_vec1::<f32>()?;
        let perm = Tensor::new(&[2u32, 0, 3, 1], &Device::Cpu)?;
        let permuted = policy
            .log_likelihood(&obs.index_select(&perm, 0)?, &act.index_select(&perm, 0)?)?
            .to_vec1::<f32>()?;
        for (idx, p) in [2usize, 0, 3, 1].iter().enumerate() {
            assert!((permuted[idx] - ll[*p]).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn same_distribution_has_zero_kl_and_unit_ratio() -> Result<()> {
        let mut policy = policy(&[5])?;
        policy.snapshot_old()?;
        let (obs, act) = batch(&Device::Cpu)?;
        let new = policy.new_dist_info(&obs, &act)?;
        let old = policy.old_dist_info(&obs, &act)?;
        let kl = policy.mean_kl(&new, &old)?.to_scalar::<f32>()?;
        assert!(kl.abs() < 1e-6);
        let lr = policy.likelihood_ratio(&new, &old)?.to_vec1::<f32>()?;
        assert!(lr.iter().all(|r| (r - 1.).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn old_generation_is_frozen_until_snapshot() -> Result<()> {
        let mut policy = policy(&[4])?;
        let before = policy.get_param_values()?;
        let moved: Vec<f32> = before.iter().map(|v| v + 0.1).collect();
        policy.set_param_values(&moved, true, false)?;
        assert_eq!(policy.get_old_param_values()?, before);
        policy.snapshot_old()?;
        assert_eq!(policy.get_old_param_values()?, policy.get_param_values()?);
        Ok(())
    }

    #[test]
    fn diagnostics_follow_log_std() -> Result<()> {
        let policy = policy(&[4])?;
        assert!((policy.std()? - (-0.5f32).exp()).abs() < 1e-6);
        let expected = 2. * (-0.5 + 0.5 * ((2. * PI).ln() + 1.));
        assert!((policy.entropy()? - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn encoding_preserves_parameters() -> Result<()> {
        let policy = policy(&[4, 4])?;
        let config = bincode::config::standard();
        let bytes = bincode::encode_to_vec(&policy, config)?;
        let (decoded, _): (GaussianMlp, usize) = bincode::decode_from_slice(&bytes, config)?;
        assert_eq!(decoded.get_param_values()?, policy.get_param_values()?);
        assert_eq!(decoded.layout(), policy.layout());
        Ok(())
    }
}
