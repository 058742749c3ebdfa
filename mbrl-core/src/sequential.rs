use crate::utils::optimizer::OptimizerWithMaxGrad;
use anyhow::Result;
use bincode::{Decode, Encode};
use candle_core::{Device, Tensor, Var};
use rand::{Rng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Tanh,
    Relu,
}

impl Activation {
    fn apply(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Tanh => xs.tanh(),
            Self::Relu => xs.relu(),
        }
    }

    /// Derivative given the pre-activation `zs` and the activation output `hs`.
    fn derivative(&self, zs: &Tensor, hs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Tanh => hs.sqr()?.affine(-1., 1.),
            Self::Relu => zs.gt(0f64)?.to_dtype(zs.dtype()),
        }
    }
}

/// Shape table of a fully connected network. `layers` lists every layer's output size, the last
/// one being the output dimension. Parameters are ordered weight (`out × in`) then bias, layer by
/// layer.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct MlpLayout {
    pub input_dim: usize,
    pub layers: Vec<usize>,
    pub activation: Activation,
}

fn linear(xs: &Tensor, w: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    xs.matmul(&w.t()?)?.broadcast_add(b)
}

impl MlpLayout {
    pub fn new(input_dim: usize, hidden: &[usize], output_dim: usize, activation: Activation) -> Self {
        let mut layers = hidden.to_vec();
        layers.push(output_dim);
        Self {
            input_dim,
            layers,
            activation,
        }
    }

    pub fn output_dim(&self) -> usize {
        self.layers[self.layers.len() - 1]
    }

    pub fn shapes(&self) -> Vec<Vec<usize>> {
        let mut last_dim = self.input_dim;
        let mut shapes = vec![];
        for layer_size in &self.layers {
            shapes.push(vec![*layer_size, last_dim]);
            shapes.push(vec![*layer_size]);
            last_dim = *layer_size;
        }
        shapes
    }

    pub fn num_params(&self) -> usize {
        self.shapes().iter().map(|s| s.iter().product::<usize>()).sum()
    }

    /// Uniform fan-in initialisation. The last layer is multiplied by `last_layer_scale`.
    pub fn init(
        &self,
        rng: &mut StdRng,
        device: &Device,
        last_layer_scale: f32,
    ) -> Result<Vec<Tensor>> {
        let shapes = self.shapes();
        let num_blocks = shapes.len();
        let mut params = Vec::with_capacity(num_blocks);
        for (idx, shape) in shapes.iter().enumerate() {
            let fan_in = shapes[idx - idx % 2][1];
            let bound = 1. / (fan_in as f32).sqrt();
            let scale = if idx >= num_blocks - 2 { last_layer_scale } else { 1. };
            let size: usize = shape.iter().product();
            let data: Vec<f32> = (0..size)
                .map(|_| rng.random_range(-bound..bound) * scale)
                .collect();
            params.push(Tensor::from_vec(data, shape.as_slice(), device)?);
        }
        Ok(params)
    }

    pub fn forward(&self, params: &[Tensor], xs: &Tensor) -> Result<Tensor> {
        let num_layers = self.layers.len();
        let mut xs = xs.clone();
        for layer_idx in 0..num_layers {
            let zs = linear(&xs, &params[2 * layer_idx], &params[2 * layer_idx + 1])?;
            xs = if layer_idx == num_layers - 1 {
                zs
            } else {
                self.activation.apply(&zs)?
            };
        }
        Ok(xs)
    }

    /// Forward pass that also pushes a parameter-space tangent through the network, returning the
    /// output and its directional derivative.
    pub fn forward_with_tangent(
        &self,
        params: &[Tensor],
        tangents: &[Tensor],
        xs: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let num_layers = self.layers.len();
        let mut hs = xs.clone();
        let mut dhs: Option<Tensor> = None;
        for layer_idx in 0..num_layers {
            let (w, b) = (&params[2 * layer_idx], &params[2 * layer_idx + 1]);
            let (dw, db) = (&tangents[2 * layer_idx], &tangents[2 * layer_idx + 1]);
            let zs = linear(&hs, w, b)?;
            let mut dzs = linear(&hs, dw, db)?;
            if let Some(dhs) = &dhs {
                dzs = (dzs + dhs.matmul(&w.t()?)?)?;
            }
            if layer_idx == num_layers - 1 {
                hs = zs;
                dhs = Some(dzs);
            } else {
                let out = self.activation.apply(&zs)?;
                dhs = Some(self.activation.derivative(&zs, &out)?.mul(&dzs)?);
                hs = out;
            }
        }
        let dhs = match dhs {
            Some(dhs) => dhs,
            None => hs.zeros_like()?,
        };
        Ok((hs, dhs))
    }
}

pub fn var_tensors(vars: &[Var]) -> Vec<Tensor> {
    vars.iter().map(|v| v.as_tensor().clone()).collect()
}

pub fn vars_from_tensors(tensors: &[Tensor]) -> Result<Vec<Var>> {
    Ok(tensors
        .iter()
        .map(Var::from_tensor)
        .collect::<candle_core::Result<Vec<_>>>()?)
}

#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    pub epochs: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub batch_size: usize,
    pub max_grad_norm: Option<f32>,
}

/// A trainable fully connected network fitted with a mean squared error loss. The Adam state is
/// created on the first fit and carried over to later fits.
#[derive(Debug)]
pub struct RegressionNet {
    pub layout: MlpLayout,
    params: Vec<Var>,
    optimizer: Option<OptimizerWithMaxGrad>,
}

impl RegressionNet {
    pub fn new(layout: MlpLayout, rng: &mut StdRng, device: &Device) -> Result<Self> {
        let params = vars_from_tensors(&layout.init(rng, device, 1.)?)?;
        Ok(Self {
            layout,
            params,
            optimizer: None,
        })
    }

    pub fn from_tensors(layout: MlpLayout, tensors: &[Tensor]) -> Result<Self> {
        Ok(Self {
            layout,
            params: vars_from_tensors(tensors)?,
            optimizer: None,
        })
    }

    /// Adam updates applied since the optimizer was created.
    pub fn optimizer_steps(&self) -> usize {
        self.optimizer.as_ref().map_or(0, OptimizerWithMaxGrad::steps)
    }

    pub fn tensors(&self) -> Vec<Tensor> {
        var_tensors(&self.params)
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.layout.forward(&self.tensors(), xs)
    }

    pub fn predict(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.forward(xs)?.detach())
    }

    pub fn loss(&self, xs: &Tensor, targets: &Tensor) -> Result<f32> {
        let loss = self.predict(xs)?.sub(targets)?.sqr()?.mean_all()?;
        Ok(loss.to_scalar::<f32>()?)
    }

    /// Minibatch Adam on the squared error. Returns the mean training loss of every epoch.
    pub fn fit(
        &mut self,
        xs: &Tensor,
        targets: &Tensor,
        options: &FitOptions,
        rng: &mut StdRng,
    ) -> Result<Vec<f32>> {
        let num_samples = xs.dim(0)?;
        let device = xs.device().clone();
        let mut optimizer = match self.optimizer.take() {
            Some(optimizer) => optimizer,
            None => OptimizerWithMaxGrad::adam(
                self.params.clone(),
                options.learning_rate,
                options.weight_decay,
                options.max_grad_norm,
            )?,
        };
        let mut indices: Vec<u32> = (0..num_samples as u32).collect();
        let mut epoch_losses = Vec::with_capacity(options.epochs);
        for _ in 0..options.epochs {
            indices.shuffle(rng);
            let mut total_loss = 0f32;
            for batch in indices.chunks(options.batch_size.max(1)) {
                let batch_idx = Tensor::from_slice(batch, batch.len(), &device)?;
                let batch_xs = xs.index_select(&batch_idx, 0)?;
                let batch_targets = targets.index_select(&batch_idx, 0)?;
                let pred = self.forward(&batch_xs)?;
                let loss = pred.sub(&batch_targets)?.sqr()?.mean_all()?;
                optimizer.backward_step(&loss)?;
                total_loss += loss.to_scalar::<f32>()? * batch.len() as f32;
            }
            epoch_losses.push(total_loss / num_samples.max(1) as f32);
        }
        self.optimizer = Some(optimizer);
        Ok(epoch_losses)
    }

    pub fn relocate(&mut self, device: &Device) -> Result<()> {
        let moved = self
            .params
            .iter()
            .map(|v| v.as_tensor().to_device(device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        self.params = vars_from_tensors(&moved)?;
        // the moments live on the old device
        self.optimizer = None;
        Ok(())
    }
}
