use candle_core::{Result, Tensor, Var, backprop::GradStore};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use std::fmt::Debug;

pub fn clip_grad(t: &Tensor, vars: &[Var], max_norm: f32) -> Result<GradStore> {
    let mut total_norm_squared = 0.0f32;
    let mut grad_store = t.backward()?;
    for var in vars.iter() {
        if let Some(grad) = grad_store.get(var) {
            total_norm_squared += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    let total_norm = total_norm_squared.sqrt();
    if total_norm > max_norm {
        let clip_coef = (max_norm / (total_norm + 1e-6)) as f64;
        for var in vars.iter() {
            if let Some(old_grad) = grad_store.get(var) {
                let new_grad = old_grad.affine(clip_coef, 0.)?;
                grad_store.insert(var.as_tensor(), new_grad);
            }
        }
    }
    Ok(grad_store)
}

pub struct OptimizerWithMaxGrad {
    pub optimizer: AdamW,
    pub max_grad_norm: Option<f32>,
    pub vars: Vec<Var>,
    steps: usize,
}

impl Debug for OptimizerWithMaxGrad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizerWithMaxGrad")
            .field("learning_rate", &self.optimizer.learning_rate())
            .field("max_grad_norm", &self.max_grad_norm)
            .field("steps", &self.steps)
            .finish()
    }
}

impl OptimizerWithMaxGrad {
    pub fn adam(
        vars: Vec<Var>,
        lr: f64,
        weight_decay: f64,
        max_grad_norm: Option<f32>,
    ) -> Result<Self> {
        let params = ParamsAdamW {
            lr,
            weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(vars.clone(), params)?;
        Ok(Self {
            optimizer,
            max_grad_norm,
            vars,
            steps: 0,
        })
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = if let Some(max_norm) = self.max_grad_norm {
            clip_grad(loss, &self.vars, max_norm)?
        } else {
            loss.backward()?
        };
        self.optimizer.step(&grads)?;
        self.steps += 1;
        Ok(())
    }
}
