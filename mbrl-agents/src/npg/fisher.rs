use anyhow::Result;
use candle_core::Tensor;
use mbrl_core::policies::GaussianMlp;

/// Matrix free product with the Hessian of the mean KL divergence between the old and the current
/// policy, taken at the point where both coincide.
///
/// For a diagonal Gaussian this Hessian is a Gauss-Newton matrix. The mean network block is
/// `Jᵀ W J` with `J` the Jacobian of the mean outputs and `W = 2 / (2σ² + 1e-8)` per action
/// dimension (averaged over samples). The log-std block is `2·I` and the cross terms vanish. `J v`
/// is computed with a forward-mode tangent, `Jᵀ (W J v)` with one reverse pass.
pub struct FisherVectorProduct<'a> {
    policy: &'a GaussianMlp,
    observations: Tensor,
    // (1, act_dim)
    weights: Tensor,
    damping: f64,
}

impl<'a> FisherVectorProduct<'a> {
    pub fn new(policy: &'a GaussianMlp, observations: Tensor, damping: f32) -> Result<Self> {
        let num_samples = observations.dim(0)?.max(1);
        let weights = policy
            .log_std()
            .affine(2., 0.)?
            .exp()?
            .affine(2., 1e-8)?
            .recip()?
            .affine(2. / num_samples as f64, 0.)?
            .unsqueeze(0)?
            .detach();
        Ok(Self {
            policy,
            observations,
            weights,
            damping: damping as f64,
        })
    }

    pub fn apply(&self, vector: &Tensor) -> Result<Tensor> {
        let num_net = self.policy.num_net_params();
        let act_dim = self.policy.num_params() - num_net;
        let net_part = vector.narrow(0, 0, num_net)?;
        let log_std_part = vector.narrow(0, num_net, act_dim)?;
        let jvp = self.policy.mean_jvp(&self.observations, &net_part)?;
        let weighted = jvp.broadcast_mul(&self.weights)?.detach();
        let net_product = self.policy.mean_vjp(&self.observations, &weighted)?;
        let log_std_product = log_std_part.affine(2., 0.)?;
        let product = Tensor::cat(&[&net_product, &log_std_product], 0)?;
        Ok(product.add(&vector.affine(self.damping, 0.)?)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::Device;
    use mbrl_core::sequential::Activation;

    #[test]
    fn linear_policy_matches_closed_form() -> Result<()> {
        let device = Device::Cpu;
        // mean = M x + b, log_std = 0 so every sample is weighted by 2 / (2 + 1e-8)
        let mut policy = GaussianMlp::new(3, 2, &[], Activation::Tanh, 0., -5., 1, &device)?;
        let mut values: Vec<f32> = (0..policy.num_params()).map(|i| 0.1 * i as f32 - 0.4).collect();
        let n = values.len();
        values[n - 2] = 0.;
        values[n - 1] = 0.;
        policy.set_param_values(&values, true, true)?;
        let xs = [[0.5f32, -1., 2.], [1.5, 0.25, -0.5], [-1., 1., 1.], [0., 0.5, 0.]];
        let observations = Tensor::new(&xs, &device)?;
        let fvp = FisherVectorProduct::new(&policy, observations, 0.)?;
        // v = [V (2x3), vb (2), v_logstd (2)]
        let v_w = [[0.3f32, -0.2, 0.1], [0.05, 0.4, -0.3]];
        let v_b = [0.2f32, -0.1];
        let v_ls = [0.7f32, -1.3];
        let mut vector: Vec<f32> = v_w.iter().flatten().copied().collect();
        vector.extend(v_b);
        vector.extend(v_ls);
        let product = fvp.apply(&Tensor::new(vector.as_slice(), &device)?)?.to_vec1::<f32>()?;

        let c = 2. / (2. + 1e-8) / xs.len() as f32;
        let mut expected_w = [[0f32; 3]; 2];
        let mut expected_b = [0f32; 2];
        for x in &xs {
            for o in 0..2 {
                let vx: f32 = (0..3).map(|i| v_w[o][i] * x[i]).sum::<f32>() + v_b[o];
                for i in 0..3 {
                    expected_w[o][i] += c * vx * x[i];
                }
                expected_b[o] += c * vx;
            }
        }
        let mut expected: Vec<f32> = expected_w.iter().flatten().copied().collect();
        expected.extend(expected_b);
        expected.extend(v_ls.iter().map(|v| 2. * v));
        assert_eq!(product.len(), expected.len());
        for (got, want) in product.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-5, "{got} != {want}");
        }
        Ok(())
    }

    #[test]
    fn damping_adds_scaled_identity() -> Result<()> {
        let device = Device::Cpu;
        let policy = GaussianMlp::new(2, 1, &[4], Activation::Tanh, -0.5, -5., 1, &device)?;
        let observations = Tensor::new(&[[0.1f32, 0.2], [0.3, -0.4]], &device)?;
        let size = policy.num_params();
        let vector = Tensor::new(
            (0..size).map(|i| (i as f32 * 0.37).sin()).collect::<Vec<_>>().as_slice(),
            &device,
        )?;
        let plain = FisherVectorProduct::new(&policy, observations.clone(), 0.)?.apply(&vector)?;
        let damped = FisherVectorProduct::new(&policy, observations, 0.5)?.apply(&vector)?;
        let diff = damped.sub(&plain)?.sub(&vector.affine(0.5, 0.)?)?;
        assert!(diff.abs()?.max_all()?.to_scalar::<f32>()? < 1e-5);
        Ok(())
    }
}
