use anyhow::Result;
use candle_core::Tensor;
use mbrl_core::utils::flat::dot;

/// Approximately solves `A x = b` for a symmetric positive definite `A` that is only available
/// through the product `f_ax`. Stops after `cg_iters` iterations, once the squared residual drops
/// below `residual_tol`, or when a direction of non-positive curvature shows up.
pub fn cg_solve<F>(mut f_ax: F, b: &Tensor, cg_iters: usize, residual_tol: f32) -> Result<Tensor>
where
    F: FnMut(&Tensor) -> Result<Tensor>,
{
    let mut x = b.zeros_like()?;
    let mut r = b.copy()?;
    let mut p = b.copy()?;
    let mut rdotr = dot(&r, &r)?;
    if rdotr < residual_tol {
        return Ok(x);
    }
    for iter in 0..cg_iters {
        let z = f_ax(&p)?;
        let pz = dot(&p, &z)?;
        if pz <= 0. || !pz.is_finite() {
            tracing::warn!(iter, pz, "conjugate gradient hit non-positive curvature");
            break;
        }
        let v = (rdotr / pz) as f64;
        x = x.add(&p.affine(v, 0.)?)?;
        r = r.sub(&z.affine(v, 0.)?)?;
        let new_rdotr = dot(&r, &r)?;
        let mu = (new_rdotr / rdotr) as f64;
        p = r.add(&p.affine(mu, 0.)?)?;
        rdotr = new_rdotr;
        if rdotr < residual_tol {
            break;
        }
    }
    Ok(x)
}
