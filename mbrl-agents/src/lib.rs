pub mod baseline;
pub mod conjugate_gradient;
pub mod npg;
