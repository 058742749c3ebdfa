use candle_core::Tensor;
use derive_more::{Deref, DerefMut, Display};

#[derive(Deref, DerefMut, Debug, Display, Clone)]
pub struct Advantages(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display, Clone)]
pub struct Returns(pub Tensor);

/// A flat vector laid out like the policy parameters.
#[derive(Deref, DerefMut, Debug, Display, Clone)]
pub struct FlatGrad(pub Tensor);
