use candle_core::{Result, Tensor};

/// Concatenates the flattened tensors into one vector.
pub fn flatten(tensors: &[Tensor]) -> Result<Tensor> {
    let flat = tensors
        .iter()
        .map(|t| t.flatten_all())
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&flat, 0)
}

/// Splits a flat vector into blocks of the given shapes.
pub fn unflatten(flat: &Tensor, shapes: &[Vec<usize>]) -> Result<Vec<Tensor>> {
    let mut offset = 0;
    let mut blocks = Vec::with_capacity(shapes.len());
    for shape in shapes {
        let size: usize = shape.iter().product();
        blocks.push(flat.narrow(0, offset, size)?.reshape(shape.as_slice())?);
        offset += size;
    }
    Ok(blocks)
}

pub fn dot(a: &Tensor, b: &Tensor) -> Result<f32> {
    a.mul(b)?.sum_all()?.to_scalar::<f32>()
}
