use dfdx::prelude::tensor_collection::{ModuleVisitor, TensorCollection, TensorOptions};
use dfdx::prelude::*;

use super::Hidden;

/// Fixed sinusoidal position table, added to batched embeddings.
/// Not trained: the table is rebuilt on reset and never receives gradients.
#[derive(Debug, Clone)]
pub struct PositionalEncoding<const MAX_LEN: usize, const DIM: usize, E: Dtype, D: Storage<E>> {
    pub weight: Tensor<Rank2<MAX_LEN, DIM>, E, D>,
}

/// Row `pos`, column `2i` holds `sin(pos / 10000^(2i/dim))`, column `2i+1` the cosine.
pub fn sinusoid_table(max_len: usize, dim: usize) -> Vec<f32> {
    let mut table = vec![0.0; max_len * dim];
    for pos in 0..max_len {
        for i in (0..dim).step_by(2) {
            let den = (-(i as f32) * 10000_f32.ln() / dim as f32).exp();
            let angle = pos as f32 * den;
            table[pos * dim + i] = angle.sin();
            if i + 1 < dim {
                table[pos * dim + i + 1] = angle.cos();
            }
        }
    }
    table
}

impl<const L: usize, const M: usize, D: Device<f32>, T: Tape<f32, D>> Module<Hidden<M, D, T>>
    for PositionalEncoding<L, M, f32, D>
{
    type Output = Hidden<M, D, T>;
    type Error = D::Err;

    fn try_forward(&self, input: Hidden<M, D, T>) -> Result<Self::Output, Self::Error> {
        let shape = *input.shape();
        let positions = self
            .weight
            .clone()
            .try_slice((..shape.1, ..))?
            .try_broadcast_like::<_, Axis<0>>(&shape)?;
        input.try_add(positions)
    }
}

impl<const L: usize, const M: usize, E: Dtype, D: Storage<E>> NonMutableModule
    for PositionalEncoding<L, M, E, D>
{
}

impl<const L: usize, const M: usize, D: Device<f32>> TensorCollection<f32, D>
    for PositionalEncoding<L, M, f32, D>
{
    type To<E2: Dtype, D2: Device<E2>> = PositionalEncoding<L, M, E2, D2>;

    fn iter_tensors<V: ModuleVisitor<Self, f32, D>>(
        visitor: &mut V,
    ) -> Result<Option<Self::To<V::E2, V::D2>>, V::Err> {
        visitor.visit_fields(
            Self::tensor(
                "weight",
                |s| &s.weight,
                |s| &mut s.weight,
                TensorOptions::detached(|t| {
                    t.copy_from(&sinusoid_table(L, M));
                    Ok(())
                }),
            ),
            |weight| PositionalEncoding { weight },
        )
    }
}
