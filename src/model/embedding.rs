use dfdx::prelude::tensor_collection::{ModuleVisitor, TensorCollection, TensorOptions};
use dfdx::prelude::*;
use rand_distr::Uniform;

use super::Hidden;

/// Token embedding scaled by `sqrt(DIM)`.
#[derive(Debug, Clone)]
pub struct TokenEmbedding<const VOCAB: usize, const DIM: usize, E: Dtype, D: Storage<E>> {
    pub weight: Tensor<Rank2<VOCAB, DIM>, E, D>,
}

impl<const V: usize, const M: usize, E: Dtype, D: Storage<E>> NonMutableModule
    for TokenEmbedding<V, M, E, D>
{
}

impl<const V: usize, const M: usize, D: Device<f32>> TensorCollection<f32, D>
    for TokenEmbedding<V, M, f32, D>
{
    type To<E2: Dtype, D2: Device<E2>> = TokenEmbedding<V, M, E2, D2>;

    fn iter_tensors<W: ModuleVisitor<Self, f32, D>>(
        visitor: &mut W,
    ) -> Result<Option<Self::To<W::E2, W::D2>>, W::Err> {
        visitor.visit_fields(
            Self::tensor(
                "weight",
                |s| &s.weight,
                |s| &mut s.weight,
                TensorOptions::reset_with(|t| {
                    let b = (6.0 / (V + M) as f32).sqrt();
                    t.try_fill_with_distr(Uniform::new(-b, b))
                }),
            ),
            |weight| TokenEmbedding { weight },
        )
    }
}

impl<const V: usize, const M: usize, D: Device<f32>, T: Tape<f32, D>>
    Module<Tensor<(usize, usize), usize, D, T>> for TokenEmbedding<V, M, f32, D>
{
    type Output = Hidden<M, D, T>;
    type Error = D::Err;

    fn try_forward(&self, input: Tensor<(usize, usize), usize, D, T>) -> Result<Self::Output, D::Err> {
        let (input, tape) = input.split_tape();
        self.weight
            .clone()
            .put_tape(tape)
            .try_gather(input)?
            .try_mul((M as f32).sqrt())
    }
}
