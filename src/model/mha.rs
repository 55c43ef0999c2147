use dfdx::{nn::modules::*, shapes::*, tensor::*, tensor_ops::*};

use super::{transformer::try_dropout, AttnBias, Hidden};

pub mod builder {
    #[derive(Debug, Clone)]
    pub struct MultiHeadAttention<const EMBED_DIM: usize, const NUM_HEADS: usize>;

    impl<const M: usize, const H: usize> MultiHeadAttention<M, H> {
        pub const TYPE_CHECK: () = assert!(
            M % H == 0,
            "NUM_HEADS must divide EMBED_DIM evenly!"
        );
    }
}

impl<const M: usize, const H: usize, D: Device<f32>> BuildOnDevice<D, f32>
    for builder::MultiHeadAttention<M, H>
where
    MultiHeadAttention<M, H, f32, D>: BuildModule<D, f32>,
{
    type Built = MultiHeadAttention<M, H, f32, D>;
    fn try_build_on_device(device: &D) -> Result<Self::Built, <D>::Err> {
        #[allow(clippy::let_unit_value)]
        let _ = Self::TYPE_CHECK;
        Self::Built::try_build(device)
    }
}

/// Multi-head attention whose scores are shifted by a caller supplied
/// (batch, head, query, key) bias before the softmax.
///
/// **Pytorch equivalent**: `torch.nn.MultiheadAttention(EMBED_DIM, NUM_HEADS, batch_first=True)`
/// called with a float `attn_mask` already merged with `key_padding_mask`.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention<const EMBED_DIM: usize, const NUM_HEADS: usize, E: Dtype, D: Storage<E>>
{
    pub w_q: Linear<EMBED_DIM, EMBED_DIM, E, D>,
    pub w_k: Linear<EMBED_DIM, EMBED_DIM, E, D>,
    pub w_v: Linear<EMBED_DIM, EMBED_DIM, E, D>,
    pub w_o: Linear<EMBED_DIM, EMBED_DIM, E, D>,
}

impl<const M: usize, const H: usize, D: Device<f32>> TensorCollection<f32, D>
    for MultiHeadAttention<M, H, f32, D>
{
    type To<E2: Dtype, D2: Device<E2>> = MultiHeadAttention<M, H, E2, D2>;

    fn iter_tensors<W: ModuleVisitor<Self, f32, D>>(
        visitor: &mut W,
    ) -> Result<Option<Self::To<W::E2, W::D2>>, W::Err> {
        visitor.visit_fields(
            (
                Self::module("w_q", |s| &s.w_q, |s| &mut s.w_q),
                Self::module("w_k", |s| &s.w_k, |s| &mut s.w_k),
                Self::module("w_v", |s| &s.w_v, |s| &mut s.w_v),
                Self::module("w_o", |s| &s.w_o, |s| &mut s.w_o),
            ),
            |(w_q, w_k, w_v, w_o)| MultiHeadAttention { w_q, w_k, w_v, w_o },
        )
    }
}

impl<const M: usize, const H: usize, D: Device<f32>> MultiHeadAttention<M, H, f32, D> {
    /// Queries carry the tape; keys and values are retaped onto it. `dropout`
    /// is applied to the attention weights after the softmax.
    pub fn try_forward<T: Tape<f32, D>>(
        &self,
        q: Hidden<M, D, T>,
        k: Hidden<M, D>,
        v: Hidden<M, D>,
        bias: &AttnBias<D>,
        dropout: f64,
    ) -> Result<Hidden<M, D, T>, D::Err> {
        let (b, s1, _) = *q.shape();
        let s2 = v.shape().1;

        let v = self
            .w_v
            .try_forward(v.retaped::<T>())?
            .try_reshape_like(&(b, s2, H, M / H))?
            .try_permute::<_, Axes4<0, 2, 1, 3>>()?;

        let k = self
            .w_k
            .try_forward(k.retaped::<T>())?
            .try_reshape_like(&(b, s2, H, M / H))?
            .try_permute::<_, Axes4<0, 2, 3, 1>>()?;

        let q = self
            .w_q
            .try_forward(q)?
            .try_reshape_like(&(b, s1, H, M / H))?
            .try_permute::<_, Axes4<0, 2, 1, 3>>()?;

        // (b, h, s1, s2)
        let scalar = 1.0 / ((M / H) as f32).sqrt();
        let weights = q
            .try_matmul(k)?
            .try_mul(scalar)?
            .try_add(bias.clone())?
            .try_softmax::<Axis<3>>()?;
        let weights = try_dropout(weights, dropout)?;

        let tokens = weights
            .try_matmul(v)?
            .try_permute::<_, Axes4<0, 2, 1, 3>>()?
            .try_reshape_like(&(b, s1, Const::<M>))?;

        self.w_o.try_forward(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::{attention_bias, AttentionMask, PaddingMask, MASKED};
    use crate::model::bias_tensor;

    #[test]
    fn output_keeps_query_shape() {
        let dev: Cpu = Default::default();
        let mha = builder::MultiHeadAttention::<8, 2>::build_on_device(&dev);
        let q: Hidden<8, Cpu> = dev.sample_normal_like(&(3, 4, Const::<8>));
        let kv: Hidden<8, Cpu> = dev.sample_normal_like(&(3, 6, Const::<8>));
        let bias = attention_bias(2, 4, None, &PaddingMask::none(3, 6));
        let bias = bias_tensor(&dev, &bias).unwrap();
        let out = mha.try_forward(q, kv.clone(), kv, &bias, 0.0).unwrap();
        assert_eq!(*out.shape(), (3, 4, Const::<8>));
    }

    #[test]
    fn masked_keys_do_not_affect_output() {
        let dev: Cpu = Default::default();
        let mha = builder::MultiHeadAttention::<8, 2>::build_on_device(&dev);
        let q: Hidden<8, Cpu> = dev.sample_normal_like(&(1, 3, Const::<8>));
        let kv: Hidden<8, Cpu> = dev.sample_normal_like(&(1, 3, Const::<8>));
        let causal = attention_bias(2, 3, Some(&AttentionMask::causal(3)), &PaddingMask::none(1, 3));
        let causal = bias_tensor(&dev, &causal).unwrap();

        // Changing the last key/value only moves the last query row.
        let mut changed = kv.as_vec();
        for x in changed[16..].iter_mut() {
            *x += 10.0;
        }
        let changed: Hidden<8, Cpu> = dev.tensor_from_vec(changed, (1, 3, Const::<8>));

        let a = mha.try_forward(q.clone(), kv.clone(), kv, &causal, 0.0).unwrap().as_vec();
        let b = mha.try_forward(q, changed.clone(), changed, &causal, 0.0).unwrap().as_vec();
        for (x, y) in a[..16].iter().zip(&b[..16]) {
            assert!((x - y).abs() < 1e-5);
        }
        assert!(a[16..].iter().zip(&b[16..]).any(|(x, y)| (x - y).abs() > 1e-5));
        assert!(MASKED < -1e8);
    }

    #[test]
    fn attention_dropout_only_in_training() {
        let dev: Cpu = Default::default();
        let mha = builder::MultiHeadAttention::<8, 2>::build_on_device(&dev);
        let q: Hidden<8, Cpu> = dev.sample_normal_like(&(2, 5, Const::<8>));
        let kv: Hidden<8, Cpu> = dev.sample_normal_like(&(2, 5, Const::<8>));
        let bias = bias_tensor(&dev, &attention_bias(2, 5, None, &PaddingMask::none(2, 5))).unwrap();

        let a = mha.try_forward(q.clone(), kv.clone(), kv.clone(), &bias, 0.0).unwrap().as_vec();
        let b = mha.try_forward(q.clone(), kv.clone(), kv.clone(), &bias, 0.0).unwrap().as_vec();
        assert_eq!(a, b);

        let dropped = mha
            .try_forward(q.leaky_traced(), kv.clone(), kv, &bias, 0.5)
            .unwrap()
            .retaped::<NoneTape>()
            .as_vec();
        assert!(a.iter().zip(&dropped).any(|(x, y)| (x - y).abs() > 1e-5));
    }
}
