use dfdx::{
    nn::modules::*,
    shapes::{Dtype, Shape},
    tensor::{PutTape, SplitTape, Storage, Tape, Tensor},
    tensor_ops::{Device, TryAdd},
};

use super::{mha::MultiHeadAttention, AttnBias, Hidden};

pub type FeedForward<const M: usize, const F: usize, E, D> = (Linear<M, F, E, D>, Linear<F, M, E, D>);

/// Post-norm encoder layer: self-attention then feed-forward, each wrapped in
/// a residual connection followed by layer norm.
#[derive(Clone, Debug)]
pub struct EncoderBlock<
    const MODEL_DIM: usize,
    const NUM_HEADS: usize,
    const FF_DIM: usize,
    E: Dtype,
    D: Storage<E>,
> {
    pub self_attn: MultiHeadAttention<MODEL_DIM, NUM_HEADS, E, D>,
    pub norm1: LayerNorm1D<MODEL_DIM, E, D>,
    pub ff: FeedForward<MODEL_DIM, FF_DIM, E, D>,
    pub norm2: LayerNorm1D<MODEL_DIM, E, D>,
}

/// Post-norm decoder layer: masked self-attention, attention over the encoder
/// memory, then feed-forward.
#[derive(Clone, Debug)]
pub struct DecoderBlock<
    const MODEL_DIM: usize,
    const NUM_HEADS: usize,
    const FF_DIM: usize,
    E: Dtype,
    D: Storage<E>,
> {
    pub self_attn: MultiHeadAttention<MODEL_DIM, NUM_HEADS, E, D>,
    pub norm1: LayerNorm1D<MODEL_DIM, E, D>,
    pub mh_attn: MultiHeadAttention<MODEL_DIM, NUM_HEADS, E, D>,
    pub norm2: LayerNorm1D<MODEL_DIM, E, D>,
    pub ff: FeedForward<MODEL_DIM, FF_DIM, E, D>,
    pub norm3: LayerNorm1D<MODEL_DIM, E, D>,
}

#[derive(Clone, Debug)]
pub struct TransformerEncoder<
    const MODEL_DIM: usize,
    const NUM_HEADS: usize,
    const FF_DIM: usize,
    const NUM_LAYERS: usize,
    E: Dtype,
    D: Storage<E>,
> {
    pub layers: Repeated<EncoderBlock<MODEL_DIM, NUM_HEADS, FF_DIM, E, D>, NUM_LAYERS>,
    pub norm: LayerNorm1D<MODEL_DIM, E, D>,
}

#[derive(Clone, Debug)]
pub struct TransformerDecoder<
    const MODEL_DIM: usize,
    const NUM_HEADS: usize,
    const FF_DIM: usize,
    const NUM_LAYERS: usize,
    E: Dtype,
    D: Storage<E>,
> {
    pub layers: Repeated<DecoderBlock<MODEL_DIM, NUM_HEADS, FF_DIM, E, D>, NUM_LAYERS>,
    pub norm: LayerNorm1D<MODEL_DIM, E, D>,
}

pub(crate) fn try_dropout<S: Shape, D: Device<f32>, T: Tape<f32, D>>(
    x: Tensor<S, f32, D, T>,
    p: f64,
) -> Result<Tensor<S, f32, D, T>, D::Err> {
    if p > 0.0 {
        x.try_dropout(p)
    } else {
        Ok(x)
    }
}

fn try_feed_forward<const M: usize, const F: usize, D: Device<f32>, T: Tape<f32, D>>(
    ff: &FeedForward<M, F, f32, D>,
    x: Hidden<M, D, T>,
    dropout: f64,
) -> Result<Hidden<M, D, T>, D::Err> {
    let x = try_dropout(ff.0.try_forward(x)?.try_relu()?, dropout)?;
    try_dropout(ff.1.try_forward(x)?, dropout)
}

impl<const M: usize, const H: usize, const F: usize, D: Device<f32>> EncoderBlock<M, H, F, f32, D> {
    pub fn try_forward<T: Tape<f32, D>>(
        &self,
        src: Hidden<M, D, T>,
        bias: &AttnBias<D>,
        dropout: f64,
    ) -> Result<Hidden<M, D, T>, D::Err> {
        let (src, tape) = src.split_tape();
        let x = self.self_attn.try_forward(
            src.clone().put_tape(tape),
            src.clone(),
            src.clone(),
            bias,
            dropout,
        )?;
        let x = self.norm1.try_forward(try_dropout(x, dropout)?.try_add(src)?)?;

        let (x, tape) = x.split_tape();
        let ff = try_feed_forward(&self.ff, x.clone().put_tape(tape), dropout)?;
        self.norm2.try_forward(ff.try_add(x)?)
    }
}

impl<const M: usize, const H: usize, const F: usize, D: Device<f32>> DecoderBlock<M, H, F, f32, D> {
    pub fn try_forward<T: Tape<f32, D>>(
        &self,
        tgt: Hidden<M, D, T>,
        memory: &Hidden<M, D>,
        tgt_bias: &AttnBias<D>,
        memory_bias: &AttnBias<D>,
        dropout: f64,
    ) -> Result<Hidden<M, D, T>, D::Err> {
        let (tgt, tape) = tgt.split_tape();
        let x = self.self_attn.try_forward(
            tgt.clone().put_tape(tape),
            tgt.clone(),
            tgt.clone(),
            tgt_bias,
            dropout,
        )?;
        let x = self.norm1.try_forward(try_dropout(x, dropout)?.try_add(tgt)?)?;

        let (x, tape) = x.split_tape();
        let attn = self.mh_attn.try_forward(
            x.clone().put_tape(tape),
            memory.clone(),
            memory.clone(),
            memory_bias,
            dropout,
        )?;
        let x = self.norm2.try_forward(try_dropout(attn, dropout)?.try_add(x)?)?;

        let (x, tape) = x.split_tape();
        let ff = try_feed_forward(&self.ff, x.clone().put_tape(tape), dropout)?;
        self.norm3.try_forward(ff.try_add(x)?)
    }
}

impl<const M: usize, const H: usize, const F: usize, const L: usize, D: Device<f32>>
    TransformerEncoder<M, H, F, L, f32, D>
{
    pub fn try_forward<T: Tape<f32, D>>(
        &self,
        src: Hidden<M, D, T>,
        bias: &AttnBias<D>,
        dropout: f64,
    ) -> Result<Hidden<M, D, T>, D::Err> {
        let mut x = src;
        for block in self.layers.modules.iter() {
            x = block.try_forward(x, bias, dropout)?;
        }
        self.norm.try_forward(x)
    }
}

impl<const M: usize, const H: usize, const F: usize, const L: usize, D: Device<f32>>
    TransformerDecoder<M, H, F, L, f32, D>
{
    pub fn try_forward<T: Tape<f32, D>>(
        &self,
        tgt: Hidden<M, D, T>,
        memory: &Hidden<M, D>,
        tgt_bias: &AttnBias<D>,
        memory_bias: &AttnBias<D>,
        dropout: f64,
    ) -> Result<Hidden<M, D, T>, D::Err> {
        let mut x = tgt;
        for block in self.layers.modules.iter() {
            x = block.try_forward(x, memory, tgt_bias, memory_bias, dropout)?;
        }
        self.norm.try_forward(x)
    }
}

impl<const M: usize, const H: usize, const F: usize, D: Device<f32>> TensorCollection<f32, D>
    for EncoderBlock<M, H, F, f32, D>
{
    type To<E2: Dtype, D2: Device<E2>> = EncoderBlock<M, H, F, E2, D2>;

    fn iter_tensors<V: ModuleVisitor<Self, f32, D>>(
        visitor: &mut V,
    ) -> Result<Option<Self::To<V::E2, V::D2>>, V::Err> {
        visitor.visit_fields(
            (
                Self::module("self_attn", |s| &s.self_attn, |s| &mut s.self_attn),
                Self::module("norm1", |s| &s.norm1, |s| &mut s.norm1),
                Self::module("ff", |s| &s.ff, |s| &mut s.ff),
                Self::module("norm2", |s| &s.norm2, |s| &mut s.norm2),
            ),
            |(self_attn, norm1, ff, norm2)| EncoderBlock {
                self_attn,
                norm1,
                ff,
                norm2,
            },
        )
    }
}

impl<const M: usize, const H: usize, const F: usize, D: Device<f32>> TensorCollection<f32, D>
    for DecoderBlock<M, H, F, f32, D>
{
    type To<E2: Dtype, D2: Device<E2>> = DecoderBlock<M, H, F, E2, D2>;

    fn iter_tensors<V: ModuleVisitor<Self, f32, D>>(
        visitor: &mut V,
    ) -> Result<Option<Self::To<V::E2, V::D2>>, V::Err> {
        visitor.visit_fields(
            (
                Self::module("self_attn", |s| &s.self_attn, |s| &mut s.self_attn),
                Self::module("norm1", |s| &s.norm1, |s| &mut s.norm1),
                Self::module("mh_attn", |s| &s.mh_attn, |s| &mut s.mh_attn),
                Self::module("norm2", |s| &s.norm2, |s| &mut s.norm2),
                Self::module("ff", |s| &s.ff, |s| &mut s.ff),
                Self::module("norm3", |s| &s.norm3, |s| &mut s.norm3),
            ),
            |(self_attn, norm1, mh_attn, norm2, ff, norm3)| DecoderBlock {
                self_attn,
                norm1,
                mh_attn,
                norm2,
                ff,
                norm3,
            },
        )
    }
}

impl<const M: usize, const H: usize, const F: usize, const L: usize, D: Device<f32>>
    TensorCollection<f32, D> for TransformerEncoder<M, H, F, L, f32, D>
{
    type To<E2: Dtype, D2: Device<E2>> = TransformerEncoder<M, H, F, L, E2, D2>;

    fn iter_tensors<V: ModuleVisitor<Self, f32, D>>(
        visitor: &mut V,
    ) -> Result<Option<Self::To<V::E2, V::D2>>, V::Err> {
        visitor.visit_fields(
            (
                Self::module("layers", |s| &s.layers, |s| &mut s.layers),
                Self::module("norm", |s| &s.norm, |s| &mut s.norm),
            ),
            |(layers, norm)| TransformerEncoder { layers, norm },
        )
    }
}

impl<const M: usize, const H: usize, const F: usize, const L: usize, D: Device<f32>>
    TensorCollection<f32, D> for TransformerDecoder<M, H, F, L, f32, D>
{
    type To<E2: Dtype, D2: Device<E2>> = TransformerDecoder<M, H, F, L, E2, D2>;

    fn iter_tensors<V: ModuleVisitor<Self, f32, D>>(
        visitor: &mut V,
    ) -> Result<Option<Self::To<V::E2, V::D2>>, V::Err> {
        visitor.visit_fields(
            (
                Self::module("layers", |s| &s.layers, |s| &mut s.layers),
                Self::module("norm", |s| &s.norm, |s| &mut s.norm),
            ),
            |(layers, norm)| TransformerDecoder { layers, norm },
        )
    }
}
