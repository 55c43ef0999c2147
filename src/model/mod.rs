pub mod embedding;
pub mod mha;
pub mod position_encoding;
pub mod seq2seq;
pub mod transformer;

use dfdx::{
    nn::modules::{LayerNorm1D, Linear, Repeated},
    shapes::{Const, HasShape, Shape},
    tensor::{NoneTape, Storage, Tensor},
    tensor_ops::Device,
};
use rand_distr::Uniform;

use crate::mask::{attention_bias, AttentionBias, Masks};

use self::{
    embedding::TokenEmbedding,
    mha::MultiHeadAttention,
    transformer::{DecoderBlock, EncoderBlock, FeedForward, TransformerDecoder, TransformerEncoder},
};

/// Batched activations: (batch, seq, model dim).
pub type Hidden<const M: usize, D, T = NoneTape> = Tensor<(usize, usize, Const<M>), f32, D, T>;

/// Additive attention bias: (batch, heads, queries, keys).
pub type AttnBias<D> = Tensor<(usize, usize, usize, usize), f32, D>;

pub type Model<
    const SRC_VOCAB: usize,
    const TGT_VOCAB: usize,
    const EMBED: usize,
    const HEADS: usize,
    const FF: usize,
    const ENCODER_LAYERS: usize,
    const DECODER_LAYERS: usize,
    const MAX_LEN: usize,
> = seq2seq::builder::Seq2SeqTransformer<
    SRC_VOCAB,
    TGT_VOCAB,
    EMBED,
    HEADS,
    FF,
    ENCODER_LAYERS,
    DECODER_LAYERS,
    MAX_LEN,
>;

pub type BuiltModel<
    const SRC_VOCAB: usize,
    const TGT_VOCAB: usize,
    const EMBED: usize,
    const HEADS: usize,
    const FF: usize,
    const ENCODER_LAYERS: usize,
    const DECODER_LAYERS: usize,
    const MAX_LEN: usize,
    D,
> = seq2seq::Seq2SeqTransformer<
    SRC_VOCAB,
    TGT_VOCAB,
    EMBED,
    HEADS,
    FF,
    ENCODER_LAYERS,
    DECODER_LAYERS,
    MAX_LEN,
    f32,
    D,
>;

pub fn bias_tensor<D: Device<f32>>(dev: &D, bias: &AttentionBias) -> Result<AttnBias<D>, D::Err> {
    dev.try_tensor_from_vec(bias.data.clone(), bias.shape)
}

/// The three attention biases a batch needs, on device.
#[derive(Debug, Clone)]
pub struct MaskTensors<D: Storage<f32>> {
    /// Encoder self-attention: source mask plus source padding.
    pub src: AttnBias<D>,
    /// Decoder self-attention: causal mask plus target padding.
    pub tgt: AttnBias<D>,
    /// Decoder attention over memory: source padding.
    pub memory: AttnBias<D>,
}

impl<D: Device<f32>> MaskTensors<D> {
    pub fn try_new(dev: &D, masks: &Masks, heads: usize) -> Result<Self, D::Err> {
        let src_len = masks.src_mask.size();
        let tgt_len = masks.tgt_mask.size();
        Ok(Self {
            src: bias_tensor(
                dev,
                &attention_bias(heads, src_len, Some(&masks.src_mask), &masks.src_padding_mask),
            )?,
            tgt: bias_tensor(
                dev,
                &attention_bias(heads, tgt_len, Some(&masks.tgt_mask), &masks.tgt_padding_mask),
            )?,
            memory: bias_tensor(
                dev,
                &attention_bias(heads, tgt_len, None, &masks.src_padding_mask),
            )?,
        })
    }
}

/// Visits every trainable tensor under a stable dotted name.
pub trait ParamVisitor<D: Storage<f32>> {
    type Err;

    fn visit<S: Shape>(&mut self, name: &str, param: &mut Tensor<S, f32, D>) -> Result<(), Self::Err>;
}

/// Trainable parameters of a module, in a fixed order.
pub trait Parameters<D: Storage<f32>> {
    fn visit_params<V: ParamVisitor<D>>(&mut self, prefix: &str, visitor: &mut V) -> Result<(), V::Err>;
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

impl<const I: usize, const O: usize, D: Storage<f32>> Parameters<D> for Linear<I, O, f32, D> {
    fn visit_params<V: ParamVisitor<D>>(&mut self, prefix: &str, visitor: &mut V) -> Result<(), V::Err> {
        visitor.visit(&join(prefix, "weight"), &mut self.weight)?;
        visitor.visit(&join(prefix, "bias"), &mut self.bias)
    }
}

impl<const M: usize, D: Storage<f32>> Parameters<D> for LayerNorm1D<M, f32, D> {
    fn visit_params<V: ParamVisitor<D>>(&mut self, prefix: &str, visitor: &mut V) -> Result<(), V::Err> {
        visitor.visit(&join(prefix, "gamma"), &mut self.gamma)?;
        visitor.visit(&join(prefix, "beta"), &mut self.beta)
    }
}

impl<T: Parameters<D>, D: Storage<f32>, const N: usize> Parameters<D> for Repeated<T, N> {
    fn visit_params<V: ParamVisitor<D>>(&mut self, prefix: &str, visitor: &mut V) -> Result<(), V::Err> {
        for (i, module) in self.modules.iter_mut().enumerate() {
            module.visit_params(&join(prefix, &i.to_string()), visitor)?;
        }
        Ok(())
    }
}

impl<const V: usize, const M: usize, D: Storage<f32>> Parameters<D> for TokenEmbedding<V, M, f32, D> {
    fn visit_params<W: ParamVisitor<D>>(&mut self, prefix: &str, visitor: &mut W) -> Result<(), W::Err> {
        visitor.visit(&join(prefix, "weight"), &mut self.weight)
    }
}

impl<const M: usize, const H: usize, D: Storage<f32>> Parameters<D> for MultiHeadAttention<M, H, f32, D> {
    fn visit_params<V: ParamVisitor<D>>(&mut self, prefix: &str, visitor: &mut V) -> Result<(), V::Err> {
        self.w_q.visit_params(&join(prefix, "w_q"), visitor)?;
        self.w_k.visit_params(&join(prefix, "w_k"), visitor)?;
        self.w_v.visit_params(&join(prefix, "w_v"), visitor)?;
        self.w_o.visit_params(&join(prefix, "w_o"), visitor)
    }
}

fn visit_feed_forward<const M: usize, const F: usize, D: Storage<f32>, V: ParamVisitor<D>>(
    ff: &mut FeedForward<M, F, f32, D>,
    prefix: &str,
    visitor: &mut V,
) -> Result<(), V::Err> {
    ff.0.visit_params(&join(prefix, "0"), visitor)?;
    ff.1.visit_params(&join(prefix, "1"), visitor)
}

impl<const M: usize, const H: usize, const F: usize, D: Storage<f32>> Parameters<D>
    for EncoderBlock<M, H, F, f32, D>
{
    fn visit_params<V: ParamVisitor<D>>(&mut self, prefix: &str, visitor: &mut V) -> Result<(), V::Err> {
        self.self_attn.visit_params(&join(prefix, "self_attn"), visitor)?;
        self.norm1.visit_params(&join(prefix, "norm1"), visitor)?;
        visit_feed_forward(&mut self.ff, &join(prefix, "ff"), visitor)?;
        self.norm2.visit_params(&join(prefix, "norm2"), visitor)
    }
}

impl<const M: usize, const H: usize, const F: usize, D: Storage<f32>> Parameters<D>
    for DecoderBlock<M, H, F, f32, D>
{
    fn visit_params<V: ParamVisitor<D>>(&mut self, prefix: &str, visitor: &mut V) -> Result<(), V::Err> {
        self.self_attn.visit_params(&join(prefix, "self_attn"), visitor)?;
        self.norm1.visit_params(&join(prefix, "norm1"), visitor)?;
        self.mh_attn.visit_params(&join(prefix, "mh_attn"), visitor)?;
        self.norm2.visit_params(&join(prefix, "norm2"), visitor)?;
        visit_feed_forward(&mut self.ff, &join(prefix, "ff"), visitor)?;
        self.norm3.visit_params(&join(prefix, "norm3"), visitor)
    }
}

impl<const M: usize, const H: usize, const F: usize, const L: usize, D: Storage<f32>> Parameters<D>
    for TransformerEncoder<M, H, F, L, f32, D>
{
    fn visit_params<V: ParamVisitor<D>>(&mut self, prefix: &str, visitor: &mut V) -> Result<(), V::Err> {
        self.layers.visit_params(&join(prefix, "layers"), visitor)?;
        self.norm.visit_params(&join(prefix, "norm"), visitor)
    }
}

impl<const M: usize, const H: usize, const F: usize, const L: usize, D: Storage<f32>> Parameters<D>
    for TransformerDecoder<M, H, F, L, f32, D>
{
    fn visit_params<V: ParamVisitor<D>>(&mut self, prefix: &str, visitor: &mut V) -> Result<(), V::Err> {
        self.layers.visit_params(&join(prefix, "layers"), visitor)?;
        self.norm.visit_params(&join(prefix, "norm"), visitor)
    }
}

/// The positional table is fixed and not visited.
impl<
        const SV: usize,
        const TV: usize,
        const M: usize,
        const H: usize,
        const F: usize,
        const EL: usize,
        const DL: usize,
        const L: usize,
        D: Storage<f32>,
    > Parameters<D> for BuiltModel<SV, TV, M, H, F, EL, DL, L, D>
{
    fn visit_params<V: ParamVisitor<D>>(&mut self, prefix: &str, visitor: &mut V) -> Result<(), V::Err> {
        self.src_tok_emb.visit_params(&join(prefix, "src_tok_emb"), visitor)?;
        self.tgt_tok_emb.visit_params(&join(prefix, "tgt_tok_emb"), visitor)?;
        self.encoder.visit_params(&join(prefix, "encoder"), visitor)?;
        self.decoder.visit_params(&join(prefix, "decoder"), visitor)?;
        self.generator.visit_params(&join(prefix, "generator"), visitor)
    }
}

/// Glorot uniform initialisation of every parameter with two or more dimensions.
pub struct XavierUniform;

impl<D: Device<f32>> ParamVisitor<D> for XavierUniform {
    type Err = D::Err;

    fn visit<S: Shape>(&mut self, _: &str, param: &mut Tensor<S, f32, D>) -> Result<(), D::Err> {
        if S::NUM_DIMS < 2 {
            return Ok(());
        }
        let fan_out = param.shape().concrete()[0];
        let fan_in = param.shape().num_elements() / fan_out.max(1);
        let b = (6.0 / (fan_in + fan_out) as f32).sqrt();
        param.try_fill_with_distr(Uniform::new(-b, b))
    }
}

pub fn try_xavier_init<P: Parameters<D>, D: Device<f32>>(model: &mut P) -> Result<(), D::Err> {
    model.visit_params("", &mut XavierUniform)
}

/// Total number of values across all visited parameters.
pub fn num_params<P: Parameters<D>, D: Storage<f32>>(model: &mut P) -> usize {
    struct Counter(usize);
    impl<D: Storage<f32>> ParamVisitor<D> for Counter {
        type Err = std::convert::Infallible;
        fn visit<S: Shape>(&mut self, _: &str, param: &mut Tensor<S, f32, D>) -> Result<(), Self::Err> {
            self.0 += param.shape().num_elements();
            Ok(())
        }
    }
    let mut counter = Counter(0);
    if let Err(never) = model.visit_params("", &mut counter) {
        match never {}
    }
    counter.0
}
