use dfdx::prelude::tensor_collection::{ModuleVisitor, TensorCollection};
use dfdx::{nn::modules::*, shapes::*, tensor::*, tensor_ops::*};

use super::{
    embedding::TokenEmbedding,
    position_encoding::PositionalEncoding,
    transformer::{try_dropout, TransformerDecoder, TransformerEncoder},
    AttnBias, Hidden, MaskTensors,
};

pub mod builder {
    #[derive(Debug)]
    pub struct Seq2SeqTransformer<
        const SRC_VOCAB: usize,
        const TGT_VOCAB: usize,
        const EMBED: usize,
        const HEADS: usize,
        const FF: usize,
        const ENCODER_LAYERS: usize,
        const DECODER_LAYERS: usize,
        const MAX_LEN: usize,
    >;

    impl<
            const SV: usize,
            const TV: usize,
            const M: usize,
            const H: usize,
            const F: usize,
            const EL: usize,
            const DL: usize,
            const L: usize,
        > Seq2SeqTransformer<SV, TV, M, H, F, EL, DL, L>
    {
        pub const TYPE_CHECK: () = assert!(M % H == 0, "HEADS must divide EMBED evenly!");
    }
}

impl<
        const SV: usize,
        const TV: usize,
        const M: usize,
        const H: usize,
        const F: usize,
        const EL: usize,
        const DL: usize,
        const L: usize,
        D: Device<f32>,
    > BuildOnDevice<D, f32> for builder::Seq2SeqTransformer<SV, TV, M, H, F, EL, DL, L>
where
    Seq2SeqTransformer<SV, TV, M, H, F, EL, DL, L, f32, D>: BuildModule<D, f32>,
{
    type Built = Seq2SeqTransformer<SV, TV, M, H, F, EL, DL, L, f32, D>;
    fn try_build_on_device(device: &D) -> Result<Self::Built, D::Err> {
        #[allow(clippy::let_unit_value)]
        let _ = Self::TYPE_CHECK;
        Self::Built::try_build(device)
    }
}

/// Encoder-decoder transformer over two vocabularies.
///
/// **Pytorch equivalent**: `nn.Transformer` between scaled token embeddings
/// with sinusoidal positions and a final `nn.Linear(EMBED, TGT_VOCAB)`.
#[derive(Debug, Clone)]
pub struct Seq2SeqTransformer<
    const SRC_VOCAB: usize,
    const TGT_VOCAB: usize,
    const EMBED: usize,
    const HEADS: usize,
    const FF: usize,
    const ENCODER_LAYERS: usize,
    const DECODER_LAYERS: usize,
    const MAX_LEN: usize,
    E: Dtype,
    D: Storage<E>,
> {
    pub src_tok_emb: TokenEmbedding<SRC_VOCAB, EMBED, E, D>,
    pub tgt_tok_emb: TokenEmbedding<TGT_VOCAB, EMBED, E, D>,
    pub positional_encoding: PositionalEncoding<MAX_LEN, EMBED, E, D>,
    pub encoder: TransformerEncoder<EMBED, HEADS, FF, ENCODER_LAYERS, E, D>,
    pub decoder: TransformerDecoder<EMBED, HEADS, FF, DECODER_LAYERS, E, D>,
    pub generator: Linear<EMBED, TGT_VOCAB, E, D>,
}

impl<
        const SV: usize,
        const TV: usize,
        const M: usize,
        const H: usize,
        const F: usize,
        const EL: usize,
        const DL: usize,
        const L: usize,
        D: Device<f32>,
    > Seq2SeqTransformer<SV, TV, M, H, F, EL, DL, L, f32, D>
{
    /// Source ids (batch, seq) to encoder memory.
    pub fn try_encode<T: Tape<f32, D>>(
        &self,
        src: Tensor<(usize, usize), usize, D, T>,
        src_bias: &AttnBias<D>,
        dropout: f64,
    ) -> Result<Hidden<M, D, T>, D::Err> {
        let x = self.src_tok_emb.try_forward(src)?;
        let x = try_dropout(self.positional_encoding.try_forward(x)?, dropout)?;
        self.encoder.try_forward(x, src_bias, dropout)
    }

    /// Target prefix ids (batch, seq) attending to `memory`, to decoder hidden states.
    pub fn try_decode<T: Tape<f32, D>>(
        &self,
        tgt: Tensor<(usize, usize), usize, D, T>,
        memory: &Hidden<M, D>,
        tgt_bias: &AttnBias<D>,
        memory_bias: &AttnBias<D>,
        dropout: f64,
    ) -> Result<Hidden<M, D, T>, D::Err> {
        let x = self.tgt_tok_emb.try_forward(tgt)?;
        let x = try_dropout(self.positional_encoding.try_forward(x)?, dropout)?;
        self.decoder
            .try_forward(x, memory, tgt_bias, memory_bias, dropout)
    }

    /// Full teacher-forced pass. The tape travels from `src` through the encoder
    /// and on into the decoder, so one backward reaches every parameter.
    pub fn try_forward<T: Tape<f32, D>>(
        &self,
        src: Tensor<(usize, usize), usize, D, T>,
        tgt: Tensor<(usize, usize), usize, D>,
        masks: &MaskTensors<D>,
        dropout: f64,
    ) -> Result<Tensor<(usize, usize, Const<TV>), f32, D, T>, D::Err> {
        let memory = self.try_encode(src, &masks.src, dropout)?;
        let (memory, tape) = memory.split_tape();
        let hidden = self.try_decode(
            tgt.put_tape(tape),
            &memory,
            &masks.tgt,
            &masks.memory,
            dropout,
        )?;
        self.generator.try_forward(hidden)
    }
}

impl<
        const SV: usize,
        const TV: usize,
        const M: usize,
        const H: usize,
        const F: usize,
        const EL: usize,
        const DL: usize,
        const L: usize,
        D: Device<f32>,
    > TensorCollection<f32, D> for Seq2SeqTransformer<SV, TV, M, H, F, EL, DL, L, f32, D>
{
    type To<E2: Dtype, D2: Device<E2>> = Seq2SeqTransformer<SV, TV, M, H, F, EL, DL, L, E2, D2>;

    fn iter_tensors<V: ModuleVisitor<Self, f32, D>>(
        visitor: &mut V,
    ) -> Result<Option<Self::To<V::E2, V::D2>>, V::Err> {
        visitor.visit_fields(
            (
                Self::module("src_tok_emb", |s| &s.src_tok_emb, |s| &mut s.src_tok_emb),
                Self::module("tgt_tok_emb", |s| &s.tgt_tok_emb, |s| &mut s.tgt_tok_emb),
                Self::module(
                    "positional_encoding",
                    |s| &s.positional_encoding,
                    |s| &mut s.positional_encoding,
                ),
                Self::module("encoder", |s| &s.encoder, |s| &mut s.encoder),
                Self::module("decoder", |s| &s.decoder, |s| &mut s.decoder),
                Self::module("generator", |s| &s.generator, |s| &mut s.generator),
            ),
            |(src_tok_emb, tgt_tok_emb, positional_encoding, encoder, decoder, generator)| {
                Seq2SeqTransformer {
                    src_tok_emb,
                    tgt_tok_emb,
                    positional_encoding,
                    encoder,
                    decoder,
                    generator,
                }
            },
        )
    }
}
