use std::fmt::Display;

use crate::model::{BuiltModel, Model};

pub const UNK_IDX: usize = 0;
pub const PAD_IDX: usize = 1;
pub const BOS_IDX: usize = 2;
pub const EOS_IDX: usize = 3;

/// Special symbols, ordered so that each symbol's position is its id.
pub const SPECIAL_SYMBOLS: [&str; 4] = ["<unk>", "<pad>", "<bos>", "<eos>"];

// Model
pub const EMB_SIZE: usize = 512;
pub const NHEAD: usize = 8;
pub const FFN_HID_DIM: usize = 512;
pub const NUM_ENCODER_LAYERS: usize = 3;
pub const NUM_DECODER_LAYERS: usize = 3;
pub const MAX_LEN: usize = 5000;
pub const DROPOUT: f64 = 0.1;

/// Output widths are fixed at compile time, so vocabularies are built with
/// these as their `max_tokens` cap.
pub const SRC_VOCAB_SIZE: usize = 19_215;
pub const TGT_VOCAB_SIZE: usize = 10_838;

#[cfg(feature = "cuda")]
pub type Dev = dfdx::tensor::Cuda;
#[cfg(not(feature = "cuda"))]
pub type Dev = dfdx::tensor::Cpu;

/// Builder for [`Translator`].
pub type TranslatorModel = Model<
    SRC_VOCAB_SIZE,
    TGT_VOCAB_SIZE,
    EMB_SIZE,
    NHEAD,
    FFN_HID_DIM,
    NUM_ENCODER_LAYERS,
    NUM_DECODER_LAYERS,
    MAX_LEN,
>;

/// The German to English translator at full size.
pub type Translator<D> = BuiltModel<
    SRC_VOCAB_SIZE,
    TGT_VOCAB_SIZE,
    EMB_SIZE,
    NHEAD,
    FFN_HID_DIM,
    NUM_ENCODER_LAYERS,
    NUM_DECODER_LAYERS,
    MAX_LEN,
    D,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    De,
    En,
}

impl Language {
    pub fn code(&self) -> &'static str {
        match self {
            Language::De => "de",
            Language::En => "en",
        }
    }
}

impl Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

pub const SRC_LANGUAGE: Language = Language::De;
pub const TGT_LANGUAGE: Language = Language::En;
