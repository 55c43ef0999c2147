#![allow(clippy::type_complexity, clippy::too_many_arguments)]

pub mod bleu;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod decode;
pub mod error;
pub mod evaluate;
pub mod mask;
pub mod model;
pub mod optim;
pub mod tokenizer;
pub mod train;
pub mod utils;
pub mod vocab;

pub use error::{Error, Result};
