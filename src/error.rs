use std::fmt::Debug;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("shape mismatch for `{name}`: expected {expected} values, found {found}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("device error: {0}")]
    Device(String),
}

impl Error {
    /// Device errors differ per backend, so they are carried by their debug text.
    pub fn device<E: Debug>(err: E) -> Self {
        Error::Device(format!("{err:?}"))
    }

    pub fn checkpoint<E: Debug>(err: E) -> Self {
        Error::Checkpoint(format!("{err:?}"))
    }
}
