//! Error types shared by the whole crate.

use std::io;

use thiserror::Error;

/// Log-probability used in place of `ln(0)`.
///
/// Impossible gold paths contribute this value to the log-likelihood so the
/// objective stays finite and training can continue.
pub const LOG_ZERO: f64 = -708.3964185322641; // ln(f64::MIN_POSITIVE)

/// Errors produced while building, training, loading or applying a model.
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Corrupt or inconsistent model file, or a store that cannot be saved
    #[error("invalid model: {0}")]
    Model(String),

    /// Malformed training or test data
    #[error("invalid data at line {line}: {message}")]
    Data { line: usize, message: String },

    /// Parameter out of range or otherwise unusable input
    #[error("{0}")]
    InvalidInput(String),

    /// Misconfigured run: unknown model type, mismatched file lists, ...
    #[error("configuration error: {0}")]
    Config(String),

    /// Attempt to intern a new name into a frozen dictionary
    #[error("dictionary is sealed, cannot add '{0}'")]
    Sealed(String),

    /// Inference requested before the edge index was (re)built
    #[error("edge index is missing or stale, rebuild it before inference")]
    StaleIndex,
}

impl Error {
    pub(crate) fn model<S: Into<String>>(message: S) -> Self {
        Error::Model(message.into())
    }

    pub(crate) fn invalid<S: Into<String>>(message: S) -> Self {
        Error::InvalidInput(message.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Replace a non-finite log-probability with [`LOG_ZERO`].
#[inline]
pub fn clamp_log(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        LOG_ZERO
    }
}
