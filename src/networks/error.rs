//! Error type for adapter network operations

/// Error type for adapter network operations
#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    Shape {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Numerical failure in block {block}: {reason}")]
    Numerical { block: usize, reason: String },
    #[error("Invalid adapter configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl NetworkError {
    pub(crate) fn shape(what: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        NetworkError::Shape {
            what: what.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;
