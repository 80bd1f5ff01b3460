use thiserror::Error;

/// errors raised by the reconstruction and bundle registration routines
#[derive(Debug, Error)]
pub enum ReconError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("index {index} is out of range for a basis of {size} coefficients")]
    OutOfRange { index: usize, size: usize },

    #[error("invalid basis index (n={n}, l={l}, m={m}): l must be even with 0 <= l <= n and |m| <= l")]
    InvalidIndex { n: i64, l: i64, m: i64 },

    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse parameter file: {0}")]
    ParseParams(#[from] toml::de::Error),

    #[error("failed to serialize parameters: {0}")]
    SerializeParams(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, ReconError>;

impl ReconError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub(crate) fn degenerate(msg: impl Into<String>) -> Self {
        Self::DegenerateGeometry(msg.into())
    }
}
