use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoraForgeError {
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<usize>, actual: Vec<usize> },

    #[error("Index out of bounds: index {index} is out of bounds for dim {dim} with size {size}")]
    IndexOutOfBounds { index: usize, dim: usize, size: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Sequence length exceeded: max {max}, actual {actual}")]
    SequenceLengthExceeded { max: usize, actual: usize },

    #[error("Unsupported DType conversion")]
    DTypeMismatch,

    #[error("Operation not implemented: {0}")]
    NotImplemented(String),

    #[error("Tokenizer error: {0}")]
    TokenizerError(String),

    #[error("Missing weight: {0}")]
    MissingWeight(String),

    #[error("Adapter incompatible with base model: {0}")]
    AdapterMismatch(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Hub error: {0}")]
    Hub(String),
}

impl LoraForgeError {
    /// Wrap a parse failure (JSON, safetensors header) as invalid-data I/O.
    pub(crate) fn invalid_data<E>(e: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        LoraForgeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

pub type Result<T> = std::result::Result<T, LoraForgeError>;
