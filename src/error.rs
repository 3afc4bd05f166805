use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LmError>;

/// Errors surfaced by model construction, tokenization, and decoding.
///
/// Configuration and vocabulary problems are fatal and raised before any
/// computation starts. An out-of-vocabulary piece during splitting is not an
/// error; it falls back to the unknown piece.
#[derive(Debug, Error)]
pub enum LmError {
    /// Unsupported vendor model type, cache/model shape mismatch, or a
    /// vendor config that is missing or mistypes a required field.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A special piece required at construction time is absent from the
    /// vocabulary.
    #[error("vocabulary doesn't contain '{piece}' piece")]
    MissingPiece { piece: String },

    /// A piece id outside the vocabulary was passed to decoding.
    #[error("piece id {0} is out of vocabulary range")]
    UnknownPieceId(u32),

    /// A named parameter was absent or malformed in the checkpoint.
    #[error("weight loading failed for parameter '{name}': {reason}")]
    WeightLoading { name: String, reason: String },

    /// Malformed vocabulary, merge, or serialized tokenizer data.
    #[error("tokenizer data error: {0}")]
    TokenizerData(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] tch::TchError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

impl LmError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        LmError::Configuration(msg.into())
    }
}
