//! Error types for the refinement core

use thiserror::Error;

/// Result type alias for the refinement core
pub type Result<T> = std::result::Result<T, LlmError>;

/// Main error type for the refinement core
#[derive(Debug, Error)]
pub enum LlmError {
    /// Missing credential or unknown model identifier. Raised at client
    /// creation time and never retried.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Error surfaced by the model provider
    #[error("provider error: {0}")]
    Provider(#[from] async_openai::error::OpenAIError),

    /// A forced function call replied through the wrong function
    #[error("function name mismatch: expected `{expected}`, got `{actual}`")]
    SchemaMismatch { expected: String, actual: String },

    /// Reply content could not be parsed per the request contract
    #[error("response parse error: {message}")]
    ResponseParse { message: String },

    /// A generation reply contained no artifact
    #[error("no artifact in generation reply: {message}")]
    ArtifactExtraction { message: String },

    /// External validator process failure
    #[error("external tool error: {message}")]
    ExternalTool { message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LlmError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::ResponseParse {
            message: message.into(),
        }
    }
}
