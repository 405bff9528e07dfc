use std::error::Error as StdError;

/// Common error type for `sheetsight_core`.
///
/// Concrete backend implementations (Redis, the sheets REST client, etc.)
/// should preserve the underlying error chain via [`Error::backend`].
/// Validation failures carry a stable machine-readable code alongside the
/// human message so API layers and agent tools can surface both.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation error [{code}]: {message}")]
    Validation { code: &'static str, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

pub mod codes {
    pub const BAD_RANGE: &str = "BAD_RANGE";
    pub const FEATURE_UNSUPPORTED: &str = "FEATURE_UNSUPPORTED";
    pub const FIELD_UNSUPPORTED: &str = "FIELD_UNSUPPORTED";
    pub const BAD_LIMIT: &str = "BAD_LIMIT";
    pub const BAD_OPERATION: &str = "BAD_OPERATION";
    pub const MISSING_REQUIRED_COLUMN: &str = "MISSING_REQUIRED_COLUMN";
    pub const DUPLICATE_HEADER: &str = "DUPLICATE_HEADER";
    pub const FORBIDDEN_STAGE: &str = "FORBIDDEN_STAGE";
    pub const UNSUPPORTED_STAGE: &str = "UNSUPPORTED_STAGE";
    pub const FORBIDDEN_LOOKUP: &str = "FORBIDDEN_LOOKUP";
    pub const BAD_PIPELINE: &str = "BAD_PIPELINE";
}

impl Error {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn backend(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::BackendMessage(message.into())
    }

    /// The validation code, if this is a validation error.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Validation { code, .. } => Some(code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
