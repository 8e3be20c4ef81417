//! Error types for template subscriptions

use thiserror::Error;

/// Backend error code the render service uses for templates it cannot parse.
pub const TEMPLATE_ERROR_CODE: &str = "template_error";

/// Failures that can reach a subscriber.
///
/// Errors are `Clone + Eq` because they travel inside
/// [`TemplateValue::Failed`](crate::TemplateValue::Failed) and are fanned out
/// to every consumer of an entry, exactly like a rendered value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Connection unavailable: {reason}")]
    ConnectionUnavailable { reason: String },

    #[error("Template rejected by backend: {message}")]
    MalformedTemplate { message: String },

    #[error("Backend error {code}: {message}")]
    Backend { code: String, message: String },
}

impl CacheError {
    pub fn connection_unavailable(reason: impl Into<String>) -> Self {
        Self::ConnectionUnavailable {
            reason: reason.into(),
        }
    }

    pub fn malformed_template(message: impl Into<String>) -> Self {
        Self::MalformedTemplate {
            message: message.into(),
        }
    }

    /// Map a backend `{code, message}` error body onto the taxonomy.
    pub fn from_backend(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        if code == TEMPLATE_ERROR_CODE {
            Self::MalformedTemplate {
                message: message.into(),
            }
        } else {
            Self::Backend {
                code,
                message: message.into(),
            }
        }
    }

    /// True when the failure came from the transport rather than the template.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::ConnectionUnavailable { .. })
    }
}

/// Result type alias for backend operations.
pub type CacheResult<T> = Result<T, CacheError>;
