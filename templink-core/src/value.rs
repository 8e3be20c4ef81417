//! Values delivered to template subscribers

use std::fmt;

use crate::error::CacheError;

/// What a subscriber callback receives.
///
/// Every entry starts at [`TemplateValue::Pending`] and is replaced
/// (last-write-wins) by each push or failure for that entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TemplateValue {
    /// No result has arrived yet.
    #[default]
    Pending,
    /// Latest rendered result.
    Rendered(String),
    /// The subscription failed; the consumer decides on a fallback display.
    Failed(CacheError),
}

impl TemplateValue {
    pub fn rendered(text: impl Into<String>) -> Self {
        Self::Rendered(text.into())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// The rendered text, if any.
    pub fn as_rendered(&self) -> Option<&str> {
        match self {
            Self::Rendered(text) => Some(text),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&CacheError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Pending renders as the empty string, the way an unrendered row reads.
impl fmt::Display for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => Ok(()),
            Self::Rendered(text) => f.write_str(text),
            Self::Failed(err) => write!(f, "{}", err),
        }
    }
}
