//! Ambient context and render requests.
//!
//! Every subscription is scoped to the caller: the ambient fields are merged
//! into the variables before the key is computed, so two users (or two
//! devices, or two views) rendering the same template get distinct entries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::key::CacheKey;

/// Key/value bag supplied alongside a template.
pub type Variables = Map<String, Value>;

/// Template variable holding the caller's user name.
pub const USER_VAR: &str = "user";
/// Template variable holding the per-install device id.
pub const DEVICE_VAR: &str = "browser";
/// Template variable holding the current view fingerprint.
pub const VIEW_VAR: &str = "hash";
/// Template variable holding the caller's locale.
pub const LOCALE_VAR: &str = "locale";

/// Identity, device and locale fields merged into every request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AmbientContext {
    /// Display name of the authenticated user.
    pub user: String,
    /// Stable per-install device identifier.
    pub device_id: String,
    /// Fingerprint of the view the consumer lives in (empty when none).
    pub view: String,
    /// Locale tag, e.g. `en-GB`.
    pub locale: String,
}

impl AmbientContext {
    pub fn new(user: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    pub fn with_view(mut self, view: impl Into<String>) -> Self {
        self.view = view.into();
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    /// The ambient fields as template variables.
    pub fn to_variables(&self) -> Variables {
        let mut vars = Variables::new();
        vars.insert(USER_VAR.to_string(), Value::String(self.user.clone()));
        vars.insert(DEVICE_VAR.to_string(), Value::String(self.device_id.clone()));
        vars.insert(VIEW_VAR.to_string(), Value::String(self.view.clone()));
        vars.insert(LOCALE_VAR.to_string(), Value::String(self.locale.clone()));
        vars
    }

    /// Merge caller variables over the ambient ones; the caller wins on
    /// name clashes.
    pub fn merge(&self, variables: Variables) -> Variables {
        let mut merged = self.to_variables();
        merged.extend(variables);
        merged
    }
}

/// A backend subscribe request: template plus fully merged variables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderRequest {
    pub template: String,
    pub variables: Variables,
}

impl RenderRequest {
    pub fn new(template: impl Into<String>, variables: Variables) -> Self {
        Self {
            template: template.into(),
            variables,
        }
    }

    /// The dedup key of this request.
    pub fn key(&self) -> CacheKey {
        CacheKey::build(&self.template, &self.variables)
    }
}
