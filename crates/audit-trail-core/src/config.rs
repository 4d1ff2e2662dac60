use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AuditError;

/// Where a new version's `parent_version_id` points after a rollover.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ParentLink {
    /// The version it replaces, giving a linked list from root to current.
    #[default]
    Predecessor,
    /// The chain root: every later version points at the first one.
    ///
    /// This is how the Go audit plugin links versions: its "Success on
    /// multiples parent ID" test keeps `audit_parent_id` on the root across
    /// repeated updates.
    Root,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub parent_link: ParentLink,
    /// Refuse to close or create versions without a `last_changed_user`.
    pub require_actor: bool,
    /// Prefix of the savepoints the engine opens around each write.
    pub savepoint_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parent_link: ParentLink::Predecessor,
            require_actor: true,
            savepoint_prefix: "audit_trail".to_string(),
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`AuditError::Validation`] when the savepoint prefix is not a plain identifier.
    pub fn validate(&self) -> Result<(), AuditError> {
        if !is_plain_identifier(&self.savepoint_prefix) {
            return Err(AuditError::Validation(format!(
                "savepoint_prefix MUST be a plain identifier, got {:?}",
                self.savepoint_prefix
            )));
        }
        Ok(())
    }

    /// Parse and validate a JSON config document. Missing keys take defaults.
    ///
    /// # Errors
    /// Returns [`AuditError::Validation`] on malformed JSON, unknown keys, or invalid values.
    pub fn from_json_str(raw: &str) -> Result<Self, AuditError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| AuditError::Validation(format!("invalid engine config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`AuditError::Validation`] when the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> Result<Self, AuditError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            AuditError::Validation(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, the only identifier shape hosts need to quote.
#[must_use]
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
