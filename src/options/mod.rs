//! Pipeline options with TOML file support.
//!
//! Sections use `#[serde(default)]`, so a file that only sets
//! `[post_processing] gamma = 1.8` is valid.

mod post_processing;

use std::path::Path;

pub use post_processing::{ExposureReadback, PostProcessingOptions};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::PostFxError;

/// Top-level options container.
#[derive(
    Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema,
)]
#[serde(default)]
pub struct Options {
    /// Post-processing chain parameters.
    pub post_processing: PostProcessingOptions,
}

impl Options {
    /// Generate JSON Schema describing the UI-exposed options.
    #[must_use]
    pub fn json_schema() -> schemars::Schema {
        schemars::schema_for!(Options)
    }

    /// Load options from a TOML file. Missing fields use defaults.
    ///
    /// # Errors
    ///
    /// [`PostFxError::Io`] if the file cannot be read,
    /// [`PostFxError::OptionsParse`] if it is not valid TOML for `Options`.
    pub fn load(path: &Path) -> Result<Self, PostFxError> {
        let content = std::fs::read_to_string(path).map_err(PostFxError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse options from a TOML string.
    ///
    /// # Errors
    ///
    /// [`PostFxError::OptionsParse`] on malformed input.
    pub fn from_toml(content: &str) -> Result<Self, PostFxError> {
        toml::from_str(content)
            .map_err(|e| PostFxError::OptionsParse(e.to_string()))
    }

    /// Save options to a TOML file (pretty-printed).
    ///
    /// # Errors
    ///
    /// [`PostFxError::OptionsParse`] if serialization fails,
    /// [`PostFxError::Io`] if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), PostFxError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PostFxError::OptionsParse(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(PostFxError::Io)?;
        }
        std::fs::write(path, content).map_err(PostFxError::Io)
    }
}
