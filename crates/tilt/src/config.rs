//! Environment configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tilt_lua::{Libraries, RequireRoot, RuntimeConfig, StringEncoding};

use crate::error::{Result, TiltError};

/// How a [`TiltEnvironment`](crate::TiltEnvironment) finds and starts the
/// templating scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Directory holding the templating scripts.
    pub script_root: PathBuf,
    /// Prefix for script chunk names in errors and tracebacks.
    pub display_prefix: String,
    pub module_extension: String,
    /// Module required at startup; it defines `render` and `parse`.
    pub entry_module: String,
    pub libraries: Libraries,
    pub string_encoding: StringEncoding,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            script_root: PathBuf::from("src"),
            display_prefix: "Tilt/".to_string(),
            module_extension: "lua".to_string(),
            entry_module: "templater".to_string(),
            libraries: Libraries::ALL,
            string_encoding: StringEncoding::Utf8,
        }
    }
}

impl EnvironmentConfig {
    /// Defaults, with scripts loaded from `script_root`.
    pub fn with_script_root(script_root: impl Into<PathBuf>) -> Self {
        Self {
            script_root: script_root.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| TiltError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The VM-level part of this configuration.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            // the loader always needs the package library
            libraries: self.libraries | Libraries::PACKAGE,
            string_encoding: self.string_encoding,
            require_root: Some(
                RequireRoot::new(&self.script_root)
                    .with_display_prefix(&self.display_prefix)
                    .with_extension(&self.module_extension),
            ),
        }
    }
}
