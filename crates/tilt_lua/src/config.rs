//! Runtime configuration

use serde::{Deserialize, Serialize};

use crate::encoding::StringEncoding;
use crate::loader::RequireRoot;
use crate::runtime::{Libraries, LuaRuntime};

/// Everything needed to build a [`LuaRuntime`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub libraries: Libraries,
    pub string_encoding: StringEncoding,
    pub require_root: Option<RequireRoot>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            libraries: Libraries::ALL,
            string_encoding: StringEncoding::Utf8,
            require_root: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl LuaRuntime {
    /// Build a VM from `config`. A require root needs the package library
    /// in `config.libraries`.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let runtime = LuaRuntime::new(config.libraries);
        runtime.set_default_string_encoding(config.string_encoding);
        if let Some(root) = &config.require_root {
            runtime.set_require_root(root);
        }
        runtime
    }
}
