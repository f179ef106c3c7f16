use std::path::PathBuf;

use thiserror::Error;
use tilt_lua::LuaCallError;

/// Errors surfaced by the template environment.
#[derive(Debug, Error)]
pub enum TiltError {
    #[error("script error: {0}")]
    Script(#[from] LuaCallError),

    #[error("cannot read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    ConfigFormat(#[from] serde_json::Error),

    #[error("script root {0} is not a directory")]
    MissingScriptRoot(PathBuf),

    #[error("{function}() returned {found} where {expected} was expected")]
    UnexpectedResult {
        function: &'static str,
        expected: &'static str,
        found: String,
    },
}

impl TiltError {
    /// The script's own message, when the failure came from script code.
    pub fn script_message(&self) -> Option<&str> {
        match self {
            TiltError::Script(err) => Some(err.message()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TiltError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_errors_keep_their_message() {
        let err = TiltError::from(LuaCallError::new("template.tilt:3: bad"));
        assert_eq!(err.script_message(), Some("template.tilt:3: bad"));
        assert_eq!(err.to_string(), "script error: template.tilt:3: bad");
    }
}
