use thiserror::Error;

/// A failure raised while running VM code under a protected call.
///
/// This is the only raised error kind of the bridge. Script errors, compile
/// errors and failures of host functions called back from the VM all arrive
/// here as a formatted message. When the call was made with a traceback,
/// the trace is already part of the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct LuaCallError {
    message: String,
}

impl LuaCallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn into_message(self) -> String {
        self.message
    }
}

impl From<String> for LuaCallError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for LuaCallError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_message_verbatim() {
        let err = LuaCallError::new("Deliberate error");
        assert_eq!(err.to_string(), "Deliberate error");
        assert_eq!(err.message(), "Deliberate error");
    }
}
