/// Result alias that carries the custom [`ArStageError`] type.
pub type Result<T> = std::result::Result<T, ArStageError>;

/// Common error type for the core crate.
///
/// Every variant is recoverable. Gesture and recording operations report them
/// synchronously; outcomes that resolve later (permission prompts, container
/// finalization) are also mirrored on the recorder's event channel.
#[derive(Debug, thiserror::Error)]
pub enum ArStageError {
    /// A gesture was applied while no object is selected.
    #[error("no object is selected")]
    NoSelection,
    /// A recording start was requested while one is active or pending.
    #[error("a recording is already in progress")]
    AlreadyRecording,
    /// Microphone authorization was refused.
    #[error("microphone permission denied")]
    PermissionDenied,
    /// The output container or a capture resource could not be created,
    /// written or finalized.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    /// A caller supplied a value outside the accepted domain.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Free-form failure for context that has no dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration or script files that fail to parse.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl ArStageError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Shorthand for [`ArStageError::InvalidInput`].
    pub fn invalid<T: Into<String>>(msg: T) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Shorthand for [`ArStageError::ResourceUnavailable`].
    pub fn unavailable<T: Into<String>>(msg: T) -> Self {
        Self::ResourceUnavailable(msg.into())
    }
}

impl From<&str> for ArStageError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for ArStageError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_resource_errors_with_reason() {
        let err = ArStageError::unavailable("cannot create /nope/out.avi");
        assert_eq!(
            err.to_string(),
            "resource unavailable: cannot create /nope/out.avi"
        );
    }

    #[test]
    fn converts_plain_strings() {
        let err: ArStageError = "boom".into();
        assert!(matches!(err, ArStageError::Message(ref m) if m == "boom"));
    }
}
