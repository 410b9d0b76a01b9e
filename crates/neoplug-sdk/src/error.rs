//! Error types for the plugin SDK.
//!
//! A single error enum covers the caller-visible failure kinds; phases that
//! run many independent items (setup actions, config loading) collect their
//! failures into a [`MultiError`] and decide at the end of the phase.

use thiserror::Error;

/// Result type for SDK operations.
pub type SdkResult<T> = Result<T, SdkError>;

/// Error type for SDK operations.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Invalid or incomplete configuration. Recoverable only by fixing the
    /// input; aborts startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A referenced entity (device, handler, transaction) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate id, alias, or handler name.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation invoked against a device whose handler does not implement it.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Handler-level failure for a single operation. Never aborts the plugin.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Write admission refused within the admission deadline.
    #[error("write queue is full")]
    QueueFull,

    /// Malformed selector, tag, or missing required field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unrecoverable internal error.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl SdkError {
    /// Whether this error should terminate plugin startup regardless of policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Accumulates per-item failures from a phase that must not short-circuit.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<SdkError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure.
    pub fn push(&mut self, err: SdkError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[SdkError] {
        &self.errors
    }

    /// `Ok(())` when nothing was recorded, otherwise the aggregate error.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error(s): ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

impl From<MultiError> for SdkError {
    fn from(err: MultiError) -> Self {
        SdkError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_error_empty() {
        let collected = MultiError::new();
        assert!(collected.is_empty());
        assert!(collected.into_result().is_ok());
    }

    #[test]
    fn test_multi_error_display() {
        let mut collected = MultiError::new();
        collected.push(SdkError::NotFound("handler foo".into()));
        collected.push(SdkError::Conflict("alias bar".into()));

        let err = collected.into_result().unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("2 error(s)"));
        assert!(msg.contains("handler foo"));
        assert!(msg.contains("alias bar"));
    }
}
