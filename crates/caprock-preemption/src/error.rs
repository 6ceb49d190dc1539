//! Error types for the preemption engine.

use thiserror::Error;

/// Result type for preemption operations.
pub type Result<T> = std::result::Result<T, PreemptionError>;

/// Errors that can occur in the preemption engine.
///
/// Engine operations themselves are total: unknown ids and missing measures
/// are resolved by no-ops or skips, never by errors. Errors arise only at
/// construction boundaries when inputs fail validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreemptionError {
    /// Invalid engine configuration.
    #[error("invalid preemption config: {reason}")]
    InvalidConfig {
        /// Description of why the configuration is invalid.
        reason: String,
    },

    /// Invalid resource name.
    #[error("invalid resource name: {reason}")]
    InvalidResourceName {
        /// Description of why the resource name is invalid.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_config() {
        let err = PreemptionError::InvalidConfig {
            reason: "grace period must be non-zero".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid preemption config: grace period must be non-zero"
        );
    }

    #[test]
    fn error_display_invalid_resource_name() {
        let err = PreemptionError::InvalidResourceName {
            reason: "label is empty".into(),
        };
        assert_eq!(err.to_string(), "invalid resource name: label is empty");
    }

    #[test]
    fn error_clone_and_eq() {
        let err1 = PreemptionError::InvalidConfig {
            reason: "bad".into(),
        };
        let err2 = err1.clone();
        assert_eq!(err1, err2);
    }

    #[test]
    fn error_debug_format() {
        let err = PreemptionError::InvalidResourceName {
            reason: "wildcard".into(),
        };
        let debug = format!("{err:?}");
        assert!(debug.contains("InvalidResourceName"));
        assert!(debug.contains("wildcard"));
    }
}
