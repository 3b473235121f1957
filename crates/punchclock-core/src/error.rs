//! Error taxonomy for the daily flow.

use thiserror::Error;

/// Every failure the flow, the stores and the operator surface can report.
#[derive(Debug, Error)]
pub enum PunchError {
    /// The first window already closed (or the day is blocked). Permanent for the day.
    #[error("Planning error: {0}")]
    Planning(String),

    /// The automation driver failed an action. Recoverable via retry.
    #[error("Action error: {0}")]
    Action(String),

    /// Retry requested without a failure, or timestamps unrecoverable from the log.
    #[error("Recovery error: {0}")]
    Recovery(String),

    /// A run is already active.
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Webhook delivery failed. Callers log it and continue.
    #[error("Notification error: {0}")]
    Notification(String),

    /// Operator asked for something the current phase does not allow.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Config error: {0}")]
    Config(String),

    /// The shutdown signal fired while waiting.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PunchError {
    /// Short machine-readable kind, used in event metadata and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            PunchError::Planning(_) => "planning",
            PunchError::Action(_) => "action",
            PunchError::Recovery(_) => "recovery",
            PunchError::Concurrency(_) => "concurrency",
            PunchError::Notification(_) => "notification",
            PunchError::InvalidState(_) => "invalid_state",
            PunchError::Settings(_) => "settings",
            PunchError::Config(_) => "config",
            PunchError::Cancelled(_) => "cancelled",
            PunchError::Io(_) => "io",
            PunchError::Serialization(_) => "serialization",
        }
    }

    /// Whether retrying later (same day) can succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, PunchError::Planning(_))
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, PunchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_permanence() {
        let err = PunchError::Planning("window closed".into());
        assert_eq!(err.kind(), "planning");
        assert!(err.is_permanent());
        assert!(err.to_string().contains("window closed"));

        let err = PunchError::Action("click failed".into());
        assert_eq!(err.kind(), "action");
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PunchError = io.into();
        assert_eq!(err.kind(), "io");
    }
}
