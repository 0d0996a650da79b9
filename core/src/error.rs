use serde::Serialize;
use thiserror::Error;

/// Failures reported by the core operations.
///
/// None of these abort the host process; each one carries a message meant
/// to be shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Descriptor is missing its script path or command text.
    #[error("invalid job configuration: {0}")]
    InvalidJobConfiguration(String),
    /// File script with an extension no interpreter is known for.
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),
    /// The OS refused to create the process.
    #[error("failed to start process: {0}")]
    SpawnFailure(String),
    /// Stop requested for a job with no live process.
    #[error("job {0} is not running")]
    NotRunning(String),
    /// A second run was requested while the job is still running.
    #[error("job {0} is already running")]
    AlreadyRunning(String),
    /// Cron expression could not be parsed.
    #[error("invalid schedule {expr:?}: {reason}")]
    InvalidSchedule {
        /// Expression as the user wrote it.
        expr: String,
        /// Parser message.
        reason: String,
    },
    /// No job with this id exists.
    #[error("job {0} not found")]
    NotFound(String),
    /// Reading or writing a record file failed.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

/// Convenience alias for core results.
pub type CoreResult<T> = Result<T, CoreError>;

/// Success/failure envelope handed to front ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    /// Whether the operation went through.
    pub success: bool,
    /// Informational message on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Human-readable failure on error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    /// Successful reply with an optional message.
    pub fn ok(message: Option<String>) -> Self {
        Self { success: true, message, error: None }
    }

    /// Failed reply carrying the error text.
    pub fn err(error: &CoreError) -> Self {
        Self { success: false, message: None, error: Some(error.to_string()) }
    }
}

impl<T> From<&CoreResult<T>> for Reply {
    fn from(res: &CoreResult<T>) -> Self {
        match res {
            Ok(_) => Reply::ok(None),
            Err(e) => Reply::err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_carries_message_text() {
        let res: CoreResult<()> = Err(CoreError::NotRunning("j1".into()));
        let reply = Reply::from(&res);
        assert!(!reply.success);
        assert_eq!(reply.error.as_deref(), Some("job j1 is not running"));

        let json = serde_json::to_value(Reply::ok(Some("stopping".to_string()))).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "message": "stopping"}));
    }
}
