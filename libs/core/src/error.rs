use std::time::Duration;

/// Error taxonomy shared by every relay crate.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} {id} does not belong to the caller")]
    Forbidden { kind: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("group {0} is synced from the provider; members can only change through sync")]
    ReadOnlyGroup(String),
    #[error("adapter not implemented for channel `{0}`")]
    AdapterNotImplemented(String),
    #[error("unknown action type `{0}`")]
    UnknownActionType(String),
    #[error("provider error on {channel}: {message}")]
    Provider { channel: String, message: String },
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("queue error: {0}")]
    Queue(#[source] anyhow::Error),
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    pub fn validation(message: impl Into<String>) -> Self {
        RelayError::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        RelayError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn forbidden(kind: &'static str, id: impl Into<String>) -> Self {
        RelayError::Forbidden {
            kind,
            id: id.into(),
        }
    }

    pub fn provider(channel: impl Into<String>, message: impl Into<String>) -> Self {
        RelayError::Provider {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn storage<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        RelayError::Storage(err.into())
    }

    pub fn queue<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        RelayError::Queue(err.into())
    }

    /// True for failures caused by the outside world rather than the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Provider { .. }
                | RelayError::Timeout { .. }
                | RelayError::Queue(_)
                | RelayError::Storage(_)
        )
    }

    /// Short machine-readable code used in logs, metrics and dead letters.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "E_VALIDATION",
            RelayError::NotFound { .. } => "E_NOT_FOUND",
            RelayError::Forbidden { .. } => "E_FORBIDDEN",
            RelayError::Conflict(_) => "E_CONFLICT",
            RelayError::ReadOnlyGroup(_) => "E_READ_ONLY_GROUP",
            RelayError::AdapterNotImplemented(_) => "E_ADAPTER_MISSING",
            RelayError::UnknownActionType(_) => "E_UNKNOWN_ACTION",
            RelayError::Provider { .. } => "E_PROVIDER",
            RelayError::Timeout { .. } => "E_TIMEOUT",
            RelayError::Queue(_) => "E_QUEUE",
            RelayError::Storage(_) => "E_STORAGE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_and_timeout_errors_are_retryable() {
        assert!(RelayError::provider("whatsapp", "503").is_retryable());
        assert!(
            RelayError::Timeout {
                operation: "send_message",
                after: Duration::from_secs(30),
            }
            .is_retryable()
        );
        assert!(!RelayError::validation("missing body").is_retryable());
        assert!(!RelayError::AdapterNotImplemented("sms".into()).is_retryable());
    }

    #[test]
    fn messages_keep_context() {
        let err = RelayError::not_found("instance", "store-1");
        assert_eq!(err.to_string(), "instance not found: store-1");
        assert_eq!(err.code(), "E_NOT_FOUND");
        let err = RelayError::AdapterNotImplemented("sms".into());
        assert_eq!(err.to_string(), "adapter not implemented for channel `sms`");
    }
}
