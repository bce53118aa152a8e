use thiserror::Error;

/// Result alias used by every engine primitive and port.
pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("durable store error: {0}")]
    Store(String),

    #[error("dispatch index error: {0}")]
    Index(String),

    #[error("worker registry error: {0}")]
    Registry(String),

    #[error("could not acquire lock on {resource} after {attempts} attempts")]
    LockTimeout { resource: String, attempts: u32 },

    #[error("payload for '{name}' failed validation: {}", .errors.join("; "))]
    Validation { name: String, errors: Vec<String> },

    #[error("runner '{name}' depends on '{dependency}', which is not defined")]
    MissingDependency { name: String, dependency: String },

    #[error("dependency cycle between runners: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("dependency '{0}' still has eligible jobs")]
    DependencyPending(String),

    #[error("runner '{0}' is already defined")]
    DuplicateRunner(String),

    #[error("no job {id} in queue '{name}'")]
    NotFound { name: String, id: String },

    #[error("invalid collection name '{0}'")]
    InvalidCollection(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Infrastructure failures that a caller may retry as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::Store(_)
                | QueueError::Index(_)
                | QueueError::Registry(_)
                | QueueError::LockTimeout { .. }
        )
    }
}

impl From<config::ConfigError> for QueueError {
    fn from(err: config::ConfigError) -> Self {
        QueueError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(QueueError::Store("down".into()).is_transient());
        assert!(
            QueueError::LockTimeout {
                resource: "locks:queue:email".into(),
                attempts: 3
            }
            .is_transient()
        );
        assert!(!QueueError::DuplicateRunner("email".into()).is_transient());
    }

    #[test]
    fn validation_message_joins_errors() {
        let err = QueueError::Validation {
            name: "email".into(),
            errors: vec!["missing field 'to'".into(), "'subject' must be a string".into()],
        };
        assert_eq!(
            err.to_string(),
            "payload for 'email' failed validation: missing field 'to'; 'subject' must be a string"
        );
    }
}
