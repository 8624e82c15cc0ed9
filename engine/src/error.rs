//! Engine error taxonomy.
//!
//! Only `Persistence` failures while touching the foundational in-memory
//! structures are allowed to escape a turn; every other variant is absorbed
//! by the stage that produced it and recorded as a fault code.

use std::time::Duration;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum EngineError {
    /// Another turn holds the session lock.
    #[error("session {session_id} is busy (waited {waited:?})")]
    LockTimeout {
        session_id: String,
        waited: Duration,
    },
    #[error("{collaborator} timed out after {after:?}")]
    CollaboratorTimeout {
        collaborator: &'static str,
        after: Duration,
    },
    #[error("{collaborator} failed: {message}")]
    CollaboratorError {
        collaborator: &'static str,
        message: String,
    },
    /// Durable record could not be read or decoded.
    #[error("corrupt persisted state for {key}: {message}")]
    CorruptPersistedState { key: String, message: String },
    /// A collaborator answered, but not in the agreed shape.
    #[error("{collaborator} returned malformed output: {message}")]
    SchemaViolation {
        collaborator: &'static str,
        message: String,
    },
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("solver failed: {0}")]
    Solver(String),
}

impl EngineError {
    /// Stable identifier recorded in decision faults.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::LockTimeout { .. } => "lock_timeout",
            EngineError::CollaboratorTimeout { .. } => "collaborator_timeout",
            EngineError::CollaboratorError { .. } => "collaborator_error",
            EngineError::CorruptPersistedState { .. } => "corrupt_persisted_state",
            EngineError::SchemaViolation { .. } => "schema_violation",
            EngineError::Persistence(_) => "persistence",
            EngineError::Solver(_) => "solver",
        }
    }

    /// `code:collaborator` style tag for the decision record.
    pub fn fault_tag(&self) -> String {
        match self {
            EngineError::CollaboratorTimeout { collaborator, .. }
            | EngineError::CollaboratorError { collaborator, .. }
            | EngineError::SchemaViolation { collaborator, .. } => {
                format!("{}:{}", self.code(), collaborator)
            }
            _ => self.code().to_string(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

/// Run `fut` under `limit`, mapping elapsed time into a collaborator timeout.
pub async fn with_timeout<T, F>(
    collaborator: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, EngineError>
where
    F: std::future::Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::CollaboratorTimeout {
            collaborator,
            after: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_tags() {
        let err = EngineError::CollaboratorTimeout {
            collaborator: "extractor",
            after: Duration::from_millis(5),
        };
        assert_eq!(err.code(), "collaborator_timeout");
        assert_eq!(err.fault_tag(), "collaborator_timeout:extractor");
        assert_eq!(
            EngineError::Solver("no pivot".into()).fault_tag(),
            "solver"
        );
    }

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed() {
        let result: Result<(), EngineError> =
            with_timeout("generator", Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(EngineError::CollaboratorTimeout {
                collaborator: "generator",
                ..
            })
        ));
    }
}
