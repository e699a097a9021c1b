// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for kestrel-core.
//!
//! Every store, engine and service operation returns [`CoreError`]. Each variant
//! carries the keys involved so callers can log and alert without extra context.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the execution plane.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    /// No execution exists for the key.
    ExecutionNotFound {
        /// The execution key (`namespace/workflow/run`).
        execution: String,
    },

    /// An execution with this key was already started.
    ExecutionAlreadyExists {
        /// The execution key (`namespace/workflow/run`).
        execution: String,
    },

    /// The execution is in a state that does not allow the operation.
    InvalidExecutionState {
        /// The execution key (`namespace/workflow/run`).
        execution: String,
        /// What the operation required.
        expected: String,
        /// What was found.
        actual: String,
    },

    /// No timer exists for the key.
    TimerNotFound {
        /// The owning execution (`namespace/workflow/run`).
        execution: String,
        /// The timer ID.
        timer_id: String,
    },

    /// A timer with the same key already exists.
    TimerAlreadyExists {
        /// The owning execution (`namespace/workflow/run`).
        execution: String,
        /// The timer ID.
        timer_id: String,
    },

    /// A task with the same ID is already queued.
    TaskExists {
        /// The duplicate task ID.
        task_id: String,
    },

    /// A versioned write lost a race against another writer.
    OptimisticLockConflict {
        /// What was being written (execution key, timer key, ...).
        entity: String,
        /// The version the writer read.
        expected: i64,
        /// The version found at write time.
        actual: i64,
    },

    /// The service was stopped or never started.
    ServiceNotRunning {
        /// The service name.
        service: String,
    },

    /// Persisted event data could not be encoded or decoded.
    SerializationError {
        /// What went wrong.
        reason: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Backing store operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ExecutionNotFound { .. } => "EXECUTION_NOT_FOUND",
            Self::ExecutionAlreadyExists { .. } => "EXECUTION_ALREADY_EXISTS",
            Self::InvalidExecutionState { .. } => "INVALID_EXECUTION_STATE",
            Self::TimerNotFound { .. } => "TIMER_NOT_FOUND",
            Self::TimerAlreadyExists { .. } => "TIMER_ALREADY_EXISTS",
            Self::TaskExists { .. } => "TASK_EXISTS",
            Self::OptimisticLockConflict { .. } => "OPTIMISTIC_LOCK_CONFLICT",
            Self::ServiceNotRunning { .. } => "SERVICE_NOT_RUNNING",
            Self::SerializationError { .. } => "SERIALIZATION_ERROR",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether re-reading and re-attempting the operation can succeed.
    ///
    /// Only version races and backing store failures qualify. Not-found,
    /// duplicate and serialization errors are structural and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OptimisticLockConflict { .. } | Self::DatabaseError { .. }
        )
    }

    /// Shorthand for a serialization failure.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::SerializationError {
            reason: reason.into(),
        }
    }

    /// Shorthand for a version conflict.
    pub fn conflict(entity: impl Into<String>, expected: i64, actual: i64) -> Self {
        Self::OptimisticLockConflict {
            entity: entity.into(),
            expected,
            actual,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecutionNotFound { execution } => {
                write!(f, "Execution '{}' not found", execution)
            }
            Self::ExecutionAlreadyExists { execution } => {
                write!(f, "Execution '{}' already exists", execution)
            }
            Self::InvalidExecutionState {
                execution,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Execution '{}' is in invalid state: expected '{}', got '{}'",
                    execution, expected, actual
                )
            }
            Self::TimerNotFound {
                execution,
                timer_id,
            } => {
                write!(
                    f,
                    "Timer '{}' not found for execution '{}'",
                    timer_id, execution
                )
            }
            Self::TimerAlreadyExists {
                execution,
                timer_id,
            } => {
                write!(
                    f,
                    "Timer '{}' already exists for execution '{}'",
                    timer_id, execution
                )
            }
            Self::TaskExists { task_id } => {
                write!(f, "Task '{}' already exists", task_id)
            }
            Self::OptimisticLockConflict {
                entity,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Optimistic lock conflict on '{}': expected version {}, found {}",
                    entity, expected, actual
                )
            }
            Self::ServiceNotRunning { service } => {
                write!(f, "Service '{}' is not running", service)
            }
            Self::SerializationError { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::serialization(format!("json: {}", err))
    }
}

impl From<prost::DecodeError> for CoreError {
    fn from(err: prost::DecodeError) -> Self {
        CoreError::serialization(format!("protobuf: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                CoreError::ExecutionNotFound {
                    execution: "ns/wf/run".to_string(),
                },
                "EXECUTION_NOT_FOUND",
            ),
            (
                CoreError::TimerAlreadyExists {
                    execution: "ns/wf/run".to_string(),
                    timer_id: "t-1".to_string(),
                },
                "TIMER_ALREADY_EXISTS",
            ),
            (
                CoreError::TaskExists {
                    task_id: "task-1".to_string(),
                },
                "TASK_EXISTS",
            ),
            (CoreError::conflict("ns/wf/run", 3, 4), "OPTIMISTIC_LOCK_CONFLICT"),
            (
                CoreError::ServiceNotRunning {
                    service: "timer".to_string(),
                },
                "SERVICE_NOT_RUNNING",
            ),
            (
                CoreError::serialization("bad bytes"),
                "SERIALIZATION_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CoreError::conflict("x", 1, 2).is_retryable());
        assert!(
            CoreError::DatabaseError {
                operation: "insert".to_string(),
                details: "locked".to_string(),
            }
            .is_retryable()
        );
        assert!(
            !CoreError::ExecutionNotFound {
                execution: "x".to_string()
            }
            .is_retryable()
        );
        assert!(!CoreError::serialization("truncated").is_retryable());
    }

    #[test]
    fn test_display() {
        let err = CoreError::conflict("acme/wf-1/r-1", 2, 3);
        assert_eq!(
            err.to_string(),
            "Optimistic lock conflict on 'acme/wf-1/r-1': expected version 2, found 3"
        );

        let err = CoreError::TimerNotFound {
            execution: "acme/wf-1/r-1".to_string(),
            timer_id: "t-1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Timer 't-1' not found for execution 'acme/wf-1/r-1'"
        );

        let err = CoreError::InvalidExecutionState {
            execution: "acme/wf-1/r-1".to_string(),
            expected: "running".to_string(),
            actual: "completed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Execution 'acme/wf-1/r-1' is in invalid state: expected 'running', got 'completed'"
        );
    }
}
