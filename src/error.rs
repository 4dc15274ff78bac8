//! Crate-level error types, grouped by the pipeline stage they surface from.

use std::io;

use crate::document::{DocumentError, DocumentId};

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate validation before any event was
    /// produced. Wraps the domain error, forwarding its `Display` impl.
    #[error(transparent)]
    Domain(E),

    /// Disk I/O failure while appending to the event log.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The actor task that owns this aggregate has shut down, so no
    /// further commands can be processed through this handle.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

/// Error returned when reading the current state of an aggregate fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The actor task that owns this aggregate has shut down.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

/// Error returned when waiting on the correlation bridge fails.
///
/// These are liveness failures, distinct from a business rejection: the
/// underlying write may still have succeeded.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The timeout elapsed before a matching event arrived.
    #[error("timed out waiting for the correlated event; the write may still have succeeded")]
    Timeout,

    /// The waiter was removed without being resolved (bridge dropped or
    /// the registration was replaced).
    #[error("correlation waiter dropped before resolution")]
    Dropped,
}

/// Error returned when routing a saga-issued command envelope fails.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The envelope names an aggregate type with no registered dispatcher.
    #[error("no dispatch target registered for aggregate type '{0}'")]
    UnknownAggregate(String),

    /// The JSON command payload does not deserialize into the target
    /// aggregate's command type.
    #[error("command deserialization failed: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The target aggregate rejected or failed to execute the command.
    #[error("command execution failed: {0}")]
    Execution(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Actor spawn or log I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Error raised by the read model and projection consumer.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Database failure; the surrounding transaction has been rolled back.
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    /// An event payload did not have the shape its event type promises.
    #[error("malformed '{event_type}' payload at sequence {sequence}: {detail}")]
    BadPayload {
        sequence: u64,
        event_type: String,
        detail: String,
    },
}

/// Error returned by [`Store::submit`](crate::Store::submit): either the
/// command itself failed, or the wait for its downstream event did.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError<E: std::error::Error + Send + Sync + 'static> {
    #[error(transparent)]
    Execute(#[from] ExecuteError<E>),

    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Error returned by [`Store::restore_version`](crate::Store::restore_version).
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    /// The requested (document, version) pair is not in the history table.
    #[error("version {version} of document {id} does not exist")]
    VersionNotFound { id: DocumentId, version: i64 },

    /// The stored version no longer passes document validation.
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// Reading the history table failed.
    #[error(transparent)]
    Query(#[from] ProjectionError),

    /// Re-submitting the historical content failed.
    #[error(transparent)]
    Submit(#[from] SubmitError<DocumentError>),
}

/// Error returned when opening a [`Store`](crate::Store) fails.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Event log or saga checkpoint I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Read model connection or migration failure.
    #[error(transparent)]
    Projection(#[from] ProjectionError),
}
