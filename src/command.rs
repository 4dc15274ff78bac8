//! Command envelope and dispatch types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cross-cutting metadata passed alongside a command.
///
/// Carries audit and correlation information without polluting the
/// `Command` or `DomainEvent` types. Both fields are stamped onto every
/// event the command persists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of whoever issued the command (a user ID, or a saga name
    /// for saga-issued commands).
    pub actor: Option<String>,
    /// Correlation ID for matching downstream events back to the request.
    pub correlation_id: Option<String>,
}

impl CommandContext {
    /// Set the actor identity.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// A type-erased command envelope for cross-aggregate dispatch.
///
/// Produced by sagas when reacting to events. The `command` field is a
/// `serde_json::Value` because the saga does not know the concrete command
/// type of the target aggregate at compile time; the dispatch layer
/// deserializes it into the right `A::Command` at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Target aggregate type name (must match `Aggregate::AGGREGATE_TYPE`).
    pub aggregate_type: String,
    /// Target aggregate instance identifier.
    pub instance_id: String,
    /// JSON-serialized command payload.
    pub command: Value,
    /// Cross-cutting metadata forwarded to the command handler.
    pub context: CommandContext,
}
