//! Aggregate trait, the persist/defer decision type, and the event codec.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

/// The outcome of handling a command: each produced event is either
/// committed to the durable log or published transiently and discarded.
///
/// Deferred events are visible to a caller waiting on the correlation
/// bridge (business rejections travel this way) but never enter durable
/// history, so replays and projections never see them. The distinction is
/// carried explicitly here rather than inferred from the event's shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision<E> {
    /// Append the event to the log and fold it into aggregate state.
    Persist(E),
    /// Publish the event to correlation waiters only; state is untouched.
    Defer(E),
}

impl<E> Decision<E> {
    /// The wrapped event, regardless of decision kind.
    pub fn event(&self) -> &E {
        match self {
            Decision::Persist(e) | Decision::Defer(e) => e,
        }
    }

    /// Whether this decision commits the event to the log.
    pub fn is_persist(&self) -> bool {
        matches!(self, Decision::Persist(_))
    }
}

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state. State is
/// built by folding domain events through [`apply`](Aggregate::apply).
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no
///   I/O, no side effects. It validates a command against the current
///   state and returns zero or more [`Decision`]s.
/// - [`apply`](Aggregate::apply) must be a pure, total function. It takes
///   ownership of the current state and a reference to a domain event,
///   returning the next state. Only persisted events are ever applied.
pub trait Aggregate: Default + Clone + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. `"document"`). Used as the
    /// stream discriminator in the log and as the dispatch key.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and decide which
    /// events it produces. `instance_id` is the identity of the stream
    /// this state was folded from, letting handlers reject commands whose
    /// payload names a different entity.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    fn handle(
        &self,
        instance_id: &str,
        cmd: Self::Command,
    ) -> Result<Vec<Decision<Self::DomainEvent>>, Self::Error>;

    /// Apply a single persisted event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}

/// Split an adjacently tagged domain event into its `(event_type, payload)`
/// halves for storage.
///
/// The `DomainEvent` must use `#[serde(tag = "type", content = "data")]`.
/// The `"type"` field becomes the log's `event_type` and the `"data"`
/// field (absent for fieldless variants) becomes the payload.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized.
pub fn encode_event<E: Serialize>(event: &E) -> serde_json::Result<(String, Value)> {
    let value = serde_json::to_value(event)?;
    let obj = value
        .as_object()
        .expect("adjacently tagged enum must serialize to a JSON object");
    let event_type = obj["type"]
        .as_str()
        .expect("adjacently tagged enum must have a string 'type' field")
        .to_owned();
    let payload = obj.get("data").cloned().unwrap_or(Value::Null);
    Ok((event_type, payload))
}

/// Reassemble a domain event from its stored `(event_type, payload)` halves.
///
/// Returns `None` for unknown or malformed events so that folds skip them,
/// keeping old state readable after the event set grows.
pub fn decode_event<E: DeserializeOwned>(event_type: &str, payload: &Value) -> Option<E> {
    let tagged = if payload.is_null() {
        serde_json::json!({ "type": event_type })
    } else {
        serde_json::json!({ "type": event_type, "data": payload })
    };
    serde_json::from_value(tagged).ok()
}

/// Fold a slice of stored records into fresh aggregate state.
///
/// Records whose event type the aggregate does not recognize are skipped.
pub fn fold<A: Aggregate>(records: &[crate::log::Recorded]) -> A {
    records.iter().fold(A::default(), |state, record| {
        match decode_event::<A::DomainEvent>(&record.event_type, &record.payload) {
            Some(event) => state.apply(&event),
            None => state,
        }
    })
}
