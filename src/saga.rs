//! Sagas: long-running workflows that react to events with commands.
//!
//! A saga observes the global event stream and keeps one state-machine
//! instance per workflow id. Transitions are pure functions of incoming
//! events; effects (commands sent back to aggregates, notifications) are
//! computed separately after a transition is accepted, so replaying the
//! same events never re-issues the side effects of the original run.
//!
//! The runner checkpoints only the last fully dispatched global offset.
//! On startup it rebuilds every instance by replaying the stream up to
//! that offset with `recovering = true`, discarding the command envelopes
//! the replay produces -- they were dispatched before the checkpoint was
//! written.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::command::CommandEnvelope;
use crate::error::DispatchError;
use crate::log::{EventLog, Recorded};

/// Outcome of feeding one event to a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The event moved the state machine; effects will be evaluated.
    Accepted,
    /// The event is not relevant in the current state.
    Ignored,
}

/// A long-running workflow state machine.
///
/// # Contract
///
/// - [`transition`](Saga::transition) must be pure: no I/O, no side
///   effects, deterministic for a given event and state.
/// - [`effect`](Saga::effect) runs only after an accepted transition and
///   is re-invoked while it keeps changing the state, letting one event
///   drive a chain of internal stages. Effects other than the ones
///   explicitly gated by `recovering` must be harmless if they fire
///   twice; delivery is at-least-once.
pub trait Saga: Default + Clone + PartialEq + Send + Sync + 'static {
    /// Workflow name, used as a directory name under `sagas/`.
    const NAME: &'static str;

    /// Collaborators injected at startup (notifiers, generators). The
    /// runner passes them to every [`effect`](Saga::effect) call.
    type Deps: Send + Sync + 'static;

    /// Map an event to the workflow id it belongs to, or `None` if this
    /// saga does not care about the event at all.
    fn route(event: &Recorded) -> Option<String>;

    /// Whether this event may start a new workflow instance. Routed
    /// events for unknown workflows are dropped unless this returns true.
    fn activates(event: &Recorded) -> bool;

    /// Feed one event to the state machine.
    fn transition(&mut self, event: &Recorded) -> Transition;

    /// Compute the side effects of the current state, possibly advancing
    /// through internal stages. `recovering` is true while the runner is
    /// replaying already-dispatched history.
    fn effect(&mut self, deps: &Self::Deps, recovering: bool) -> Vec<CommandEnvelope>;

    /// Whether this instance has reached a terminal state and can be
    /// dropped by the runner.
    fn is_terminal(&self) -> bool;
}

// --- Checkpoint persistence ---

/// The last global offset whose envelopes were fully dispatched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SagaCheckpoint {
    offset: u64,
}

/// Save a saga checkpoint atomically (write to a temp file, then rename).
fn save_checkpoint(dir: &Path, checkpoint: &SagaCheckpoint) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("checkpoint.json");
    let tmp_path = dir.join("checkpoint.json.tmp");
    let json = serde_json::to_string_pretty(checkpoint).map_err(io::Error::other)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Load a saga checkpoint. Returns `Ok(None)` if the file does not exist
/// or is corrupt; a corrupt checkpoint just means a full replay.
fn load_checkpoint(dir: &Path) -> io::Result<Option<SagaCheckpoint>> {
    let path = dir.join("checkpoint.json");
    match std::fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt saga checkpoint, will replay from the start"
                );
                Ok(None)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

// --- Runner ---

/// Drives a saga over the global stream: routes events to instances,
/// collects command envelopes, tracks the dispatch offset.
///
/// `catch_up` does **not** persist the checkpoint; the caller must invoke
/// [`save`](SagaRunner::save) after all envelopes have been dispatched or
/// dead-lettered. A crash mid-dispatch therefore causes re-processing on
/// restart, never silent loss.
pub(crate) struct SagaRunner<S: Saga> {
    instances: HashMap<String, S>,
    offset: u64,
    checkpoint_dir: PathBuf,
    deps: S::Deps,
}

impl<S: Saga> SagaRunner<S> {
    /// Create a runner, loading the checkpoint and rebuilding instance
    /// state by replaying the log up to the checkpointed offset.
    pub(crate) fn new(base_dir: &Path, log: &EventLog, deps: S::Deps) -> io::Result<Self> {
        let checkpoint_dir = base_dir.join("sagas").join(S::NAME);
        let offset = load_checkpoint(&checkpoint_dir)?.map(|c| c.offset).unwrap_or(0);
        let mut runner = Self {
            instances: HashMap::new(),
            offset,
            checkpoint_dir,
            deps,
        };

        if offset > 0 {
            for event in log.read_from(0)? {
                if event.sequence > offset {
                    break;
                }
                runner.process_event(&event, true);
            }
            tracing::info!(
                saga = S::NAME,
                offset,
                instances = runner.instances.len(),
                "saga state rebuilt from replay"
            );
        }

        Ok(runner)
    }

    /// Process every event past the current offset, returning the command
    /// envelopes to dispatch. Advances the in-memory offset only.
    pub(crate) fn catch_up(&mut self, log: &EventLog) -> io::Result<Vec<CommandEnvelope>> {
        let _span = tracing::debug_span!("saga_catchup", saga = S::NAME).entered();

        let mut envelopes = Vec::new();
        for event in log.read_from(self.offset)? {
            envelopes.extend(self.process_event(&event, false));
            self.offset = event.sequence;
        }
        Ok(envelopes)
    }

    /// Route one event, run the transition, and on acceptance evaluate
    /// the effect chain until the state stops changing.
    fn process_event(&mut self, event: &Recorded, recovering: bool) -> Vec<CommandEnvelope> {
        let Some(workflow_id) = S::route(event) else {
            return Vec::new();
        };

        let instance = match self.instances.entry(workflow_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if !S::activates(event) {
                    return Vec::new();
                }
                tracing::debug!(saga = S::NAME, workflow_id = %workflow_id, "saga instance activated");
                entry.insert(S::default())
            }
        };

        let (envelopes, terminal) = match instance.transition(event) {
            Transition::Ignored => (Vec::new(), false),
            Transition::Accepted => {
                let mut envelopes = Vec::new();
                loop {
                    let before = instance.clone();
                    envelopes.extend(instance.effect(&self.deps, recovering));
                    if *instance == before {
                        break;
                    }
                }
                (envelopes, instance.is_terminal())
            }
        };

        if terminal {
            self.instances.remove(&workflow_id);
            tracing::info!(saga = S::NAME, workflow_id = %workflow_id, "saga instance completed");
        }

        // Replay rebuilds state only; the original run already dispatched
        // these envelopes before the checkpoint was written.
        if recovering { Vec::new() } else { envelopes }
    }

    /// Persist the current offset. Call after dispatch is complete.
    pub(crate) fn save(&self) -> io::Result<()> {
        save_checkpoint(&self.checkpoint_dir, &SagaCheckpoint { offset: self.offset })
    }

    /// Path of this saga's dead-letter log.
    pub(crate) fn dead_letter_path(&self) -> PathBuf {
        self.checkpoint_dir.join("dead_letters.jsonl")
    }

    #[cfg(test)]
    pub(crate) fn instance(&self, workflow_id: &str) -> Option<&S> {
        self.instances.get(workflow_id)
    }
}

// --- Type-erased trait for store integration ---

/// Trait object interface over heterogeneous saga runners.
pub(crate) trait SagaCatchUp: Send + Sync {
    /// Catch up on the global stream and return command envelopes.
    fn catch_up(&mut self, log: &EventLog) -> io::Result<Vec<CommandEnvelope>>;

    /// Persist the checkpoint.
    fn save(&self) -> io::Result<()>;

    /// Path of the dead-letter log.
    fn dead_letter_path(&self) -> PathBuf;

    /// Saga name, for log context.
    fn name(&self) -> &'static str;
}

impl<S: Saga> SagaCatchUp for SagaRunner<S> {
    fn catch_up(&mut self, log: &EventLog) -> io::Result<Vec<CommandEnvelope>> {
        self.catch_up(log)
    }

    fn save(&self) -> io::Result<()> {
        self.save()
    }

    fn dead_letter_path(&self) -> PathBuf {
        self.dead_letter_path()
    }

    fn name(&self) -> &'static str {
        S::NAME
    }
}

// --- Dispatch infrastructure ---

/// Type-erased dispatcher for a single aggregate type.
///
/// Each registered aggregate type gets a [`TypedDispatcher<A>`] that
/// deserializes the envelope's JSON command and routes it through the
/// store. The registry is built once at startup and handed to every
/// consumer; there is no lazily-populated global table.
pub(crate) trait AggregateDispatcher: Send + Sync {
    /// Dispatch a command envelope to the target aggregate.
    fn dispatch<'a>(
        &'a self,
        store: &'a crate::store::Store,
        envelope: CommandEnvelope,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;
}

/// Concrete dispatcher for aggregate type `A`.
pub(crate) struct TypedDispatcher<A> {
    _marker: std::marker::PhantomData<A>,
}

impl<A> TypedDispatcher<A> {
    pub(crate) fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<A> AggregateDispatcher for TypedDispatcher<A>
where
    A: Aggregate,
    A::Command: DeserializeOwned,
{
    fn dispatch<'a>(
        &'a self,
        store: &'a crate::store::Store,
        envelope: CommandEnvelope,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            let cmd: A::Command = serde_json::from_value(envelope.command)?;
            let handle = store.get::<A>(&envelope.instance_id).await?;
            handle
                .execute(cmd, envelope.context)
                .await
                .map_err(|e| DispatchError::Execution(Box::new(e)))?;
            Ok(())
        })
    }
}

// --- Dead-letter log ---

/// An entry in the dead-letter log, recording a failed dispatch attempt.
#[derive(Debug, Serialize, Deserialize)]
struct DeadLetter {
    envelope: CommandEnvelope,
    error: String,
    failed_at: DateTime<Utc>,
}

/// Append a single dead-letter entry to the JSONL log at `path`.
pub(crate) fn append_dead_letter(
    path: &Path,
    envelope: CommandEnvelope,
    error: &str,
) -> io::Result<()> {
    use std::io::Write;

    let entry = DeadLetter {
        envelope,
        error: error.to_string(),
        failed_at: Utc::now(),
    };
    let json = serde_json::to_string(&entry).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{json}")?;
    Ok(())
}

/// Summary of one saga dispatch pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SagaReport {
    /// Number of command envelopes successfully dispatched.
    pub dispatched: usize,
    /// Number of command envelopes written to dead-letter logs.
    pub dead_lettered: usize,
}

impl SagaReport {
    /// Whether this pass produced any work at all.
    pub fn is_idle(&self) -> bool {
        self.dispatched == 0 && self.dead_lettered == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::approval::{ApprovalDeps, ApprovalSaga, ApprovalStage, CodeGenerator, Notifier};
    use crate::command::CommandContext;
    use crate::log::Pending;

    struct FixedCodes(&'static str);

    impl CodeGenerator for FixedCodes {
        fn generate(&self) -> String {
            self.0.to_string()
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        sent: AtomicUsize,
    }

    impl Notifier for CountingNotifier {
        fn notify(&self, _document_id: &str, _code: &str) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn deps(notifier: Arc<CountingNotifier>) -> ApprovalDeps {
        ApprovalDeps {
            notifier,
            codes: Arc::new(FixedCodes("424242")),
        }
    }

    fn append(log: &EventLog, instance_id: &str, event_type: &str, payload: serde_json::Value) {
        log.append(vec![Pending {
            aggregate_type: "document".to_string(),
            instance_id: instance_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            correlation_id: None,
            actor: None,
        }])
        .expect("append should succeed");
    }

    fn created_payload(id: &str) -> serde_json::Value {
        serde_json::json!({"document": {"id": id, "title": "Hello", "content": "World"}})
    }

    const DOC_ID: &str = "7a4c8a52-21f3-4f4e-9a35-9e5b2a4f0d11";

    #[tokio::test]
    async fn catch_up_emits_set_approval_code_on_activation() {
        let tmp = TempDir::new().expect("temp dir");
        let log = EventLog::open(tmp.path()).expect("open should succeed");
        append(&log, DOC_ID, "CreatedOrUpdated", created_payload(DOC_ID));

        let notifier = Arc::new(CountingNotifier::default());
        let mut runner = SagaRunner::<ApprovalSaga>::new(tmp.path(), &log, deps(notifier))
            .expect("runner creation should succeed");

        let envelopes = runner.catch_up(&log).expect("catch_up should succeed");
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].aggregate_type, "document");
        assert_eq!(envelopes[0].instance_id, DOC_ID);
        assert_eq!(envelopes[0].command["type"], "SetApprovalCode");
        assert_eq!(envelopes[0].command["data"]["code"], "424242");

        let instance = runner.instance(DOC_ID).expect("instance should exist");
        assert_eq!(instance.stage(), Some(&ApprovalStage::GeneratingCode));
    }

    #[tokio::test]
    async fn offset_advances_no_re_emit() {
        let tmp = TempDir::new().expect("temp dir");
        let log = EventLog::open(tmp.path()).expect("open should succeed");
        append(&log, DOC_ID, "CreatedOrUpdated", created_payload(DOC_ID));

        let notifier = Arc::new(CountingNotifier::default());
        let mut runner = SagaRunner::<ApprovalSaga>::new(tmp.path(), &log, deps(notifier))
            .expect("runner creation should succeed");

        let first = runner.catch_up(&log).expect("first catch_up should succeed");
        assert_eq!(first.len(), 1);

        let second = runner.catch_up(&log).expect("second catch_up should succeed");
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn replay_rebuilds_state_without_renotifying_or_redispatching() {
        let tmp = TempDir::new().expect("temp dir");
        let log = EventLog::open(tmp.path()).expect("open should succeed");
        append(&log, DOC_ID, "CreatedOrUpdated", created_payload(DOC_ID));
        append(
            &log,
            DOC_ID,
            "ApprovalCodeSet",
            serde_json::json!({"code": "424242"}),
        );

        let notifier = Arc::new(CountingNotifier::default());
        {
            let mut runner =
                SagaRunner::<ApprovalSaga>::new(tmp.path(), &log, deps(notifier.clone()))
                    .expect("runner creation should succeed");
            let envelopes = runner.catch_up(&log).expect("catch_up should succeed");
            // SetApprovalCode from activation, Approve after the
            // notification stage advanced.
            assert_eq!(envelopes.len(), 2);
            assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
            runner.save().expect("save should succeed");
        }

        // Fresh runner replays the same two events with recovering=true:
        // same final state, no second notification, no envelopes.
        let runner = SagaRunner::<ApprovalSaga>::new(tmp.path(), &log, deps(notifier.clone()))
            .expect("runner reload should succeed");
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
        let instance = runner.instance(DOC_ID).expect("instance should survive replay");
        assert_eq!(
            instance.stage(),
            Some(&ApprovalStage::WaitingForApproval { code: "424242".to_string() })
        );
    }

    #[tokio::test]
    async fn terminal_event_drops_instance() {
        let tmp = TempDir::new().expect("temp dir");
        let log = EventLog::open(tmp.path()).expect("open should succeed");
        append(&log, DOC_ID, "CreatedOrUpdated", created_payload(DOC_ID));
        append(&log, DOC_ID, "Approved", serde_json::Value::Null);

        let notifier = Arc::new(CountingNotifier::default());
        let mut runner = SagaRunner::<ApprovalSaga>::new(tmp.path(), &log, deps(notifier))
            .expect("runner creation should succeed");
        runner.catch_up(&log).expect("catch_up should succeed");

        assert!(runner.instance(DOC_ID).is_none(), "terminal instance should be dropped");
    }

    #[test]
    fn dead_letter_append_creates_readable_jsonl() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("dead_letters.jsonl");

        let envelope = CommandEnvelope {
            aggregate_type: "document".to_string(),
            instance_id: "d-1".to_string(),
            command: serde_json::json!({"type": "Approve"}),
            context: CommandContext::default(),
        };

        append_dead_letter(&path, envelope, "actor gone").expect("append should succeed");

        let contents = std::fs::read_to_string(&path).expect("read should succeed");
        let entry: DeadLetter =
            serde_json::from_str(contents.trim()).expect("should be valid JSON");
        assert_eq!(entry.error, "actor gone");
        assert_eq!(entry.envelope.aggregate_type, "document");
    }

    #[test]
    fn corrupt_checkpoint_falls_back_to_full_replay() {
        let tmp = TempDir::new().expect("temp dir");
        let dir = tmp.path().join("sagas").join("document-approval");
        std::fs::create_dir_all(&dir).expect("mkdir should succeed");
        std::fs::write(dir.join("checkpoint.json"), "not json").expect("write should succeed");

        let loaded = load_checkpoint(&dir).expect("load should not error");
        assert!(loaded.is_none());
    }
}
