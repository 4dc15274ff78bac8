//! Actor loop that owns one aggregate instance and processes its commands.
//!
//! Each live aggregate instance is a tokio task holding the folded state.
//! Commands arrive over an `mpsc` channel and are processed strictly
//! sequentially, which is what makes the version counter race-free
//! without locks. Persisted decisions are appended to the shared
//! [`EventLog`]; deferred decisions are published to the
//! [`CorrelationBridge`] and discarded.
//!
//! Public API: [`AggregateHandle`], a cloneable async handle. Spawning
//! goes through [`Store::get`](crate::Store::get), which folds the
//! instance's history before starting the loop.

use std::io;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::aggregate::{Aggregate, Decision, encode_event, fold};
use crate::command::CommandContext;
use crate::correlation::{CorrelationBridge, FeedEvent, TransientEvent};
use crate::error::{ExecuteError, StateError};
use crate::log::{EventLog, Pending};

/// Configuration for the actor loop.
pub(crate) struct ActorConfig {
    /// How long the actor waits for a message before shutting down. The
    /// next `get` on the store transparently re-spawns it from the log.
    pub idle_timeout: Duration,
}

/// Result type sent back through the `Execute` reply channel.
type ExecuteResult<A> =
    Result<Vec<Decision<<A as Aggregate>::DomainEvent>>, ExecuteError<<A as Aggregate>::Error>>;

/// Messages sent from `AggregateHandle` to the actor loop.
pub(crate) enum ActorMessage<A: Aggregate> {
    /// Execute a command against the aggregate.
    Execute {
        cmd: A::Command,
        ctx: CommandContext,
        reply: oneshot::Sender<ExecuteResult<A>>,
    },

    /// Retrieve a clone of the current aggregate state.
    GetState {
        reply: oneshot::Sender<Result<A, StateError>>,
    },

    /// Gracefully shut down the actor loop.
    #[allow(dead_code)] // Constructed only in tests.
    Shutdown,
}

/// Runs the aggregate actor loop.
///
/// The loop exits when the channel closes (all handles dropped), a
/// `Shutdown` message arrives, or the idle timeout elapses.
async fn run_actor<A: Aggregate>(
    mut state: A,
    instance_id: String,
    log: EventLog,
    bridge: CorrelationBridge,
    mut rx: mpsc::Receiver<ActorMessage<A>>,
    config: ActorConfig,
) {
    loop {
        match tokio::time::timeout(config.idle_timeout, rx.recv()).await {
            Ok(Some(msg)) => match msg {
                ActorMessage::Execute { cmd, ctx, reply } => {
                    let _span = tracing::info_span!(
                        "execute",
                        aggregate_type = A::AGGREGATE_TYPE,
                        instance_id = %instance_id,
                    )
                    .entered();
                    let result =
                        execute_command(&mut state, &instance_id, &log, &bridge, cmd, &ctx);
                    // If the receiver was dropped, the caller no longer
                    // cares about the result.
                    let _ = reply.send(result);
                }

                ActorMessage::GetState { reply } => {
                    let _ = reply.send(Ok(state.clone()));
                }

                ActorMessage::Shutdown => break,
            },
            // Channel closed: all senders dropped.
            Ok(None) => break,
            // Idle timeout elapsed with no messages.
            Err(_elapsed) => {
                tracing::debug!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    instance_id = %instance_id,
                    "actor idle, shutting down"
                );
                break;
            }
        }
    }
}

/// Execute a single command: decide, commit persisted events, publish
/// deferred ones, then fold the committed events into state.
fn execute_command<A: Aggregate>(
    state: &mut A,
    instance_id: &str,
    log: &EventLog,
    bridge: &CorrelationBridge,
    cmd: A::Command,
    ctx: &CommandContext,
) -> ExecuteResult<A> {
    // 1. Decide: run the pure command handler against current state.
    let decisions = state.handle(instance_id, cmd).map_err(ExecuteError::Domain)?;
    if decisions.is_empty() {
        return Ok(decisions);
    }

    // 2. Encode and route each decision.
    let mut batch = Vec::new();
    for decision in &decisions {
        let (event_type, payload) = encode_event(decision.event())
            .map_err(|e| ExecuteError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        match decision {
            Decision::Persist(_) => batch.push(Pending {
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                instance_id: instance_id.to_owned(),
                event_type,
                payload,
                correlation_id: ctx.correlation_id.clone(),
                actor: ctx.actor.clone(),
            }),
            Decision::Defer(_) => {
                // Deferred events only reach whoever is waiting on the
                // correlation; with no correlation there is no audience.
                if let Some(cid) = &ctx.correlation_id {
                    bridge.resolve(
                        cid,
                        FeedEvent::Transient(TransientEvent {
                            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                            instance_id: instance_id.to_owned(),
                            event_type,
                            payload,
                            correlation_id: cid.clone(),
                            occurred_at: chrono::Utc::now(),
                        }),
                    );
                }
            }
        }
    }

    // 3. Commit the persisted batch in one locked append.
    if !batch.is_empty() {
        let recorded = log.append(batch)?;
        tracing::info!(count = recorded.len(), "events appended");
    }

    // 4. Fold only the persisted events into state.
    for decision in &decisions {
        if let Decision::Persist(event) = decision {
            *state = std::mem::take(state).apply(event);
        }
    }

    Ok(decisions)
}

/// Async handle to a running aggregate actor.
///
/// Lightweight, cloneable, and `Send + Sync`.
#[derive(Debug)]
pub struct AggregateHandle<A: Aggregate> {
    sender: mpsc::Sender<ActorMessage<A>>,
}

// Manual `Clone` because `A` itself need not be `Clone` for the handle.
impl<A: Aggregate> Clone for AggregateHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<A: Aggregate> AggregateHandle<A> {
    /// Send a command to the aggregate and wait for the result.
    ///
    /// Returns the decisions produced by the command handler; the
    /// persisted ones have already been committed to the log when this
    /// returns.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] -- the aggregate rejected the command.
    /// * [`ExecuteError::Io`] -- appending to the log failed.
    /// * [`ExecuteError::ActorGone`] -- the actor task has exited.
    pub async fn execute(&self, cmd: A::Command, ctx: CommandContext) -> ExecuteResult<A> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Execute { cmd, ctx, reply: tx })
            .await
            .map_err(|_| ExecuteError::ActorGone)?;
        rx.await.map_err(|_| ExecuteError::ActorGone)?
    }

    /// Read a clone of the current aggregate state.
    ///
    /// # Errors
    ///
    /// * [`StateError::ActorGone`] -- the actor task has exited.
    pub async fn state(&self) -> Result<A, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::ActorGone)?;
        rx.await.map_err(|_| StateError::ActorGone)?
    }

    /// Check whether the actor backing this handle is still running.
    ///
    /// Returns `false` after idle eviction or shutdown; the store uses
    /// this to drop stale handles from its cache.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Spawn an actor for one aggregate instance.
///
/// Rebuilds state by folding the instance's stream from the log (a pure,
/// side-effect-free fold), then starts the loop as a tokio task.
///
/// # Errors
///
/// Returns `io::Error` if reading the stream fails.
pub(crate) fn spawn_actor<A: Aggregate>(
    instance_id: &str,
    log: EventLog,
    bridge: CorrelationBridge,
    config: ActorConfig,
) -> io::Result<AggregateHandle<A>> {
    let records = log.read_stream(A::AGGREGATE_TYPE, instance_id)?;
    let state = fold::<A>(&records);

    let (tx, rx) = mpsc::channel::<ActorMessage<A>>(32);
    tokio::spawn(run_actor::<A>(
        state,
        instance_id.to_owned(),
        log,
        bridge,
        rx,
        config,
    ));

    Ok(AggregateHandle { sender: tx })
}
