//! Event-sourced document versioning with an approval workflow.
//!
//! Documents are plain event-sourced aggregates: every create or update
//! is appended to a durable JSONL log, and state is a fold over that
//! history. Three pieces sit around the log:
//!
//! * **Aggregate actors** ([`AggregateHandle`]) process commands for one
//!   instance sequentially, making version counters race-free.
//! * **Sagas** ([`Saga`]) react to committed events with new commands;
//!   the built-in [`ApprovalSaga`] routes every revision through code
//!   generation, reviewer notification, and an approval decision.
//! * **A SQLite read model** ([`ReadModel`]) keeps the latest documents
//!   and their full version history, applied transactionally per event.
//!
//! The [`Store`] ties these together, and its correlation bridge gives
//! callers read-after-write semantics: [`Store::submit`] returns only
//! once the resulting event is visible in the read model (or was
//! rejected outright).
//!
//! ```no_run
//! use std::time::Duration;
//! use papertrail::{ApprovalDeps, ApprovalSaga, Document, DocumentCommand, DocumentId,
//!     DocumentState, Store};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::builder("./data")
//!     .aggregate_type::<DocumentState>()
//!     .saga::<ApprovalSaga>(ApprovalDeps::default())
//!     .open()
//!     .await?;
//! let pipeline = store.start_pipeline()?;
//!
//! let id = DocumentId::new();
//! let document = Document::new(id, "Launch plan", "First draft.")?;
//! store
//!     .submit::<DocumentState>(
//!         &id.to_string(),
//!         DocumentCommand::CreateOrUpdate { document },
//!         Duration::from_secs(5),
//!     )
//!     .await?;
//!
//! pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod actor;
mod aggregate;
mod approval;
mod command;
mod correlation;
mod document;
mod error;
mod log;
mod read_model;
mod saga;
mod store;

pub use actor::AggregateHandle;
pub use aggregate::{Aggregate, Decision, decode_event, encode_event, fold};
pub use approval::{
    ApprovalDeps, ApprovalSaga, ApprovalStage, CodeGenerator, LogNotifier, Notifier,
    RandomCodeGenerator,
};
pub use command::{CommandContext, CommandEnvelope};
pub use correlation::{CorrelationBridge, FeedEvent, TransientEvent, WaitTicket};
pub use document::{
    Document, DocumentCommand, DocumentError, DocumentEvent, DocumentId, DocumentState,
    MAX_CONTENT_CHARS, MAX_TITLE_CHARS, RejectReason,
};
pub use error::{
    DispatchError, ExecuteError, ProjectionError, RestoreError, StateError, StoreError,
    SubmitError, WaitError,
};
pub use log::{EventLog, Pending, Recorded};
pub use read_model::{DocumentRow, ReadModel, VersionRow};
pub use saga::{Saga, SagaReport, Transition};
pub use store::{PipelineHandle, Store, StoreBuilder};
