//! Document domain: identity, validated value object, commands, events,
//! and the aggregate state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{Aggregate, Decision};

/// Maximum title length, in characters.
pub const MAX_TITLE_CHARS: usize = 200;
/// Maximum content length, in characters.
pub const MAX_CONTENT_CHARS: usize = 20_000;

// ---- Identity ----

/// Opaque document identifier, assigned at creation and immutable for the
/// aggregate's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---- Value object ----

/// Validation failures caught before any event is produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("title must be between 1 and {} characters", MAX_TITLE_CHARS)]
    TitleLength,

    #[error("content must be at most {} characters", MAX_CONTENT_CHARS)]
    ContentLength,
}

/// A validated document. An invalid `Document` cannot be constructed:
/// both [`Document::new`] and serde deserialization run the same length
/// checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDocument")]
pub struct Document {
    id: DocumentId,
    title: String,
    content: String,
}

/// Unvalidated wire shape; only exists as the serde entry point.
#[derive(Deserialize)]
struct RawDocument {
    id: DocumentId,
    title: String,
    content: String,
}

impl TryFrom<RawDocument> for Document {
    type Error = DocumentError;

    fn try_from(raw: RawDocument) -> Result<Self, Self::Error> {
        Document::new(raw.id, raw.title, raw.content)
    }
}

impl Document {
    /// Construct a document, enforcing the length bounds.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError`] if the title is empty or over
    /// [`MAX_TITLE_CHARS`], or the content is over [`MAX_CONTENT_CHARS`].
    pub fn new(
        id: DocumentId,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Self, DocumentError> {
        let title = title.into();
        let content = content.into();
        let title_chars = title.chars().count();
        if title_chars == 0 || title_chars > MAX_TITLE_CHARS {
            return Err(DocumentError::TitleLength);
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(DocumentError::ContentLength);
        }
        Ok(Self { id, title, content })
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

// ---- Commands and events ----

/// Commands accepted by the document aggregate.
///
/// `SetApprovalCode`, `Approve`, and `Reject` are issued by the approval
/// saga, not by end users.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DocumentCommand {
    CreateOrUpdate { document: Document },
    SetApprovalCode { code: String },
    Approve,
    Reject,
}

/// Reasons a command is rejected as a business rule, carried by the
/// deferred `Error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// A `CreateOrUpdate` named a different document than the one this
    /// aggregate instance already holds.
    DocumentNotFound,
}

/// Events produced by the document aggregate.
///
/// All variants except `Error` are persisted; `Error` only ever travels
/// as a deferred event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DocumentEvent {
    CreatedOrUpdated { document: Document },
    ApprovalCodeSet { code: String },
    Approved,
    Rejected,
    Error { reason: RejectReason },
}

// ---- State ----

/// Aggregate state: the latest document value plus the optimistic version
/// counter. Commands against one instance are strictly serialized, so
/// `version` is a race-free linear counter safe to expose externally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentState {
    current: Option<Document>,
    version: u64,
}

impl DocumentState {
    /// The latest document value, if any event has been applied yet.
    pub fn current(&self) -> Option<&Document> {
        self.current.as_ref()
    }

    /// Content version: increments exactly once per applied
    /// `CreatedOrUpdated`; approval events leave it unchanged.
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for DocumentState {
    const AGGREGATE_TYPE: &'static str = "document";

    type Command = DocumentCommand;
    type DomainEvent = DocumentEvent;
    type Error = DocumentError;

    fn handle(
        &self,
        instance_id: &str,
        cmd: Self::Command,
    ) -> Result<Vec<Decision<Self::DomainEvent>>, Self::Error> {
        match cmd {
            DocumentCommand::CreateOrUpdate { document } => {
                // The stream identity and the document identity must agree,
                // from the very first write onwards; the read model keys
                // status updates by the stream id. A mismatch is a business
                // rejection: visible to the caller, never part of durable
                // history.
                if document.id().to_string() != instance_id {
                    return Ok(vec![Decision::Defer(DocumentEvent::Error {
                        reason: RejectReason::DocumentNotFound,
                    })]);
                }
                // First write and every edit/restore look the same: one
                // more CreatedOrUpdated, one more version.
                Ok(vec![Decision::Persist(DocumentEvent::CreatedOrUpdated {
                    document,
                })])
            }
            // Saga-issued commands were validated upstream.
            DocumentCommand::SetApprovalCode { code } => {
                Ok(vec![Decision::Persist(DocumentEvent::ApprovalCodeSet { code })])
            }
            DocumentCommand::Approve => Ok(vec![Decision::Persist(DocumentEvent::Approved)]),
            DocumentCommand::Reject => Ok(vec![Decision::Persist(DocumentEvent::Rejected)]),
        }
    }

    fn apply(mut self, event: &Self::DomainEvent) -> Self {
        match event {
            DocumentEvent::CreatedOrUpdated { document } => {
                self.current = Some(document.clone());
                self.version += 1;
            }
            // Approval events change read-model-visible status but do not
            // produce a new content version.
            DocumentEvent::ApprovalCodeSet { .. }
            | DocumentEvent::Approved
            | DocumentEvent::Rejected => {}
            // Error events never mutate state (and are never persisted).
            DocumentEvent::Error { .. } => {}
        }
        self
    }
}
