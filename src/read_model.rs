//! SQLite read model: current documents, their full version history, and
//! the projection consumer that keeps both in sync with the event log.
//!
//! Each event is applied inside one transaction that also advances the
//! stored offset, so a crash can never leave a half-applied event or an
//! offset pointing past unapplied work. Redelivered events are detected
//! by comparing sequences against the stored offset and skipped.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::watch;

use crate::correlation::{CorrelationBridge, FeedEvent};
use crate::error::ProjectionError;
use crate::log::{EventLog, Recorded};

/// Offset row name for the document projection.
const OFFSET_NAME: &str = "documents";

/// A row of the `Documents` table: the latest state of one document.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentRow {
    #[sqlx(rename = "Id")]
    pub id: String,
    #[sqlx(rename = "Title")]
    pub title: String,
    #[sqlx(rename = "Body")]
    pub body: String,
    #[sqlx(rename = "Version")]
    pub version: i64,
    #[sqlx(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
    #[sqlx(rename = "UpdatedAt")]
    pub updated_at: DateTime<Utc>,
    #[sqlx(rename = "ApprovalStatus")]
    pub approval_status: String,
}

/// A row of the `DocumentVersions` table: one immutable snapshot.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VersionRow {
    #[sqlx(rename = "Id")]
    pub id: String,
    #[sqlx(rename = "Version")]
    pub version: i64,
    #[sqlx(rename = "Title")]
    pub title: String,
    #[sqlx(rename = "Body")]
    pub body: String,
    #[sqlx(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
}

/// Shape of the `CreatedOrUpdated` payload as stored in the log.
#[derive(Debug, Deserialize)]
struct CreatedPayload {
    document: DocumentBody,
}

#[derive(Debug, Deserialize)]
struct DocumentBody {
    id: String,
    title: String,
    content: String,
}

/// Handle to the SQLite read model. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ReadModel {
    pool: SqlitePool,
}

impl ReadModel {
    /// Open (creating if missing) the database at `url` and ensure the
    /// schema exists.
    pub async fn connect(url: &str) -> Result<Self, ProjectionError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let model = Self { pool };
        model.migrate().await?;
        Ok(model)
    }

    async fn migrate(&self) -> Result<(), ProjectionError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS Documents (
                Id TEXT PRIMARY KEY,
                Title TEXT NOT NULL,
                Body TEXT NOT NULL,
                Version INTEGER NOT NULL,
                CreatedAt TEXT NOT NULL,
                UpdatedAt TEXT NOT NULL,
                ApprovalStatus TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS DocumentVersions (
                Id TEXT NOT NULL,
                Version INTEGER NOT NULL,
                Title TEXT NOT NULL,
                Body TEXT NOT NULL,
                CreatedAt TEXT NOT NULL,
                PRIMARY KEY (Id, Version)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS Offsets (
                OffsetName TEXT PRIMARY KEY,
                OffsetCount INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO Offsets (OffsetName, OffsetCount) VALUES (?, 0)")
            .bind(OFFSET_NAME)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Sequence of the last event applied to this read model.
    pub async fn offset(&self) -> Result<u64, ProjectionError> {
        let offset: i64 =
            sqlx::query_scalar("SELECT OffsetCount FROM Offsets WHERE OffsetName = ?")
                .bind(OFFSET_NAME)
                .fetch_one(&self.pool)
                .await?;
        Ok(offset as u64)
    }

    /// Apply one event, advancing the offset in the same transaction.
    ///
    /// Returns `Ok(false)` if the event was already applied (redelivery),
    /// `Ok(true)` otherwise. On error nothing is committed and the offset
    /// does not move.
    pub async fn apply(&self, event: &Recorded) -> Result<bool, ProjectionError> {
        let mut tx = self.pool.begin().await?;

        let stored: i64 = sqlx::query_scalar("SELECT OffsetCount FROM Offsets WHERE OffsetName = ?")
            .bind(OFFSET_NAME)
            .fetch_one(&mut *tx)
            .await?;
        if event.sequence <= stored as u64 {
            tx.rollback().await?;
            tracing::debug!(sequence = event.sequence, stored, "skipping redelivered event");
            return Ok(false);
        }

        let now = event.recorded_at;
        match event.event_type.as_str() {
            "CreatedOrUpdated" => {
                let payload: CreatedPayload = serde_json::from_value(event.payload.clone())
                    .map_err(|e| ProjectionError::BadPayload {
                        sequence: event.sequence,
                        event_type: event.event_type.clone(),
                        detail: e.to_string(),
                    })?;
                let doc = payload.document;

                let next_version: i64 = sqlx::query_scalar(
                    "SELECT COALESCE(MAX(Version), 0) + 1 FROM DocumentVersions WHERE Id = ?",
                )
                .bind(&doc.id)
                .fetch_one(&mut *tx)
                .await?;

                // Every new content revision re-enters review.
                sqlx::query(
                    "INSERT INTO Documents (Id, Title, Body, Version, CreatedAt, UpdatedAt, ApprovalStatus)
                     VALUES (?, ?, ?, ?, ?, ?, 'Pending')
                     ON CONFLICT(Id) DO UPDATE SET
                        Title = excluded.Title,
                        Body = excluded.Body,
                        Version = excluded.Version,
                        UpdatedAt = excluded.UpdatedAt,
                        ApprovalStatus = 'Pending'",
                )
                .bind(&doc.id)
                .bind(&doc.title)
                .bind(&doc.content)
                .bind(next_version)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "INSERT OR IGNORE INTO DocumentVersions (Id, Version, Title, Body, CreatedAt)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&doc.id)
                .bind(next_version)
                .bind(&doc.title)
                .bind(&doc.content)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            "Approved" | "Rejected" => {
                let status = if event.event_type == "Approved" { "Approved" } else { "Rejected" };
                sqlx::query("UPDATE Documents SET ApprovalStatus = ?, UpdatedAt = ? WHERE Id = ?")
                    .bind(status)
                    .bind(now)
                    .bind(&event.instance_id)
                    .execute(&mut *tx)
                    .await?;
            }
            // ApprovalCodeSet and anything unrecognized only move the offset.
            _ => {}
        }

        sqlx::query("UPDATE Offsets SET OffsetCount = ? WHERE OffsetName = ?")
            .bind(event.sequence as i64)
            .bind(OFFSET_NAME)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// All documents, most recently updated first.
    pub async fn list_documents(&self) -> Result<Vec<DocumentRow>, ProjectionError> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            "SELECT Id, Title, Body, Version, CreatedAt, UpdatedAt, ApprovalStatus
             FROM Documents ORDER BY UpdatedAt DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// The latest state of one document, if it exists.
    pub async fn document(&self, id: &str) -> Result<Option<DocumentRow>, ProjectionError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT Id, Title, Body, Version, CreatedAt, UpdatedAt, ApprovalStatus
             FROM Documents WHERE Id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Full version history of one document, newest first.
    pub async fn history(&self, id: &str) -> Result<Vec<VersionRow>, ProjectionError> {
        let rows = sqlx::query_as::<_, VersionRow>(
            "SELECT Id, Version, Title, Body, CreatedAt
             FROM DocumentVersions WHERE Id = ? ORDER BY Version DESC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// One specific version snapshot.
    pub async fn version(&self, id: &str, version: i64) -> Result<Option<VersionRow>, ProjectionError> {
        let row = sqlx::query_as::<_, VersionRow>(
            "SELECT Id, Version, Title, Body, CreatedAt
             FROM DocumentVersions WHERE Id = ? AND Version = ?",
        )
        .bind(id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

/// Apply every event past the stored offset once. Returns how many
/// events were newly applied.
///
/// On the first failure the pass stops without advancing, so an event is
/// never skipped over. Waiters registered for a committed event's
/// correlation ID are resolved after its transaction commits.
pub(crate) async fn project_pass(
    log: &EventLog,
    model: &ReadModel,
    bridge: &CorrelationBridge,
) -> Result<usize, ProjectionError> {
    let offset = model.offset().await?;
    let events = log.read_from(offset).map_err(sqlx::Error::Io)?;

    let mut applied = 0;
    for event in events {
        match model.apply(&event).await {
            Ok(true) => applied += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::error!(
                    sequence = event.sequence,
                    event_type = %event.event_type,
                    error = %e,
                    "projection apply failed, halting at this offset"
                );
                return Err(e);
            }
        }
        if let Some(correlation_id) = &event.correlation_id {
            bridge.resolve(correlation_id, FeedEvent::Committed(event.clone()));
        }
    }
    Ok(applied)
}

/// Background projection consumer: wakes on new log heads, applies
/// events until `shutdown` flips. A failing event halts progress and is
/// retried on the next wake-up; the offset never moves past it.
pub(crate) async fn run_projection_loop(
    log: EventLog,
    model: ReadModel,
    bridge: CorrelationBridge,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut head = log.subscribe();
    loop {
        if let Err(e) = project_pass(&log, &model, &bridge).await {
            tracing::error!(error = %e, "projection pass failed, will retry");
        }

        tokio::select! {
            changed = head.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::log::Pending;

    async fn model(tmp: &TempDir) -> ReadModel {
        let url = format!("sqlite:{}/read_model.db", tmp.path().display());
        ReadModel::connect(&url).await.expect("connect should succeed")
    }

    fn recorded(sequence: u64, instance_id: &str, event_type: &str, payload: serde_json::Value) -> Recorded {
        Recorded {
            sequence,
            aggregate_type: "document".to_string(),
            instance_id: instance_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            correlation_id: None,
            actor: None,
            recorded_at: Utc::now(),
        }
    }

    fn created(sequence: u64, id: &str, title: &str, content: &str) -> Recorded {
        recorded(
            sequence,
            id,
            "CreatedOrUpdated",
            serde_json::json!({"document": {"id": id, "title": title, "content": content}}),
        )
    }

    const DOC: &str = "0b7bb86e-9c13-4e5f-b1c8-2f6a9d3e4c55";

    #[tokio::test]
    async fn first_event_creates_version_one_pending() {
        let tmp = TempDir::new().expect("temp dir");
        let model = model(&tmp).await;

        let applied = model
            .apply(&created(1, DOC, "Notes", "first draft"))
            .await
            .expect("apply should succeed");
        assert!(applied);

        let doc = model.document(DOC).await.expect("query").expect("document should exist");
        assert_eq!(doc.version, 1);
        assert_eq!(doc.title, "Notes");
        assert_eq!(doc.approval_status, "Pending");

        let history = model.history(DOC).await.expect("history query");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, 1);
    }

    #[tokio::test]
    async fn versions_grow_monotonically_and_snapshots_are_kept() {
        let tmp = TempDir::new().expect("temp dir");
        let model = model(&tmp).await;

        model.apply(&created(1, DOC, "Notes", "v1")).await.expect("apply");
        model.apply(&created(2, DOC, "Notes", "v2")).await.expect("apply");
        model.apply(&created(3, DOC, "Notes", "v3")).await.expect("apply");

        let doc = model.document(DOC).await.expect("query").expect("exists");
        assert_eq!(doc.version, 3);
        assert_eq!(doc.body, "v3");

        let history = model.history(DOC).await.expect("history");
        let versions: Vec<i64> = history.iter().map(|v| v.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
        assert_eq!(history[2].body, "v1");
    }

    #[tokio::test]
    async fn redelivered_event_is_skipped() {
        let tmp = TempDir::new().expect("temp dir");
        let model = model(&tmp).await;

        let event = created(1, DOC, "Notes", "v1");
        assert!(model.apply(&event).await.expect("first apply"));
        assert!(!model.apply(&event).await.expect("second apply"));

        let history = model.history(DOC).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(model.offset().await.expect("offset"), 1);
    }

    #[tokio::test]
    async fn approved_updates_status_without_touching_version() {
        let tmp = TempDir::new().expect("temp dir");
        let model = model(&tmp).await;

        model.apply(&created(1, DOC, "Notes", "v1")).await.expect("apply");
        model
            .apply(&recorded(2, DOC, "Approved", serde_json::Value::Null))
            .await
            .expect("apply");

        let doc = model.document(DOC).await.expect("query").expect("exists");
        assert_eq!(doc.approval_status, "Approved");
        assert_eq!(doc.version, 1);
        assert_eq!(model.history(DOC).await.expect("history").len(), 1);
    }

    #[tokio::test]
    async fn rejected_updates_status_only() {
        let tmp = TempDir::new().expect("temp dir");
        let model = model(&tmp).await;

        model.apply(&created(1, DOC, "Notes", "v1")).await.expect("apply");
        model
            .apply(&recorded(2, DOC, "Rejected", serde_json::Value::Null))
            .await
            .expect("apply");

        let doc = model.document(DOC).await.expect("query").expect("exists");
        assert_eq!(doc.approval_status, "Rejected");
        assert_eq!(doc.version, 1);
    }

    #[tokio::test]
    async fn update_resets_status_to_pending() {
        let tmp = TempDir::new().expect("temp dir");
        let model = model(&tmp).await;

        model.apply(&created(1, DOC, "Notes", "v1")).await.expect("apply");
        model
            .apply(&recorded(2, DOC, "Approved", serde_json::Value::Null))
            .await
            .expect("apply");
        model.apply(&created(3, DOC, "Notes", "v2")).await.expect("apply");

        let doc = model.document(DOC).await.expect("query").expect("exists");
        assert_eq!(doc.approval_status, "Pending");
        assert_eq!(doc.version, 2);
    }

    #[tokio::test]
    async fn approval_code_set_advances_offset_only() {
        let tmp = TempDir::new().expect("temp dir");
        let model = model(&tmp).await;

        model.apply(&created(1, DOC, "Notes", "v1")).await.expect("apply");
        model
            .apply(&recorded(2, DOC, "ApprovalCodeSet", serde_json::json!({"code": "123456"})))
            .await
            .expect("apply");

        assert_eq!(model.offset().await.expect("offset"), 2);
        let doc = model.document(DOC).await.expect("query").expect("exists");
        assert_eq!(doc.approval_status, "Pending");
    }

    #[tokio::test]
    async fn malformed_payload_fails_without_advancing_offset() {
        let tmp = TempDir::new().expect("temp dir");
        let model = model(&tmp).await;

        let bad = recorded(1, DOC, "CreatedOrUpdated", serde_json::json!({"nope": true}));
        let err = model.apply(&bad).await.expect_err("apply should fail");
        assert!(matches!(err, ProjectionError::BadPayload { sequence: 1, .. }));
        assert_eq!(model.offset().await.expect("offset"), 0);
    }

    #[tokio::test]
    async fn project_pass_halts_at_a_failing_event_without_skipping() {
        let tmp = TempDir::new().expect("temp dir");
        let model = model(&tmp).await;
        let log = EventLog::open(tmp.path()).expect("open log");
        let bridge = CorrelationBridge::new();

        log.append(vec![
            Pending {
                aggregate_type: "document".to_string(),
                instance_id: DOC.to_string(),
                event_type: "CreatedOrUpdated".to_string(),
                payload: serde_json::json!({"nope": true}),
                correlation_id: None,
                actor: None,
            },
            Pending {
                aggregate_type: "document".to_string(),
                instance_id: DOC.to_string(),
                event_type: "Approved".to_string(),
                payload: serde_json::Value::Null,
                correlation_id: None,
                actor: None,
            },
        ])
        .expect("append");

        let err = project_pass(&log, &model, &bridge)
            .await
            .expect_err("pass should halt at the malformed event");
        assert!(matches!(err, ProjectionError::BadPayload { sequence: 1, .. }));

        // The event after the failure was not applied either; the pass
        // stops dead rather than skipping ahead.
        assert_eq!(model.offset().await.expect("offset"), 0);

        // Retrying reproduces the same failure at the same offset.
        let err = project_pass(&log, &model, &bridge)
            .await
            .expect_err("retry should halt again");
        assert!(matches!(err, ProjectionError::BadPayload { sequence: 1, .. }));
    }

    #[tokio::test]
    async fn project_pass_applies_log_and_resolves_waiters() {
        let tmp = TempDir::new().expect("temp dir");
        let model = model(&tmp).await;
        let log = EventLog::open(tmp.path()).expect("open log");
        let bridge = CorrelationBridge::new();

        let ticket = bridge.register("req-1");
        log.append(vec![Pending {
            aggregate_type: "document".to_string(),
            instance_id: DOC.to_string(),
            event_type: "CreatedOrUpdated".to_string(),
            payload: serde_json::json!({"document": {"id": DOC, "title": "Notes", "content": "v1"}}),
            correlation_id: Some("req-1".to_string()),
            actor: None,
        }])
        .expect("append");

        let applied = project_pass(&log, &model, &bridge).await.expect("pass");
        assert_eq!(applied, 1);

        let event = ticket
            .wait(std::time::Duration::from_secs(1))
            .await
            .expect("waiter should resolve after commit");
        assert!(event.is_committed());
        assert!(model.document(DOC).await.expect("query").is_some());
    }
}
