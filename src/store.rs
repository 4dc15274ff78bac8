//! The store: entry point tying the event log, aggregate actors, sagas,
//! and the read model together.
//!
//! A [`Store`] owns one event log directory and one SQLite read model.
//! Aggregate actors are spawned on demand and cached; idle actors evict
//! themselves and are transparently re-spawned from the log on the next
//! access. Sagas and the projection consumer either run as background
//! tasks ([`Store::start_pipeline`]) or are driven manually
//! ([`Store::run_sagas`], [`Store::project`], [`Store::settle`]) for
//! deterministic tests.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::actor::{ActorConfig, AggregateHandle, spawn_actor};
use crate::aggregate::Aggregate;
use crate::command::CommandContext;
use crate::correlation::{CorrelationBridge, FeedEvent};
use crate::document::{Document, DocumentCommand, DocumentId, DocumentState};
use crate::error::{DispatchError, ProjectionError, RestoreError, StoreError, SubmitError};
use crate::log::EventLog;
use crate::read_model::{ReadModel, run_projection_loop};
use crate::saga::{
    AggregateDispatcher, Saga, SagaCatchUp, SagaReport, SagaRunner, TypedDispatcher,
    append_dead_letter,
};

type HandleCache = RwLock<HashMap<(TypeId, String), Box<dyn Any + Send + Sync>>>;

/// Event-sourced store with a saga pipeline and a SQLite read model.
///
/// Cheap to clone; all clones share the same log, cache, and pipeline.
#[derive(Clone)]
pub struct Store {
    log: EventLog,
    read_model: ReadModel,
    bridge: CorrelationBridge,
    cache: Arc<HandleCache>,
    sagas: Arc<Vec<Mutex<Box<dyn SagaCatchUp>>>>,
    dispatchers: Arc<HashMap<String, Box<dyn AggregateDispatcher>>>,
    idle_timeout: Duration,
    pipeline_started: Arc<AtomicBool>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("sagas", &self.sagas.len())
            .field("dispatchers", &self.dispatchers.len())
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Start building a store rooted at `base_dir`.
    pub fn builder(base_dir: impl Into<PathBuf>) -> StoreBuilder {
        StoreBuilder::new(base_dir)
    }

    /// The read model, for queries.
    pub fn read_model(&self) -> &ReadModel {
        &self.read_model
    }

    /// The shared event log.
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Get a handle to an aggregate instance, spawning its actor if it is
    /// not already live.
    pub async fn get<A: Aggregate>(&self, instance_id: &str) -> io::Result<AggregateHandle<A>> {
        let key = (TypeId::of::<A>(), instance_id.to_owned());

        // Fast path: a live handle is already cached.
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&key)
                && let Some(handle) = entry.downcast_ref::<AggregateHandle<A>>()
                && handle.is_alive()
            {
                return Ok(handle.clone());
            }
        }

        let mut cache = self.cache.write().await;
        // Re-check: another task may have spawned it while we waited.
        if let Some(entry) = cache.get(&key)
            && let Some(handle) = entry.downcast_ref::<AggregateHandle<A>>()
            && handle.is_alive()
        {
            return Ok(handle.clone());
        }

        let handle = spawn_actor::<A>(
            instance_id,
            self.log.clone(),
            self.bridge.clone(),
            ActorConfig {
                idle_timeout: self.idle_timeout,
            },
        )?;
        cache.insert(key, Box::new(handle.clone()));
        Ok(handle)
    }

    /// Execute a command and wait until its resulting event is either
    /// visible in the read model or delivered as a transient rejection.
    ///
    /// The correlation waiter is registered before the command is
    /// dispatched, so the downstream event cannot be missed.
    pub async fn submit<A: Aggregate>(
        &self,
        instance_id: &str,
        cmd: A::Command,
        timeout: Duration,
    ) -> Result<FeedEvent, SubmitError<A::Error>> {
        let correlation_id = Uuid::new_v4().to_string();
        let ticket = self.bridge.register(&correlation_id);

        let ctx = CommandContext::default().with_correlation_id(&correlation_id);
        let handle = self.get::<A>(instance_id).await.map_err(|e| {
            self.bridge.abandon(&correlation_id);
            SubmitError::Execute(e.into())
        })?;
        if let Err(e) = handle.execute(cmd, ctx).await {
            self.bridge.abandon(&correlation_id);
            return Err(SubmitError::Execute(e));
        }

        Ok(ticket.wait(timeout).await?)
    }

    /// Run every registered saga once: catch up on the log, dispatch the
    /// resulting commands, dead-letter failures, checkpoint.
    pub async fn run_sagas(&self) -> io::Result<SagaReport> {
        let mut report = SagaReport::default();

        for saga in self.sagas.iter() {
            let mut runner = saga.lock().await;
            let envelopes = runner.catch_up(&self.log)?;

            for envelope in envelopes {
                let outcome = match self.dispatchers.get(&envelope.aggregate_type) {
                    Some(dispatcher) => dispatcher.dispatch(self, envelope.clone()).await,
                    None => Err(DispatchError::UnknownAggregate(
                        envelope.aggregate_type.clone(),
                    )),
                };
                match outcome {
                    Ok(()) => report.dispatched += 1,
                    Err(e) => {
                        tracing::warn!(
                            saga = runner.name(),
                            aggregate_type = %envelope.aggregate_type,
                            instance_id = %envelope.instance_id,
                            error = %e,
                            "command dispatch failed, dead-lettering"
                        );
                        append_dead_letter(&runner.dead_letter_path(), envelope, &e.to_string())?;
                        report.dead_lettered += 1;
                    }
                }
            }

            // Checkpoint only after every envelope was dispatched or
            // dead-lettered; a crash before this point means re-dispatch
            // on restart, never loss.
            runner.save()?;
        }

        Ok(report)
    }

    /// Apply all outstanding events to the read model once.
    pub async fn project(&self) -> Result<usize, ProjectionError> {
        crate::read_model::project_pass(&self.log, &self.read_model, &self.bridge).await
    }

    /// Alternate saga and projection passes until neither makes progress.
    ///
    /// Saga-issued commands append new events, which in turn feed sagas;
    /// this drains the whole cascade deterministically, without the
    /// background pipeline.
    pub async fn settle(&self) -> Result<(), StoreError> {
        loop {
            let report = self.run_sagas().await?;
            let applied = self.project().await?;
            if report.is_idle() && applied == 0 {
                return Ok(());
            }
        }
    }

    /// Start the background pipeline: one task driving the sagas and one
    /// driving the projection consumer, both woken by new log heads.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the pipeline was already started on
    /// this store (or any clone of it).
    pub fn start_pipeline(&self) -> io::Result<PipelineHandle> {
        if self
            .pipeline_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "pipeline already started",
            ));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let saga_task = tokio::spawn(run_saga_loop(self.clone(), shutdown_rx.clone()));
        let projection_task = tokio::spawn(run_projection_loop(
            self.log.clone(),
            self.read_model.clone(),
            self.bridge.clone(),
            shutdown_rx,
        ));

        Ok(PipelineHandle {
            shutdown_tx,
            tasks: vec![saga_task, projection_task],
        })
    }

    /// Roll a document back to one of its historical versions by
    /// re-submitting that snapshot's content as a new revision.
    ///
    /// The restored revision gets the next version number and re-enters
    /// the approval pipeline like any other edit.
    pub async fn restore_version(
        &self,
        id: DocumentId,
        version: i64,
        timeout: Duration,
    ) -> Result<FeedEvent, RestoreError> {
        let instance_id = id.to_string();
        let row = self
            .read_model
            .version(&instance_id, version)
            .await?
            .ok_or(RestoreError::VersionNotFound { id, version })?;

        let document = Document::new(id, &row.title, &row.body)?;
        let event = self
            .submit::<DocumentState>(
                &instance_id,
                DocumentCommand::CreateOrUpdate { document },
                timeout,
            )
            .await?;
        Ok(event)
    }
}

/// Saga half of the background pipeline. Runs one pass immediately, then
/// on every new log head.
async fn run_saga_loop(store: Store, mut shutdown: watch::Receiver<bool>) {
    let mut head = store.log.subscribe();
    loop {
        match store.run_sagas().await {
            Ok(report) if !report.is_idle() => {
                tracing::debug!(
                    dispatched = report.dispatched,
                    dead_lettered = report.dead_lettered,
                    "saga pass complete"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "saga pass failed, will retry");
            }
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

/// Handle to the running background pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Signal both pipeline tasks to stop and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

type SagaFactory = Box<dyn FnOnce(&Path, &EventLog) -> io::Result<Box<dyn SagaCatchUp>> + Send>;

/// Builder for [`Store`].
pub struct StoreBuilder {
    base_dir: PathBuf,
    database_url: Option<String>,
    saga_factories: Vec<SagaFactory>,
    dispatchers: HashMap<String, Box<dyn AggregateDispatcher>>,
    idle_timeout: Duration,
}

impl StoreBuilder {
    fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            database_url: None,
            saga_factories: Vec::new(),
            dispatchers: HashMap::new(),
            idle_timeout: Duration::from_secs(300),
        }
    }

    /// Override the read model location. Defaults to `read_model.db`
    /// inside the base directory.
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Register an aggregate type as a dispatch target for saga-issued
    /// commands.
    pub fn aggregate_type<A>(mut self) -> Self
    where
        A: Aggregate,
        A::Command: DeserializeOwned,
    {
        self.dispatchers
            .insert(A::AGGREGATE_TYPE.to_owned(), Box::new(TypedDispatcher::<A>::new()));
        self
    }

    /// Register a saga with its dependencies. State is rebuilt from the
    /// log up to the saga's checkpoint when the store opens.
    pub fn saga<S: Saga>(mut self, deps: S::Deps) -> Self
    where
        S::Deps: Send,
    {
        self.saga_factories.push(Box::new(move |base_dir, log| {
            let runner = SagaRunner::<S>::new(base_dir, log, deps)?;
            Ok(Box::new(runner) as Box<dyn SagaCatchUp>)
        }));
        self
    }

    /// How long an aggregate actor may sit idle before evicting itself.
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Open the event log and read model and assemble the store.
    pub async fn open(self) -> Result<Store, StoreError> {
        std::fs::create_dir_all(&self.base_dir)?;
        let log = EventLog::open(&self.base_dir)?;

        let url = self
            .database_url
            .unwrap_or_else(|| format!("sqlite:{}/read_model.db", self.base_dir.display()));
        let read_model = ReadModel::connect(&url).await?;

        let mut sagas = Vec::with_capacity(self.saga_factories.len());
        for factory in self.saga_factories {
            sagas.push(Mutex::new(factory(&self.base_dir, &log)?));
        }

        Ok(Store {
            log,
            read_model,
            bridge: CorrelationBridge::new(),
            cache: Arc::new(RwLock::new(HashMap::new())),
            sagas: Arc::new(sagas),
            dispatchers: Arc::new(self.dispatchers),
            idle_timeout: self.idle_timeout,
            pipeline_started: Arc::new(AtomicBool::new(false)),
        })
    }
}
