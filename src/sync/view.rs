//! Synced views.
//!
//! A [`SyncedView`] owns the local copy of one [`Dataset`] and keeps it in
//! step with the backend:
//!
//! - field edits apply to local state immediately and are written through a
//!   [`DebouncedWriter`] keyed per field;
//! - every write registers its expected echoes with an [`EchoTracker`]
//!   before it is issued;
//! - notifications that are not echoes trigger a full refetch, after which
//!   edits whose writes have not landed yet are re-applied;
//! - a failed write drops the edit, marks the field unsaved and refetches so
//!   local state falls back to what the backend holds.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::backend::{Backend, ChangeEvent, Record, RowId, Topic, field};
use crate::config::Config;
use crate::error::Result;

use super::debounce::{DEFAULT_DEBOUNCE, DebouncedWriter, WriteOutcome, WriteReport};
use super::echo::{DEFAULT_ECHO_TTL, EchoKey, EchoToken, EchoTracker};
use super::listener::{ChangeHandler, ListenerHandle, listen};

/// A dataset that can be read wholesale from the backend.
#[async_trait]
pub trait Dataset: Send + Sync + 'static {
    type State: Clone + Default + Send + Sync + 'static;

    /// Short name used in logs
    fn name(&self) -> &str;

    /// Notifications that invalidate this dataset
    fn topics(&self) -> Vec<Topic>;

    /// Read the complete dataset
    async fn fetch(&self, backend: &dyn Backend) -> Result<Self::State>;
}

/// Debounce key of a field edit
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldKey {
    pub table: String,
    pub id: RowId,
    pub field: String,
}

impl FieldKey {
    pub fn new(table: &str, id: RowId, field: &str) -> Self {
        Self {
            table: table.to_string(),
            id,
            field: field.to_string(),
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}.{}", self.table, self.id, self.field)
    }
}

/// Notification sent to whoever renders the view
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    /// Local state changed because of a local edit
    LocalEdit,
    /// Local state was replaced by a fresh read
    Reconciled,
    /// A field edit could not be saved and was reverted
    WriteFailed { key: FieldKey, error: String },
    /// User-facing result of a high-value action
    Toast { success: bool, message: String },
}

/// Tuning for a view
#[derive(Debug, Clone, Copy)]
pub struct ViewOptions {
    pub debounce: Duration,
    pub echo_ttl: Duration,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            echo_ttl: DEFAULT_ECHO_TTL,
        }
    }
}

impl From<&Config> for ViewOptions {
    fn from(config: &Config) -> Self {
        Self {
            debounce: config.debounce,
            ..Self::default()
        }
    }
}

type Overlay<S> = Arc<dyn Fn(&mut S) + Send + Sync>;

struct ViewInner<D: Dataset> {
    dataset: D,
    backend: Arc<dyn Backend>,
    state: RwLock<D::State>,
    revision: AtomicU64,
    echoes: Arc<EchoTracker>,
    /// Edits whose writes have not landed, keyed by field, with generation
    overlays: Mutex<HashMap<FieldKey, (u64, Overlay<D::State>)>>,
    unsaved: Mutex<HashMap<FieldKey, String>>,
    events: broadcast::Sender<ViewEvent>,
    refetches: AtomicU64,
    /// Serializes refetches, and refetches against structural mutations
    reconcile_lock: tokio::sync::Mutex<()>,
}

impl<D: Dataset> ViewInner<D> {
    fn notify(&self, event: ViewEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn mutate(&self, f: impl FnOnce(&mut D::State)) {
        {
            let mut state = self.state.write();
            f(&mut state);
        }
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    async fn load(&self) -> Result<D::State> {
        let mut fresh = self.dataset.fetch(self.backend.as_ref()).await?;
        let mut overlays: Vec<(u64, Overlay<D::State>)> =
            self.overlays.lock().values().cloned().collect();
        overlays.sort_by_key(|(generation, _)| *generation);
        for (_, overlay) in &overlays {
            overlay(&mut fresh);
        }
        Ok(fresh)
    }

    /// Replace local state with a fresh read. Failures keep the stale state.
    async fn reconcile(&self) -> bool {
        let _guard = self.reconcile_lock.lock().await;
        match self.load().await {
            Ok(fresh) => {
                self.mutate(|state| *state = fresh);
                let count = self.refetches.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!(
                    "{}: reconciled from backend (refetch #{count})",
                    self.dataset.name()
                );
                self.notify(ViewEvent::Reconciled);
                true
            }
            Err(e) => {
                tracing::warn!(
                    "{}: refetch failed, keeping stale state: {e}",
                    self.dataset.name()
                );
                false
            }
        }
    }

    async fn handle_report(&self, report: WriteReport<FieldKey>) {
        match report.outcome {
            WriteOutcome::Superseded => {}
            WriteOutcome::Written => {
                let mut overlays = self.overlays.lock();
                if overlays
                    .get(&report.key)
                    .is_some_and(|(generation, _)| *generation == report.generation)
                {
                    overlays.remove(&report.key);
                }
            }
            WriteOutcome::Failed(error) => {
                let dropped = {
                    let mut overlays = self.overlays.lock();
                    let current = overlays
                        .get(&report.key)
                        .is_some_and(|(generation, _)| *generation == report.generation);
                    if current {
                        overlays.remove(&report.key);
                    }
                    current
                };
                if !dropped {
                    // A newer edit of the same field is on its way
                    return;
                }
                tracing::warn!(
                    "{}: could not save {}: {error}",
                    self.dataset.name(),
                    report.key
                );
                self.unsaved.lock().insert(report.key.clone(), error.clone());
                self.notify(ViewEvent::WriteFailed {
                    key: report.key,
                    error,
                });
                self.reconcile().await;
            }
        }
    }
}

#[async_trait]
impl<D: Dataset> ChangeHandler for ViewInner<D> {
    async fn on_external(&self, events: Vec<ChangeEvent>) {
        tracing::debug!(
            "{}: {} external change(s), first on {}",
            self.dataset.name(),
            events.len(),
            events[0].table
        );
        self.reconcile().await;
    }
}

/// Local state of one dataset kept in sync with the backend.
pub struct SyncedView<D: Dataset> {
    inner: Arc<ViewInner<D>>,
    writer: DebouncedWriter<FieldKey>,
    listener: ListenerHandle,
    reports_task: JoinHandle<()>,
}

impl<D: Dataset> Drop for SyncedView<D> {
    fn drop(&mut self) {
        self.reports_task.abort();
    }
}

impl<D: Dataset> SyncedView<D> {
    /// Subscribe to the dataset's tables and load it.
    ///
    /// A failed initial read leaves the view empty; the next external change
    /// or an explicit [`SyncedView::reconcile`] fills it.
    pub async fn open(backend: Arc<dyn Backend>, dataset: D, options: ViewOptions) -> Result<Self> {
        let (events, _) = broadcast::channel(64);
        let topics = dataset.topics();
        let inner = Arc::new(ViewInner {
            dataset,
            backend: Arc::clone(&backend),
            state: RwLock::new(D::State::default()),
            revision: AtomicU64::new(0),
            echoes: Arc::new(EchoTracker::new(options.echo_ttl)),
            overlays: Mutex::new(HashMap::new()),
            unsaved: Mutex::new(HashMap::new()),
            events,
            refetches: AtomicU64::new(0),
            reconcile_lock: tokio::sync::Mutex::new(()),
        });

        // Subscribe before the first read so nothing slips between the two
        let listener = listen(
            backend,
            &topics,
            Arc::clone(&inner.echoes),
            Arc::clone(&inner) as Arc<dyn ChangeHandler>,
        )
        .await?;

        match inner.load().await {
            Ok(fresh) => inner.mutate(|state| *state = fresh),
            Err(e) => tracing::warn!("{}: initial load failed: {e}", inner.dataset.name()),
        }

        let (writer, reports) = DebouncedWriter::new(options.debounce);
        let reports_task = tokio::spawn(consume_reports(Arc::clone(&inner), reports));

        Ok(Self {
            inner,
            writer,
            listener,
            reports_task,
        })
    }

    pub fn dataset(&self) -> &D {
        &self.inner.dataset
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// Copy of the current local state
    pub fn snapshot(&self) -> D::State {
        self.inner.state.read().clone()
    }

    /// Read local state without cloning it
    pub fn read<R>(&self, f: impl FnOnce(&D::State) -> R) -> R {
        f(&self.inner.state.read())
    }

    /// Counter bumped on every local state change
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    /// Subscribe to view notifications
    pub fn events(&self) -> broadcast::Receiver<ViewEvent> {
        self.inner.events.subscribe()
    }

    /// Number of refetches performed after the initial load
    pub fn refetch_count(&self) -> u64 {
        self.inner.refetches.load(Ordering::SeqCst)
    }

    /// Echoes still expected from writes already issued
    pub fn outstanding_echoes(&self) -> usize {
        self.inner.echoes.outstanding()
    }

    /// Field edits still waiting for their quiet window
    pub fn pending_writes(&self) -> usize {
        self.writer.pending_count()
    }

    /// Fields whose last edit could not be saved, with the error
    pub fn unsaved(&self) -> Vec<(FieldKey, String)> {
        self.inner
            .unsaved
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn is_unsaved(&self, key: &FieldKey) -> bool {
        self.inner.unsaved.lock().contains_key(key)
    }

    /// Edit one field optimistically.
    ///
    /// `apply` runs against local state now and again after every refetch
    /// until the debounced write for `key` lands.
    pub fn edit_field(
        &self,
        key: FieldKey,
        value: Value,
        apply: impl Fn(&mut D::State) + Send + Sync + 'static,
    ) {
        let overlay: Overlay<D::State> = Arc::new(apply);
        self.inner.mutate(|state| overlay(state));
        self.inner.unsaved.lock().remove(&key);

        let backend = Arc::clone(&self.inner.backend);
        let echoes = Arc::clone(&self.inner.echoes);
        let target = key.clone();
        let write = move || async move {
            let token = echoes.expect(EchoKey::row(&target.table, target.id));
            tracing::debug!("writing {target}");
            match backend
                .update(&target.table, target.id, field(&target.field, value))
                .await
            {
                Ok(_) => Ok(()),
                Err(e) => {
                    echoes.cancel(token);
                    Err(e)
                }
            }
        };

        // Hold the overlay map while scheduling so the write's report cannot
        // be handled before its overlay is recorded.
        {
            let mut overlays = self.inner.overlays.lock();
            let generation = self.writer.schedule(key.clone(), write);
            overlays.insert(key, (generation, overlay));
        }
        self.inner.notify(ViewEvent::LocalEdit);
    }

    /// Hold off refetches while a structural mutation is written and applied
    /// locally.
    ///
    /// A refetch that is already running finishes first. One triggered while
    /// the guard is held waits for it, then reads the mutation's result, so
    /// rows are never added to local state twice or brought back after a
    /// delete.
    pub async fn hold_refetches(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.reconcile_lock.lock().await
    }

    /// Apply a local-only change (after a structural mutation succeeded)
    pub fn apply_local(&self, f: impl FnOnce(&mut D::State)) {
        self.inner.mutate(f);
        self.inner.notify(ViewEvent::LocalEdit);
    }

    /// Insert rows, expecting one echo per row
    pub async fn insert(&self, table: &str, records: Vec<Record>) -> Result<Vec<Record>> {
        let tokens = self
            .inner
            .echoes
            .expect_all((0..records.len()).map(|_| EchoKey::any_row(table)));
        match self.inner.backend.insert(table, records).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                self.cancel_all(&tokens);
                Err(e)
            }
        }
    }

    /// Update a row right away, bypassing the debounce window
    pub async fn update_now(&self, table: &str, id: RowId, fields: Record) -> Result<Record> {
        let token = self.inner.echoes.expect(EchoKey::row(table, id));
        match self.inner.backend.update(table, id, fields).await {
            Ok(row) => Ok(row),
            Err(e) => {
                self.inner.echoes.cancel(token);
                Err(e)
            }
        }
    }

    /// Delete a row, expecting echoes for it and for the rows the backend
    /// removes with it (`cascaded`).
    pub async fn delete(&self, table: &str, id: RowId, cascaded: Vec<EchoKey>) -> Result<()> {
        let tokens = self
            .inner
            .echoes
            .expect_all(std::iter::once(EchoKey::row(table, id)).chain(cascaded));
        match self.inner.backend.delete(table, id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.cancel_all(&tokens);
                Err(e)
            }
        }
    }

    /// Refetch the dataset now. Returns `false` if the read failed.
    pub async fn reconcile(&self) -> bool {
        self.inner.reconcile().await
    }

    /// Fire pending field writes without waiting for their windows.
    pub fn flush(&self) {
        self.writer.flush();
    }

    /// Fire pending field writes and wait for all of them to finish.
    pub async fn close(self) {
        self.writer.drain().await;
        tracing::debug!(
            "{}: closing view (subscription {})",
            self.inner.dataset.name(),
            self.listener.subscription_id()
        );
    }

    /// Send a toast notification to the view's listeners
    pub fn toast(&self, success: bool, message: impl Into<String>) {
        self.inner.notify(ViewEvent::Toast {
            success,
            message: message.into(),
        });
    }

    fn cancel_all(&self, tokens: &[EchoToken]) {
        for token in tokens {
            self.inner.echoes.cancel(*token);
        }
    }
}

async fn consume_reports<D: Dataset>(
    inner: Arc<ViewInner<D>>,
    mut reports: mpsc::UnboundedReceiver<WriteReport<FieldKey>>,
) {
    while let Some(report) = reports.recv().await {
        inner.handle_report(report).await;
    }
}
