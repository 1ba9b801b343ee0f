//! Keyed debounced writer.
//!
//! Each key (typically a `(table, row, field)` triple) has its own timer.
//! Scheduling a write for a key that already has one pending cancels the
//! pending one, so only the last value written during a quiet window reaches
//! the backend. Keys never interfere with each other. Once a write has
//! started it is never cancelled.
//!
//! Every scheduled write ends in exactly one [`WriteReport`] on the outcome
//! channel returned by [`DebouncedWriter::new`].

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::error::Result;

/// Default quiet window for field edits.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// How a scheduled write ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write reached the backend
    Written,
    /// A newer write for the same key replaced it before it fired
    Superseded,
    /// The backend rejected the write or could not be reached
    Failed(String),
}

/// Outcome of one scheduled write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport<K> {
    pub key: K,
    pub generation: u64,
    pub outcome: WriteOutcome,
}

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
    flush: Arc<Notify>,
}

struct WriterState<K> {
    next_generation: u64,
    pending: HashMap<K, Pending>,
    in_flight: usize,
}

/// Debounces writes independently per key.
pub struct DebouncedWriter<K> {
    window: Duration,
    state: Arc<Mutex<WriterState<K>>>,
    reports: mpsc::UnboundedSender<WriteReport<K>>,
    idle: Arc<Notify>,
}

impl<K> DebouncedWriter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a writer and the receiving end of its outcome channel.
    pub fn new(window: Duration) -> (Self, mpsc::UnboundedReceiver<WriteReport<K>>) {
        let (reports, receiver) = mpsc::unbounded_channel();
        let writer = Self {
            window,
            state: Arc::new(Mutex::new(WriterState {
                next_generation: 0,
                pending: HashMap::new(),
                in_flight: 0,
            })),
            reports,
            idle: Arc::new(Notify::new()),
        };
        (writer, receiver)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Schedule `write` for `key`, replacing any write still waiting for the
    /// same key. Returns the generation number of the new write.
    pub fn schedule<F, Fut>(&self, key: K, write: F) -> u64
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut state = self.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;

        if let Some(previous) = state.pending.remove(&key) {
            previous.handle.abort();
            let _ = self.reports.send(WriteReport {
                key: key.clone(),
                generation: previous.generation,
                outcome: WriteOutcome::Superseded,
            });
        }

        let flush = Arc::new(Notify::new());
        let handle = tokio::spawn(run_write(
            key.clone(),
            generation,
            self.window,
            Arc::clone(&flush),
            Arc::clone(&self.state),
            self.reports.clone(),
            Arc::clone(&self.idle),
            write,
        ));

        state.pending.insert(
            key,
            Pending {
                generation,
                handle,
                flush,
            },
        );
        generation
    }

    /// Fire every pending write now instead of waiting out its window.
    pub fn flush(&self) {
        for pending in self.state.lock().pending.values() {
            pending.flush.notify_one();
        }
    }

    /// Flush, then wait until no write is pending or in flight.
    pub async fn drain(&self) {
        self.flush();
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Writes waiting for their quiet window to end
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether a write for `key` is waiting to fire
    pub fn is_pending(&self, key: &K) -> bool {
        self.state.lock().pending.contains_key(key)
    }

    /// No write waiting and none in flight
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_flight == 0
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_write<K, F, Fut>(
    key: K,
    generation: u64,
    window: Duration,
    flush: Arc<Notify>,
    state: Arc<Mutex<WriterState<K>>>,
    reports: mpsc::UnboundedSender<WriteReport<K>>,
    idle: Arc<Notify>,
    write: F,
) where
    K: Eq + Hash + Clone + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::select! {
        _ = tokio::time::sleep(window) => {}
        _ = flush.notified() => {}
    }

    // Claim the slot; a newer write for the key may have replaced us while
    // we were waking up.
    {
        let mut state = state.lock();
        match state.pending.get(&key) {
            Some(pending) if pending.generation == generation => {
                state.pending.remove(&key);
                state.in_flight += 1;
            }
            _ => return,
        }
    }

    let mut settle = InFlight {
        key,
        generation,
        outcome: None,
        state,
        reports,
        idle,
    };
    settle.outcome = Some(match write().await {
        Ok(()) => WriteOutcome::Written,
        Err(e) => {
            tracing::warn!("debounced write failed: {e}");
            WriteOutcome::Failed(e.to_string())
        }
    });
}

/// A write that has claimed its slot. Dropping it reports the outcome and
/// releases the slot, also when the write panicked or its task was aborted.
struct InFlight<K: Clone> {
    key: K,
    generation: u64,
    outcome: Option<WriteOutcome>,
    state: Arc<Mutex<WriterState<K>>>,
    reports: mpsc::UnboundedSender<WriteReport<K>>,
    idle: Arc<Notify>,
}

impl<K: Clone> Drop for InFlight<K> {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| WriteOutcome::Failed("write did not complete".to_string()));
        let _ = self.reports.send(WriteReport {
            key: self.key.clone(),
            generation: self.generation,
            outcome,
        });
        self.state.lock().in_flight -= 1;
        self.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HoldbackError;

    type Log = Arc<Mutex<Vec<(&'static str, String)>>>;

    fn recording_write(
        log: &Log,
        key: &'static str,
        value: &str,
    ) -> impl FnOnce() -> std::future::Ready<Result<()>> + Send + 'static {
        let log = Arc::clone(log);
        let value = value.to_string();
        move || {
            log.lock().push((key, value));
            std::future::ready(Ok(()))
        }
    }

    fn drain_reports<K>(rx: &mut mpsc::UnboundedReceiver<WriteReport<K>>) -> Vec<WriteReport<K>> {
        let mut reports = Vec::new();
        while let Ok(report) = rx.try_recv() {
            reports.push(report);
        }
        reports
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_last_write_in_window_fires() {
        let (writer, mut rx) = DebouncedWriter::new(Duration::from_millis(500));
        let log: Log = Arc::default();

        writer.schedule("a", recording_write(&log, "a", "X"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        writer.schedule("a", recording_write(&log, "a", "Y"));
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(*log.lock(), vec![("a", "Y".to_string())]);
        let reports = drain_reports(&mut rx);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].outcome, WriteOutcome::Superseded);
        assert_eq!(reports[1].outcome, WriteOutcome::Written);
        assert!(writer.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let (writer, _rx) = DebouncedWriter::new(Duration::from_millis(500));
        let log: Log = Arc::default();

        writer.schedule("a", recording_write(&log, "a", "1"));
        writer.schedule("b", recording_write(&log, "b", "2"));
        writer.schedule("a", recording_write(&log, "a", "3"));
        assert_eq!(writer.pending_count(), 2);

        tokio::time::sleep(Duration::from_millis(600)).await;

        let mut writes = log.lock().clone();
        writes.sort();
        assert_eq!(writes, vec![("a", "3".to_string()), ("b", "2".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_fires_before_window() {
        let (writer, _rx) = DebouncedWriter::new(Duration::from_millis(500));
        let log: Log = Arc::default();

        writer.schedule("a", recording_write(&log, "a", "1"));
        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(log.lock().is_empty());
        assert!(writer.is_pending(&"a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_is_reported() {
        let (writer, mut rx) = DebouncedWriter::new(Duration::from_millis(100));
        writer.schedule("a", || async {
            Err(HoldbackError::Unavailable("offline".to_string()))
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let reports = drain_reports(&mut rx);
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].outcome, WriteOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_fires_pending_writes_immediately() {
        let (writer, _rx) = DebouncedWriter::new(Duration::from_secs(60));
        let log: Log = Arc::default();

        writer.schedule("a", recording_write(&log, "a", "1"));
        writer.schedule("b", recording_write(&log, "b", "2"));
        let started = tokio::time::Instant::now();
        writer.drain().await;

        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(log.lock().len(), 2);
        assert!(writer.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_write_still_settles() {
        let (writer, mut rx) = DebouncedWriter::new(Duration::from_millis(100));
        writer.schedule("a", || async {
            let connected = false;
            assert!(connected, "client panicked mid-request");
            Ok(())
        });

        let drained = tokio::time::timeout(Duration::from_secs(5), writer.drain()).await;
        assert!(drained.is_ok(), "drain must not hang after a panicked write");
        assert!(writer.is_idle());

        let reports = drain_reports(&mut rx);
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].outcome, WriteOutcome::Failed(_)));
    }
}
