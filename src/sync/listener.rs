//! Realtime change listener.
//!
//! Subscribes to table-level change notifications and hands every
//! notification that is not an echo of our own writes to a handler. The
//! subscription lives exactly as long as the returned [`ListenerHandle`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::backend::{Backend, ChangeEvent, Subscription, SubscriptionId, Topic};
use crate::error::Result;

use super::echo::{Disposition, EchoTracker};

/// Receives batches of external notifications.
#[async_trait]
pub trait ChangeHandler: Send + Sync + 'static {
    /// Called with every notification that was waiting when the listener
    /// woke up, minus the echoes. Never called with an empty batch.
    async fn on_external(&self, events: Vec<ChangeEvent>);
}

/// Keeps a subscription alive. Dropping it stops the listener task and
/// releases the backend subscription.
pub struct ListenerHandle {
    backend: Arc<dyn Backend>,
    subscription: SubscriptionId,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
        self.backend.unsubscribe(self.subscription);
        tracing::debug!("released subscription {}", self.subscription);
    }
}

/// Subscribe to `topics` and start dispatching external changes to `handler`.
pub async fn listen(
    backend: Arc<dyn Backend>,
    topics: &[Topic],
    echoes: Arc<EchoTracker>,
    handler: Arc<dyn ChangeHandler>,
) -> Result<ListenerHandle> {
    let subscription = backend.subscribe(topics).await?;
    let id = subscription.id();
    let task = tokio::spawn(run_listener(subscription, echoes, handler));
    Ok(ListenerHandle {
        backend,
        subscription: id,
        task,
    })
}

async fn run_listener(
    mut subscription: Subscription,
    echoes: Arc<EchoTracker>,
    handler: Arc<dyn ChangeHandler>,
) {
    while let Some(first) = subscription.recv().await {
        let mut external = Vec::new();
        classify(&echoes, first, &mut external);
        // Fold everything already queued into the same batch
        while let Some(event) = subscription.try_recv() {
            classify(&echoes, event, &mut external);
        }
        if !external.is_empty() {
            handler.on_external(external).await;
        }
    }
    tracing::debug!("subscription {} closed", subscription.id());
}

fn classify(echoes: &EchoTracker, event: ChangeEvent, external: &mut Vec<ChangeEvent>) {
    match echoes.classify(&event) {
        Disposition::Echo(token) => {
            tracing::debug!(
                "suppressed echo {} on {} (generation {})",
                event.kind,
                event.table,
                token.generation()
            );
        }
        Disposition::External => external.push(event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Record, field};
    use crate::sync::echo::EchoKey;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<ChangeEvent>>>,
    }

    #[async_trait]
    impl ChangeHandler for Recorder {
        async fn on_external(&self, events: Vec<ChangeEvent>) {
            self.batches.lock().push(events);
        }
    }

    fn row(name: &str) -> Record {
        field("name", name)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_is_not_dispatched() {
        let backend = Arc::new(MemoryBackend::new());
        let echoes = Arc::new(EchoTracker::default());
        let recorder = Arc::new(Recorder::default());
        let _handle = listen(
            backend.clone(),
            &[Topic::all("equipmentType")],
            echoes.clone(),
            recorder.clone(),
        )
        .await
        .unwrap();

        echoes.expect(EchoKey::any_row("equipmentType"));
        backend
            .insert("equipmentType", vec![row("Pumps")])
            .await
            .unwrap();
        settle().await;

        assert!(recorder.batches.lock().is_empty());
        assert!(echoes.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_change_is_dispatched_once() {
        let backend = Arc::new(MemoryBackend::new());
        let recorder = Arc::new(Recorder::default());
        let _handle = listen(
            backend.clone(),
            &[Topic::all("equipmentType")],
            Arc::new(EchoTracker::default()),
            recorder.clone(),
        )
        .await
        .unwrap();

        backend
            .insert("equipmentType", vec![row("Pumps")])
            .await
            .unwrap();
        settle().await;

        let batches = recorder.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].table, "equipmentType");
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_notifications_share_one_batch() {
        let backend = Arc::new(MemoryBackend::new());
        let recorder = Arc::new(Recorder::default());
        let _handle = listen(
            backend.clone(),
            &[Topic::all("equipmentType")],
            Arc::new(EchoTracker::default()),
            recorder.clone(),
        )
        .await
        .unwrap();

        backend
            .insert("equipmentType", vec![row("Pumps"), row("Fans"), row("Hoists")])
            .await
            .unwrap();
        settle().await;

        let batches = recorder.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_subscription() {
        let backend = Arc::new(MemoryBackend::new());
        let handle = listen(
            backend.clone(),
            &[Topic::all("equipmentType")],
            Arc::new(EchoTracker::default()),
            Arc::new(Recorder::default()),
        )
        .await
        .unwrap();
        assert_eq!(backend.subscriber_count(), 1);

        drop(handle);
        assert_eq!(backend.subscriber_count(), 0);
    }
}
