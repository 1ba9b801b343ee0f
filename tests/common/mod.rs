#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use holdback::backend::{
    Backend, MemoryBackend, Query, Record, RowId, Subscription, SubscriptionId, Topic,
};
use holdback::error::Result;
use holdback::model::tables;
use holdback::sync::ViewOptions;

pub const WINDOW: Duration = Duration::from_millis(500);

/// An in-process store with the dashboard's cascades declared
pub fn store() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::with_cascades(tables::cascades()))
}

pub fn backend(store: &Arc<MemoryBackend>) -> Arc<dyn Backend> {
    Arc::clone(store) as Arc<dyn Backend>
}

pub fn options() -> ViewOptions {
    ViewOptions {
        debounce: WINDOW,
        echo_ttl: Duration::from_secs(10),
    }
}

/// Let spawned listeners and reconciles run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Wait out the debounce window, then settle
pub async fn past_window() {
    tokio::time::sleep(WINDOW + Duration::from_millis(100)).await;
}

/// A store whose insert responses arrive `delay` after the rows are committed
/// and announced, as over a slow link.
pub struct LateInserts {
    pub store: Arc<MemoryBackend>,
    pub delay: Duration,
}

#[async_trait]
impl Backend for LateInserts {
    async fn select(&self, query: &Query) -> Result<Vec<Record>> {
        self.store.select(query).await
    }

    async fn insert(&self, table: &str, records: Vec<Record>) -> Result<Vec<Record>> {
        let rows = self.store.insert(table, records).await?;
        tokio::time::sleep(self.delay).await;
        Ok(rows)
    }

    async fn update(&self, table: &str, id: RowId, fields: Record) -> Result<Record> {
        self.store.update(table, id, fields).await
    }

    async fn delete(&self, table: &str, id: RowId) -> Result<()> {
        self.store.delete(table, id).await
    }

    async fn subscribe(&self, topics: &[Topic]) -> Result<Subscription> {
        self.store.subscribe(topics).await
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.store.unsubscribe(id);
    }
}
