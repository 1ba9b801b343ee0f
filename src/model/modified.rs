//! Last-modified time across the dashboard tables.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use jiff::Timestamp;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::backend::{Backend, Query, Topic, decode};
use crate::error::{HoldbackError, Result};
use crate::sync::{Dataset, SyncedView, ViewOptions};

use super::tables::MODIFIED_TABLES;

/// Newest change seen, and the table it happened in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableModified {
    pub table: String,
    pub updated_at: Timestamp,
}

/// A clock that only moves forward
#[derive(Debug, Default)]
pub struct ModifiedClock {
    latest: Mutex<Option<TableModified>>,
}

impl ModifiedClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<TableModified> {
        self.latest.lock().clone()
    }

    /// Record `candidate` if it is newer. Returns the clock's value after.
    pub fn observe(&self, candidate: TableModified) -> TableModified {
        let mut latest = self.latest.lock();
        match latest.as_ref() {
            Some(current) if current.updated_at >= candidate.updated_at => current.clone(),
            _ => {
                *latest = Some(candidate.clone());
                candidate
            }
        }
    }
}

#[derive(Deserialize)]
struct Stamp {
    updated_at: Option<Timestamp>,
}

/// Newest `updated_at` over `tables`.
///
/// Tables that cannot be read are skipped with a warning; the call fails only
/// when none of them could be read.
pub async fn latest_modified(
    backend: &dyn Backend,
    tables: &[&str],
) -> Result<Option<TableModified>> {
    let results = join_all(tables.iter().map(|table| async move {
        let query = Query::table(*table).order("updated_at", false).limit(1);
        let stamps: Vec<Stamp> = decode(backend.select(&query).await?)?;
        Ok::<_, HoldbackError>(stamps.into_iter().next().and_then(|s| s.updated_at))
    }))
    .await;

    let mut newest: Option<TableModified> = None;
    let mut failures = 0;
    for (table, result) in tables.iter().zip(results) {
        match result {
            Ok(Some(updated_at)) => {
                if newest.as_ref().is_none_or(|n| updated_at > n.updated_at) {
                    newest = Some(TableModified {
                        table: table.to_string(),
                        updated_at,
                    });
                }
            }
            Ok(None) => {}
            Err(e) => {
                failures += 1;
                tracing::warn!("could not read modified time of {table}: {e}");
            }
        }
    }

    if failures > 0 && failures == tables.len() {
        return Err(HoldbackError::Unavailable(
            "no table reported a modified time".to_string(),
        ));
    }
    if let Some(n) = &newest {
        tracing::debug!("most recent update: {} at {}", n.table, n.updated_at);
    }
    Ok(newest)
}

pub struct ModifiedDataset {
    clock: Arc<ModifiedClock>,
}

#[async_trait]
impl Dataset for ModifiedDataset {
    type State = Option<TableModified>;

    fn name(&self) -> &str {
        "modified"
    }

    fn topics(&self) -> Vec<Topic> {
        MODIFIED_TABLES.iter().map(|t| Topic::all(*t)).collect()
    }

    async fn fetch(&self, backend: &dyn Backend) -> Result<Self::State> {
        Ok(match latest_modified(backend, &MODIFIED_TABLES).await? {
            Some(found) => Some(self.clock.observe(found)),
            None => self.clock.get(),
        })
    }
}

/// Keeps the last-modified time current as tables change
pub struct ModifiedTracker {
    view: SyncedView<ModifiedDataset>,
    clock: Arc<ModifiedClock>,
}

impl ModifiedTracker {
    pub async fn open(backend: Arc<dyn Backend>, options: ViewOptions) -> Result<Self> {
        let clock = Arc::new(ModifiedClock::new());
        let dataset = ModifiedDataset {
            clock: Arc::clone(&clock),
        };
        Ok(Self {
            view: SyncedView::open(backend, dataset, options).await?,
            clock,
        })
    }

    pub fn view(&self) -> &SyncedView<ModifiedDataset> {
        &self.view
    }

    pub fn latest(&self) -> Option<TableModified> {
        self.view.snapshot()
    }

    pub fn clock(&self) -> &ModifiedClock {
        &self.clock
    }

    /// Re-read now; `false` if the read failed.
    pub async fn refresh(&self) -> bool {
        self.view.reconcile().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, field};

    fn at(s: &str) -> TableModified {
        TableModified {
            table: "Categories".to_string(),
            updated_at: s.parse().unwrap(),
        }
    }

    #[test]
    fn test_clock_only_moves_forward() {
        let clock = ModifiedClock::new();
        assert_eq!(clock.get(), None);
        let newer = at("2024-05-02T00:00:00Z");
        assert_eq!(clock.observe(newer.clone()), newer);
        assert_eq!(clock.observe(at("2024-05-01T00:00:00Z")), newer);
        assert_eq!(clock.get(), Some(newer));
    }

    #[tokio::test]
    async fn test_latest_modified_picks_newest_table() {
        let backend = MemoryBackend::new();
        backend
            .insert("Categories", vec![field("header", "Roofing")])
            .await
            .unwrap();
        backend
            .insert("equipmentType", vec![field("name", "Pumps")])
            .await
            .unwrap();

        let latest = latest_modified(&backend, &MODIFIED_TABLES)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.table, "equipmentType");
    }

    #[tokio::test]
    async fn test_latest_modified_empty_store() {
        let backend = MemoryBackend::new();
        assert_eq!(latest_modified(&backend, &MODIFIED_TABLES).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_latest_modified_offline_fails() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        assert!(latest_modified(&backend, &MODIFIED_TABLES).await.is_err());
    }
}
