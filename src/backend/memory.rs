//! In-process backend.
//!
//! Behaves like the hosted store as far as the sync engine can observe:
//! generated ids, `created_at`/`updated_at` stamps, declared delete cascades,
//! and one change notification per affected row delivered to every matching
//! subscriber, including the client that made the change.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use jiff::Timestamp;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{HoldbackError, Result};

use super::{
    Backend, ChangeEvent, ChangeKind, Query, Record, RowId, Subscription, SubscriptionId, Topic,
};

/// Delete cascade: deleting a `parent` row deletes every `child` row whose
/// `column` holds the parent's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cascade {
    pub child: String,
    pub column: String,
    pub parent: String,
}

impl Cascade {
    pub fn new(child: &str, column: &str, parent: &str) -> Self {
        Self {
            child: child.to_string(),
            column: column.to_string(),
            parent: parent.to_string(),
        }
    }
}

/// An update as it reached the store
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub table: String,
    pub id: RowId,
    pub fields: Record,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<String, BTreeMap<RowId, Record>>,
    next_id: HashMap<String, RowId>,
    last_stamp: Option<Timestamp>,
}

impl Tables {
    /// Strictly increasing timestamp so creation order is total.
    fn stamp(&mut self) -> Timestamp {
        let now = Timestamp::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last
                .checked_add(jiff::SignedDuration::from_micros(1))
                .unwrap_or(last),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn allocate_id(&mut self, table: &str) -> RowId {
        let next = self.next_id.entry(table.to_string()).or_insert(1);
        let id = *next;
        *next += 1;
        id
    }

    fn reserve_id(&mut self, table: &str, id: RowId) {
        let next = self.next_id.entry(table.to_string()).or_insert(1);
        if *next <= id {
            *next = id + 1;
        }
    }
}

struct Subscriber {
    topics: Vec<Topic>,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

/// Hosted-store stand-in kept entirely in memory.
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    cascades: Vec<Cascade>,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
    next_subscription: AtomicU64,
    offline: AtomicBool,
    updates: Mutex<Vec<WriteRecord>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty store without cascades
    pub fn new() -> Self {
        Self::with_cascades(Vec::new())
    }

    /// Create an empty store with the given delete cascades
    pub fn with_cascades(cascades: Vec<Cascade>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            cascades,
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            offline: AtomicBool::new(false),
            updates: Mutex::new(Vec::new()),
        }
    }

    /// Make every subsequent call fail as if the network were down
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every update that reached the store, in arrival order
    pub fn updates(&self) -> Vec<WriteRecord> {
        self.updates.lock().clone()
    }

    /// Number of rows currently in `table`
    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .rows
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    /// Current copy of a row
    pub fn get(&self, table: &str, id: RowId) -> Option<Record> {
        self.tables
            .lock()
            .rows
            .get(table)
            .and_then(|rows| rows.get(&id))
            .cloned()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(HoldbackError::Unavailable(
                "memory backend is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, subscriber| {
            for event in &events {
                if subscriber.topics.iter().any(|t| t.matches(event))
                    && subscriber.sender.send(event.clone()).is_err()
                {
                    tracing::debug!("dropping closed subscription {id}");
                    return false;
                }
            }
            true
        });
    }

    /// Remove a row and everything that cascades from it.
    fn delete_cascading(
        &self,
        tables: &mut Tables,
        table: &str,
        id: RowId,
        events: &mut Vec<ChangeEvent>,
    ) {
        let Some(old) = tables.rows.get_mut(table).and_then(|rows| rows.remove(&id)) else {
            return;
        };

        for cascade in self.cascades.iter().filter(|c| c.parent == table) {
            let children: Vec<RowId> = tables
                .rows
                .get(&cascade.child)
                .map(|rows| {
                    rows.iter()
                        .filter(|(_, r)| r.get(&cascade.column).and_then(Value::as_i64) == Some(id))
                        .map(|(child_id, _)| *child_id)
                        .collect()
                })
                .unwrap_or_default();
            for child in children {
                self.delete_cascading(tables, &cascade.child, child, events);
            }
        }

        events.push(ChangeEvent {
            table: table.to_string(),
            kind: ChangeKind::Delete,
            row_id: Some(id),
            record: Some(old),
            coalesced: false,
        });
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Record>> {
        self.check_online()?;
        let tables = self.tables.lock();
        let mut rows: Vec<Record> = tables
            .rows
            .get(&query.table)
            .map(|rows| rows.values().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| query.compare(a, b));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, records: Vec<Record>) -> Result<Vec<Record>> {
        self.check_online()?;
        let mut inserted = Vec::with_capacity(records.len());
        {
            let mut tables = self.tables.lock();
            for mut record in records {
                let id = match record.get("id").and_then(Value::as_i64) {
                    Some(id) => {
                        tables.reserve_id(table, id);
                        id
                    }
                    None => tables.allocate_id(table),
                };
                let stamp = tables.stamp().to_string();
                record.insert("id".to_string(), Value::from(id));
                record
                    .entry("created_at".to_string())
                    .or_insert_with(|| Value::from(stamp.clone()));
                record.insert("updated_at".to_string(), Value::from(stamp));
                tables
                    .rows
                    .entry(table.to_string())
                    .or_default()
                    .insert(id, record.clone());
                inserted.push(record);
            }
        }

        self.publish(
            inserted
                .iter()
                .map(|r| ChangeEvent {
                    table: table.to_string(),
                    kind: ChangeKind::Insert,
                    row_id: r.get("id").and_then(Value::as_i64),
                    record: Some(r.clone()),
                    coalesced: false,
                })
                .collect(),
        );
        Ok(inserted)
    }

    async fn update(&self, table: &str, id: RowId, fields: Record) -> Result<Record> {
        self.check_online()?;
        let updated = {
            let mut tables = self.tables.lock();
            let stamp = tables.stamp().to_string();
            let row = tables
                .rows
                .get_mut(table)
                .and_then(|rows| rows.get_mut(&id))
                .ok_or_else(|| HoldbackError::RowNotFound {
                    table: table.to_string(),
                    id,
                })?;
            for (key, value) in &fields {
                if key != "id" {
                    row.insert(key.clone(), value.clone());
                }
            }
            row.insert("updated_at".to_string(), Value::from(stamp));
            row.clone()
        };

        self.updates.lock().push(WriteRecord {
            table: table.to_string(),
            id,
            fields,
        });
        self.publish(vec![ChangeEvent {
            table: table.to_string(),
            kind: ChangeKind::Update,
            row_id: Some(id),
            record: Some(updated.clone()),
            coalesced: false,
        }]);
        Ok(updated)
    }

    async fn delete(&self, table: &str, id: RowId) -> Result<()> {
        self.check_online()?;
        let mut events = Vec::new();
        {
            let mut tables = self.tables.lock();
            self.delete_cascading(&mut tables, table, id, &mut events);
        }
        self.publish(events);
        Ok(())
    }

    async fn subscribe(&self, topics: &[Topic]) -> Result<Subscription> {
        self.check_online()?;
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().insert(
            id,
            Subscriber {
                topics: topics.to_vec(),
                sender,
            },
        );
        Ok(Subscription::new(id, receiver))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{field, record_id};
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_and_stamps() {
        let backend = MemoryBackend::new();
        let rows = backend
            .insert(
                "equipmentType",
                vec![record(json!({"name": "Pumps"})), record(json!({"name": "Fans"}))],
            )
            .await
            .unwrap();

        assert_eq!(record_id(&rows[0]).unwrap(), 1);
        assert_eq!(record_id(&rows[1]).unwrap(), 2);
        let first: Timestamp = rows[0]["created_at"].as_str().unwrap().parse().unwrap();
        let second: Timestamp = rows[1]["created_at"].as_str().unwrap().parse().unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_select_filters_orders_and_limits() {
        let backend = MemoryBackend::new();
        backend
            .insert(
                "CategoryData",
                vec![
                    record(json!({"category_id": 1, "row_number": 2})),
                    record(json!({"category_id": 1, "row_number": 1})),
                    record(json!({"category_id": 2, "row_number": 1})),
                ],
            )
            .await
            .unwrap();

        let query = Query::table("CategoryData")
            .eq("category_id", 1)
            .order("row_number", true);
        let rows = backend.select(&query).await.unwrap();
        let numbers: Vec<i64> = rows.iter().map(|r| r["row_number"].as_i64().unwrap()).collect();
        assert_eq!(numbers, vec![1, 2]);

        let limited = backend.select(&query.limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_row_fails() {
        let backend = MemoryBackend::new();
        let result = backend.update("QuotedProjects", 9, field("name", "x")).await;
        assert!(matches!(result, Err(HoldbackError::RowNotFound { id: 9, .. })));
    }

    #[tokio::test]
    async fn test_delete_cascades_and_notifies() {
        let backend = MemoryBackend::with_cascades(vec![
            Cascade::new("equipmentRows", "type_id", "equipmentType"),
            Cascade::new("equipmentCells", "row_id", "equipmentRows"),
        ]);
        let mut sub = backend
            .subscribe(&[Topic::all("equipmentRows"), Topic::all("equipmentCells")])
            .await
            .unwrap();

        backend
            .insert("equipmentType", vec![record(json!({"name": "Pumps"}))])
            .await
            .unwrap();
        backend
            .insert("equipmentRows", vec![record(json!({"type_id": 1}))])
            .await
            .unwrap();
        backend
            .insert("equipmentCells", vec![record(json!({"row_id": 1, "value": ""}))])
            .await
            .unwrap();
        // Drain the two insert notifications
        assert_eq!(sub.recv().await.unwrap().kind, ChangeKind::Insert);
        assert_eq!(sub.recv().await.unwrap().kind, ChangeKind::Insert);

        backend.delete("equipmentType", 1).await.unwrap();

        assert_eq!(backend.row_count("equipmentRows"), 0);
        assert_eq!(backend.row_count("equipmentCells"), 0);

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.table, "equipmentCells");
        assert_eq!(first.kind, ChangeKind::Delete);
        assert_eq!(second.table, "equipmentRows");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let backend = MemoryBackend::new();
        let mut sub = backend.subscribe(&[Topic::all("Categories")]).await.unwrap();
        backend.unsubscribe(sub.id());
        assert_eq!(backend.subscriber_count(), 0);

        backend
            .insert("Categories", vec![record(json!({"header": "x"}))])
            .await
            .unwrap();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_offline_rejects_calls() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        let result = backend.select(&Query::table("QuotedProjects")).await;
        assert!(matches!(result, Err(HoldbackError::Unavailable(_))));

        backend.set_offline(false);
        assert!(backend.select(&Query::table("QuotedProjects")).await.is_ok());
    }
}
