//! Backend abstraction.
//!
//! The dashboard talks to a hosted relational store through a small
//! query/insert/update/delete surface plus a publish/subscribe change channel
//! scoped by table name and event type. Records travel as JSON objects so the
//! same trait serves the HTTP backend and the in-process one.

pub mod error;
pub mod memory;
pub mod rest;

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{HoldbackError, Result};

pub use memory::{Cascade, MemoryBackend};
pub use rest::RestBackend;

/// A row as returned by the backend
pub type Record = serde_json::Map<String, Value>;

/// Backend-generated row identifier
pub type RowId = i64;

/// Kind of change carried by a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "INSERT"),
            ChangeKind::Update => write!(f, "UPDATE"),
            ChangeKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Event types a subscription listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventFilter {
    Insert,
    Update,
    Delete,
    #[default]
    All,
}

impl EventFilter {
    pub fn matches(self, kind: ChangeKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Insert => kind == ChangeKind::Insert,
            EventFilter::Update => kind == ChangeKind::Update,
            EventFilter::Delete => kind == ChangeKind::Delete,
        }
    }
}

/// A (table, event filter) pair to subscribe to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub table: String,
    pub filter: EventFilter,
}

impl Topic {
    /// Every change to `table`
    pub fn all(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: EventFilter::All,
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.table == event.table && self.filter.matches(event.kind)
    }
}

/// A change notification pushed by the backend.
///
/// Notifications carry no information about which client caused them.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    /// Identifier of the affected row, when the backend reports it
    pub row_id: Option<RowId>,
    /// New row for inserts and updates, old row for deletes
    pub record: Option<Record>,
    /// Set when the event stands for every change to `table` since the
    /// previous notification, as produced by polling backends
    pub coalesced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving end of a subscription.
///
/// Dropping it does not release the backend side; call
/// [`Backend::unsubscribe`] with [`Subscription::id`].
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, receiver: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self { id, receiver }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next notification; `None` once the backend side closes.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Take an already-delivered notification without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Equality filter on one column
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: Value,
}

/// Sort key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// A read against one table
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order.push(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `record` passes every filter
    pub fn matches(&self, record: &Record) -> bool {
        self.filters
            .iter()
            .all(|f| record.get(&f.column).is_some_and(|v| values_equal(v, &f.value)))
    }

    /// Compare two records by this query's sort keys, then by id
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for key in &self.order {
            let ord = compare_values(a.get(&key.column), b.get(&key.column));
            let ord = if key.ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        compare_values(a.get("id"), b.get("id"))
    }
}

/// Common interface for the hosted store
#[async_trait]
pub trait Backend: Send + Sync {
    /// Read rows matching `query`
    async fn select(&self, query: &Query) -> Result<Vec<Record>>;

    /// Insert rows; the returned records carry their generated ids
    async fn insert(&self, table: &str, records: Vec<Record>) -> Result<Vec<Record>>;

    /// Update the row addressed by `id` with `fields`
    async fn update(&self, table: &str, id: RowId, fields: Record) -> Result<Record>;

    /// Delete the row addressed by `id`; declared cascades follow
    async fn delete(&self, table: &str, id: RowId) -> Result<()>;

    /// Subscribe to change notifications on `topics`
    async fn subscribe(&self, topics: &[Topic]) -> Result<Subscription>;

    /// Release a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Extract the integer `id` of a record
pub fn record_id(record: &Record) -> Result<RowId> {
    record
        .get("id")
        .and_then(Value::as_i64)
        .ok_or(HoldbackError::MissingId)
}

/// Build a record from a serializable value
pub fn encode<T: Serialize>(value: &T) -> Result<Record> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(HoldbackError::Other(format!(
            "expected an object, got {other}"
        ))),
    }
}

/// Decode records into typed rows
pub fn decode<T: DeserializeOwned>(records: Vec<Record>) -> Result<Vec<T>> {
    records
        .into_iter()
        .map(|r| serde_json::from_value(Value::Object(r)).map_err(HoldbackError::from))
        .collect()
}

/// Build a single-field record
pub fn field(name: &str, value: impl Into<Value>) -> Record {
    let mut record = Record::new();
    record.insert(name.to_string(), value.into());
    record
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Total order over JSON values used for sorting rows.
///
/// Missing and null sort last. Strings that parse as timestamps compare
/// chronologically, so differently-precise RFC 3339 strings stay ordered.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                let x = x.as_f64().unwrap_or(0.0);
                let y = y.as_f64().unwrap_or(0.0);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            (Value::String(x), Value::String(y)) => {
                match (
                    x.parse::<jiff::Timestamp>(),
                    y.parse::<jiff::Timestamp>(),
                ) {
                    (Ok(tx), Ok(ty)) => tx.cmp(&ty),
                    _ => x.cmp(y),
                }
            }
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}
