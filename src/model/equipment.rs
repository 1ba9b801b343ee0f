//! Equipment tables.
//!
//! Each equipment type owns its own grid: columns and rows created on demand,
//! one cell per (row, column). Rows and cells keep creation order.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use jiff::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{Backend, Query, Record, RowId, Topic, decode, encode};
use crate::error::{HoldbackError, Result};
use crate::sync::{Dataset, EchoKey, FieldKey, SyncedView, ViewOptions};

use super::grouping::{Created, group_by_key, sort_by_creation};
use super::null_as_default;
use super::tables::{EQUIPMENT_CELLS, EQUIPMENT_COLUMNS, EQUIPMENT_ROWS, EQUIPMENT_TYPES};
use super::MAX_EQUIPMENT_COLUMNS;

pub const FIRST_COLUMN_NAME: &str = "Column 1";
pub const NEW_COLUMN_NAME: &str = "New Column";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EquipmentType {
    pub id: RowId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EquipmentColumn {
    pub id: RowId,
    pub type_id: RowId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EquipmentRow {
    pub id: RowId,
    pub type_id: RowId,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EquipmentCell {
    pub id: RowId,
    pub row_id: RowId,
    pub column_id: RowId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub value: String,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

macro_rules! impl_created {
    ($($ty:ty),*) => {
        $(impl Created for $ty {
            fn id(&self) -> RowId {
                self.id
            }
            fn created_at(&self) -> Option<Timestamp> {
                self.created_at
            }
        })*
    };
}

impl_created!(EquipmentType, EquipmentColumn, EquipmentRow, EquipmentCell);

#[derive(Serialize)]
struct NewType<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct NewColumn<'a> {
    type_id: RowId,
    name: &'a str,
}

#[derive(Serialize)]
struct NewRow {
    type_id: RowId,
}

#[derive(Serialize)]
struct NewCell<'a> {
    row_id: RowId,
    column_id: RowId,
    value: &'a str,
}

/// The four equipment tables as read, each in creation order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EquipmentState {
    pub types: Vec<EquipmentType>,
    pub columns: Vec<EquipmentColumn>,
    pub rows: Vec<EquipmentRow>,
    pub cells: Vec<EquipmentCell>,
}

impl EquipmentState {
    fn columns_of(&self, type_id: RowId) -> Vec<EquipmentColumn> {
        self.columns
            .iter()
            .filter(|c| c.type_id == type_id)
            .cloned()
            .collect()
    }

    fn rows_of(&self, type_id: RowId) -> Vec<EquipmentRow> {
        self.rows
            .iter()
            .filter(|r| r.type_id == type_id)
            .cloned()
            .collect()
    }

    fn cell_keys(&self, keep: impl Fn(&EquipmentCell) -> bool) -> Vec<EchoKey> {
        self.cells
            .iter()
            .filter(|c| keep(c))
            .map(|c| EchoKey::row(EQUIPMENT_CELLS, c.id))
            .collect()
    }

    /// Regroup the flat tables per type
    pub fn groups(&self) -> Vec<EquipmentGroup> {
        let mut columns = group_by_key(self.columns.iter().cloned(), |c| c.type_id);
        let mut rows = group_by_key(self.rows.iter().cloned(), |r| r.type_id);
        let mut cells = group_by_key(self.cells.iter().cloned(), |c| c.row_id);

        self.types
            .iter()
            .map(|kind| {
                let mut type_columns = columns.remove(&kind.id).unwrap_or_default();
                sort_by_creation(&mut type_columns);
                let mut type_rows = rows.remove(&kind.id).unwrap_or_default();
                sort_by_creation(&mut type_rows);
                let rows = type_rows
                    .into_iter()
                    .map(|row| {
                        let mut row_cells = cells.remove(&row.id).unwrap_or_default();
                        sort_by_creation(&mut row_cells);
                        GroupRow {
                            row,
                            cells: row_cells,
                        }
                    })
                    .collect();
                EquipmentGroup {
                    kind: kind.clone(),
                    columns: type_columns,
                    rows,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupRow {
    pub row: EquipmentRow,
    /// Ordered by creation so columns line up across rows
    pub cells: Vec<EquipmentCell>,
}

/// One equipment type with its grid
#[derive(Debug, Clone, PartialEq)]
pub struct EquipmentGroup {
    pub kind: EquipmentType,
    pub columns: Vec<EquipmentColumn>,
    pub rows: Vec<GroupRow>,
}

pub struct EquipmentDataset;

#[async_trait]
impl Dataset for EquipmentDataset {
    type State = EquipmentState;

    fn name(&self) -> &str {
        "equipment"
    }

    fn topics(&self) -> Vec<Topic> {
        [EQUIPMENT_TYPES, EQUIPMENT_COLUMNS, EQUIPMENT_ROWS, EQUIPMENT_CELLS]
            .into_iter()
            .map(Topic::all)
            .collect()
    }

    async fn fetch(&self, backend: &dyn Backend) -> Result<Self::State> {
        let types = Query::table(EQUIPMENT_TYPES).order("created_at", true);
        let columns = Query::table(EQUIPMENT_COLUMNS).order("created_at", true);
        let rows = Query::table(EQUIPMENT_ROWS).order("created_at", true);
        let cells = Query::table(EQUIPMENT_CELLS).order("created_at", true);
        let (types, columns, rows, cells) = futures::try_join!(
            backend.select(&types),
            backend.select(&columns),
            backend.select(&rows),
            backend.select(&cells),
        )?;

        let mut state = EquipmentState {
            types: decode(types)?,
            columns: decode(columns)?,
            rows: decode(rows)?,
            cells: decode(cells)?,
        };
        sort_by_creation(&mut state.types);
        sort_by_creation(&mut state.columns);
        sort_by_creation(&mut state.rows);
        sort_by_creation(&mut state.cells);
        Ok(state)
    }
}

/// Equipment types kept in sync with the store
pub struct EquipmentBoard {
    view: SyncedView<EquipmentDataset>,
    expanded: Mutex<HashSet<RowId>>,
    /// Groups derived at a given view revision
    grouped: Mutex<Option<(u64, Arc<Vec<EquipmentGroup>>)>>,
}

impl EquipmentBoard {
    pub async fn open(backend: Arc<dyn Backend>, options: ViewOptions) -> Result<Self> {
        Ok(Self {
            view: SyncedView::open(backend, EquipmentDataset, options).await?,
            expanded: Mutex::new(HashSet::new()),
            grouped: Mutex::new(None),
        })
    }

    pub fn view(&self) -> &SyncedView<EquipmentDataset> {
        &self.view
    }

    /// Equipment types with their grids, recomputed only when state changed
    pub fn groups(&self) -> Arc<Vec<EquipmentGroup>> {
        let mut grouped = self.grouped.lock();
        let revision = self.view.revision();
        if let Some((at, groups)) = grouped.as_ref() {
            if *at == revision {
                return Arc::clone(groups);
            }
        }
        let groups = Arc::new(self.view.read(EquipmentState::groups));
        *grouped = Some((revision, Arc::clone(&groups)));
        groups
    }

    pub fn group(&self, type_id: RowId) -> Result<EquipmentGroup> {
        self.groups()
            .iter()
            .find(|g| g.kind.id == type_id)
            .cloned()
            .ok_or(HoldbackError::TypeNotFound(type_id))
    }

    pub fn is_expanded(&self, type_id: RowId) -> bool {
        self.expanded.lock().contains(&type_id)
    }

    pub fn toggle_expanded(&self, type_id: RowId) -> bool {
        let mut expanded = self.expanded.lock();
        if expanded.remove(&type_id) {
            false
        } else {
            expanded.insert(type_id);
            true
        }
    }

    /// Create a type with one column, one row and one empty cell.
    ///
    /// The outcome is also announced as a toast.
    pub async fn add_type(&self, name: &str) -> Result<RowId> {
        match self.create_type(name).await {
            Ok(id) => {
                self.expanded.lock().insert(id);
                self.view.toast(true, format!("Added equipment type '{name}'"));
                Ok(id)
            }
            Err(e) => {
                self.view
                    .toast(false, format!("Could not add equipment type '{name}': {e}"));
                Err(e)
            }
        }
    }

    async fn create_type(&self, name: &str) -> Result<RowId> {
        let _hold = self.view.hold_refetches().await;
        let inserted = self
            .view
            .insert(EQUIPMENT_TYPES, vec![encode(&NewType { name })?])
            .await?;
        let kind: EquipmentType = single(inserted)?;
        let type_id = kind.id;

        let filled = async {
            let column: EquipmentColumn = single(
                self.view
                    .insert(
                        EQUIPMENT_COLUMNS,
                        vec![encode(&NewColumn {
                            type_id,
                            name: FIRST_COLUMN_NAME,
                        })?],
                    )
                    .await?,
            )?;
            let row: EquipmentRow = single(
                self.view
                    .insert(EQUIPMENT_ROWS, vec![encode(&NewRow { type_id })?])
                    .await?,
            )?;
            let cell: EquipmentCell = single(
                self.view
                    .insert(
                        EQUIPMENT_CELLS,
                        vec![encode(&NewCell {
                            row_id: row.id,
                            column_id: column.id,
                            value: "",
                        })?],
                    )
                    .await?,
            )?;
            Ok::<_, HoldbackError>((column, row, cell))
        }
        .await;

        match filled {
            Ok((column, row, cell)) => {
                self.view.apply_local(move |state| {
                    state.types.push(kind);
                    state.columns.push(column);
                    state.rows.push(row);
                    state.cells.push(cell);
                });
                tracing::info!("added equipment type {type_id}");
                Ok(type_id)
            }
            Err(e) => {
                if let Err(cleanup) = self.view.delete(EQUIPMENT_TYPES, type_id, Vec::new()).await {
                    tracing::warn!("could not remove partial equipment type {type_id}: {cleanup}");
                }
                Err(e)
            }
        }
    }

    /// Append a row with one empty cell per column.
    pub async fn add_row(&self, type_id: RowId) -> Result<RowId> {
        let _hold = self.view.hold_refetches().await;
        let columns = self.known_type(type_id, EquipmentState::columns_of)?;
        let row: EquipmentRow = single(
            self.view
                .insert(EQUIPMENT_ROWS, vec![encode(&NewRow { type_id })?])
                .await?,
        )?;
        let row_id = row.id;
        let records = columns
            .iter()
            .map(|c| {
                encode(&NewCell {
                    row_id,
                    column_id: c.id,
                    value: "",
                })
            })
            .collect::<Result<Vec<Record>>>()?;
        let cells: Vec<EquipmentCell> = decode(self.view.insert(EQUIPMENT_CELLS, records).await?)?;
        self.view.apply_local(move |state| {
            state.rows.push(row);
            state.cells.extend(cells);
        });
        Ok(row_id)
    }

    /// Delete a row. Returns `true` when it was the type's last row and the
    /// type went with it.
    pub async fn delete_row(&self, row_id: RowId) -> Result<bool> {
        let _hold = self.view.hold_refetches().await;
        let (type_id, remaining, cascaded) = self
            .view
            .read(|state| {
                let row = state.rows.iter().find(|r| r.id == row_id)?;
                let remaining = state
                    .rows
                    .iter()
                    .filter(|r| r.type_id == row.type_id && r.id != row_id)
                    .count();
                Some((row.type_id, remaining, state.cell_keys(|c| c.row_id == row_id)))
            })
            .ok_or_else(|| HoldbackError::RowNotFound {
                table: EQUIPMENT_ROWS.to_string(),
                id: row_id,
            })?;

        self.view.delete(EQUIPMENT_ROWS, row_id, cascaded).await?;
        self.view.apply_local(|state| {
            state.rows.retain(|r| r.id != row_id);
            state.cells.retain(|c| c.row_id != row_id);
        });

        if remaining > 0 {
            return Ok(false);
        }

        // An equipment type without rows is removed as well
        let cascaded = self.view.read(|state| {
            let columns: HashSet<RowId> = state
                .columns
                .iter()
                .filter(|c| c.type_id == type_id)
                .map(|c| c.id)
                .collect();
            let mut keys: Vec<EchoKey> = columns
                .iter()
                .map(|id| EchoKey::row(EQUIPMENT_COLUMNS, *id))
                .collect();
            keys.extend(state.cell_keys(|c| columns.contains(&c.column_id)));
            keys
        });
        self.view.delete(EQUIPMENT_TYPES, type_id, cascaded).await?;
        self.view.apply_local(|state| {
            let columns: HashSet<RowId> = state
                .columns
                .iter()
                .filter(|c| c.type_id == type_id)
                .map(|c| c.id)
                .collect();
            state.types.retain(|t| t.id != type_id);
            state.columns.retain(|c| c.type_id != type_id);
            state.cells.retain(|c| !columns.contains(&c.column_id));
        });
        self.expanded.lock().remove(&type_id);
        tracing::info!("removed equipment type {type_id} with its last row");
        Ok(true)
    }

    /// Whether another column fits under the per-type cap
    pub fn can_add_column(&self, type_id: RowId) -> bool {
        self.view.read(|state| {
            state.columns.iter().filter(|c| c.type_id == type_id).count() < MAX_EQUIPMENT_COLUMNS
        })
    }

    /// Add a column with an empty cell in every row of the type.
    pub async fn add_column(&self, type_id: RowId, name: Option<&str>) -> Result<RowId> {
        let _hold = self.view.hold_refetches().await;
        let rows = self.known_type(type_id, EquipmentState::rows_of)?;
        if !self.can_add_column(type_id) {
            return Err(HoldbackError::ColumnLimit(MAX_EQUIPMENT_COLUMNS));
        }
        let column: EquipmentColumn = single(
            self.view
                .insert(
                    EQUIPMENT_COLUMNS,
                    vec![encode(&NewColumn {
                        type_id,
                        name: name.unwrap_or(NEW_COLUMN_NAME),
                    })?],
                )
                .await?,
        )?;
        let column_id = column.id;
        let records = rows
            .iter()
            .map(|r| {
                encode(&NewCell {
                    row_id: r.id,
                    column_id,
                    value: "",
                })
            })
            .collect::<Result<Vec<Record>>>()?;
        let cells: Vec<EquipmentCell> = decode(self.view.insert(EQUIPMENT_CELLS, records).await?)?;
        self.view.apply_local(move |state| {
            state.columns.push(column);
            state.cells.extend(cells);
        });
        Ok(column_id)
    }

    pub async fn delete_column(&self, column_id: RowId) -> Result<()> {
        let _hold = self.view.hold_refetches().await;
        let cascaded = self
            .view
            .read(|state| {
                state
                    .columns
                    .iter()
                    .any(|c| c.id == column_id)
                    .then(|| state.cell_keys(|c| c.column_id == column_id))
            })
            .ok_or_else(|| HoldbackError::RowNotFound {
                table: EQUIPMENT_COLUMNS.to_string(),
                id: column_id,
            })?;
        self.view
            .delete(EQUIPMENT_COLUMNS, column_id, cascaded)
            .await?;
        self.view.apply_local(|state| {
            state.columns.retain(|c| c.id != column_id);
            state.cells.retain(|c| c.column_id != column_id);
        });
        Ok(())
    }

    pub fn rename_column(&self, column_id: RowId, name: &str) -> Result<()> {
        if !self.view.read(|state| state.columns.iter().any(|c| c.id == column_id)) {
            return Err(HoldbackError::RowNotFound {
                table: EQUIPMENT_COLUMNS.to_string(),
                id: column_id,
            });
        }
        let local = name.to_string();
        self.view.edit_field(
            FieldKey::new(EQUIPMENT_COLUMNS, column_id, "name"),
            Value::from(name),
            move |state| {
                if let Some(column) = state.columns.iter_mut().find(|c| c.id == column_id) {
                    column.name = local.clone();
                }
            },
        );
        Ok(())
    }

    pub fn update_cell(&self, cell_id: RowId, value: &str) -> Result<()> {
        if !self.view.read(|state| state.cells.iter().any(|c| c.id == cell_id)) {
            return Err(HoldbackError::RowNotFound {
                table: EQUIPMENT_CELLS.to_string(),
                id: cell_id,
            });
        }
        let local = value.to_string();
        self.view.edit_field(
            FieldKey::new(EQUIPMENT_CELLS, cell_id, "value"),
            Value::from(value),
            move |state| {
                if let Some(cell) = state.cells.iter_mut().find(|c| c.id == cell_id) {
                    cell.value = local.clone();
                }
            },
        );
        Ok(())
    }

    /// Save pending edits and release the subscription.
    pub async fn close(self) {
        self.view.close().await;
    }

    fn known_type<T>(&self, type_id: RowId, pick: impl Fn(&EquipmentState, RowId) -> T) -> Result<T> {
        self.view.read(|state| {
            if state.types.iter().any(|t| t.id == type_id) {
                Ok(pick(state, type_id))
            } else {
                Err(HoldbackError::TypeNotFound(type_id))
            }
        })
    }
}

fn single<T: serde::de::DeserializeOwned>(records: Vec<Record>) -> Result<T> {
    decode::<T>(records)?
        .into_iter()
        .next()
        .ok_or(HoldbackError::MissingId)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> Option<Timestamp> {
        Some(s.parse().unwrap())
    }

    fn state() -> EquipmentState {
        EquipmentState {
            types: vec![
                EquipmentType {
                    id: 1,
                    name: "Pumps".to_string(),
                    created_at: ts("2024-01-01T00:00:00Z"),
                },
                EquipmentType {
                    id: 2,
                    name: "Fans".to_string(),
                    created_at: ts("2024-01-02T00:00:00Z"),
                },
            ],
            columns: vec![
                EquipmentColumn {
                    id: 10,
                    type_id: 1,
                    name: "Model".to_string(),
                    created_at: ts("2024-01-01T00:00:01Z"),
                },
                EquipmentColumn {
                    id: 11,
                    type_id: 1,
                    name: "Serial".to_string(),
                    created_at: ts("2024-01-01T00:00:02Z"),
                },
            ],
            rows: vec![EquipmentRow {
                id: 20,
                type_id: 1,
                created_at: ts("2024-01-01T00:00:03Z"),
            }],
            cells: vec![
                EquipmentCell {
                    id: 31,
                    row_id: 20,
                    column_id: 11,
                    value: "SN-1".to_string(),
                    created_at: ts("2024-01-01T00:00:05Z"),
                },
                EquipmentCell {
                    id: 30,
                    row_id: 20,
                    column_id: 10,
                    value: "P-100".to_string(),
                    created_at: ts("2024-01-01T00:00:04Z"),
                },
            ],
        }
    }

    #[test]
    fn test_groups_follow_type_order_and_sort_cells() {
        let groups = state().groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].kind.name, "Pumps");
        assert_eq!(groups[0].columns.len(), 2);
        let values: Vec<&str> = groups[0].rows[0]
            .cells
            .iter()
            .map(|c| c.value.as_str())
            .collect();
        assert_eq!(values, vec!["P-100", "SN-1"]);
        assert!(groups[1].rows.is_empty());
    }

    #[test]
    fn test_cell_keys_filter() {
        let keys = state().cell_keys(|c| c.column_id == 10);
        assert_eq!(keys, vec![EchoKey::row(EQUIPMENT_CELLS, 30)]);
    }
}
