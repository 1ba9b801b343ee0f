//! Construction and inspection category sections.
//!
//! A section is a small spreadsheet: a header, up to three named columns and
//! numbered rows holding one text cell per column.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{Backend, Query, Record, RowId, Topic, decode, encode};
use crate::error::{HoldbackError, Result};
use crate::sync::{Dataset, EchoKey, FieldKey, SyncedView, ViewOptions};

use super::null_as_default;
use super::tables::{CATEGORIES, CATEGORY_DATA, CATEGORY_DATA_VALUES, COLUMN_DEFINITIONS};
use super::MAX_SECTION_COLUMNS;

pub const NEW_SECTION_HEADER: &str = "New Section";
pub const FIRST_COLUMN_NAME: &str = "Column 1";
pub const NEW_COLUMN_NAME: &str = "New Column";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryKind {
    Construction,
    Inspection,
}

impl CategoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CategoryKind::Construction => "construction",
            CategoryKind::Inspection => "inspection",
        }
    }
}

impl fmt::Display for CategoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CategoryKind {
    type Err = HoldbackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "construction" => Ok(CategoryKind::Construction),
            "inspection" => Ok(CategoryKind::Inspection),
            _ => Err(HoldbackError::InvalidValue {
                field: "type".to_string(),
                reason: format!("unknown category kind '{s}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRecord {
    id: RowId,
    #[serde(default, deserialize_with = "null_as_default")]
    header: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ColumnRecord {
    id: RowId,
    #[serde(default, deserialize_with = "null_as_default")]
    column_name: String,
    #[serde(default)]
    column_order: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RowRecord {
    id: RowId,
    #[serde(default)]
    row_number: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ValueRecord {
    id: RowId,
    #[serde(default)]
    category_data_id: Option<RowId>,
    #[serde(default)]
    column_definition_id: Option<RowId>,
    #[serde(default, deserialize_with = "null_as_default")]
    value: String,
}

#[derive(Serialize)]
struct NewCategory<'a> {
    #[serde(rename = "type")]
    kind: CategoryKind,
    header: &'a str,
    date_added: String,
}

#[derive(Serialize)]
struct NewColumn<'a> {
    category_id: RowId,
    column_name: &'a str,
    column_order: i64,
}

#[derive(Serialize)]
struct NewRow {
    category_id: RowId,
    row_number: i64,
}

#[derive(Serialize)]
struct NewValue<'a> {
    category_data_id: RowId,
    column_definition_id: RowId,
    value: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub id: RowId,
    pub name: String,
    pub order: i64,
}

/// One cell; `id` is `None` when the store has no value row for the column
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub id: Option<RowId>,
    pub column_id: RowId,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectionRow {
    pub id: RowId,
    pub row_number: i64,
    /// Aligned with the section's columns
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub id: RowId,
    pub header: String,
    pub columns: Vec<Column>,
    pub rows: Vec<SectionRow>,
}

impl Section {
    fn next_row_number(&self) -> i64 {
        self.rows.iter().map(|r| r.row_number).max().unwrap_or(0) + 1
    }

    fn next_column_order(&self) -> i64 {
        self.columns.iter().map(|c| c.order).max().unwrap_or(0) + 1
    }

    /// Echo keys of every row the store removes along with this section
    fn dependents(&self) -> Vec<EchoKey> {
        let mut keys: Vec<EchoKey> = self
            .columns
            .iter()
            .map(|c| EchoKey::row(COLUMN_DEFINITIONS, c.id))
            .collect();
        for row in &self.rows {
            keys.push(EchoKey::row(CATEGORY_DATA, row.id));
            keys.extend(row_cell_keys(row));
        }
        keys
    }

    fn find_cell_mut(&mut self, cell_id: RowId) -> Option<&mut Cell> {
        self.rows
            .iter_mut()
            .flat_map(|r| r.cells.iter_mut())
            .find(|c| c.id == Some(cell_id))
    }
}

fn row_cell_keys(row: &SectionRow) -> impl Iterator<Item = EchoKey> + '_ {
    row.cells
        .iter()
        .filter_map(|c| c.id)
        .map(|id| EchoKey::row(CATEGORY_DATA_VALUES, id))
}

fn cells_from(values: Vec<ValueRecord>, columns: &[Column]) -> Vec<Cell> {
    columns
        .iter()
        .map(|column| {
            values
                .iter()
                .find(|v| v.column_definition_id == Some(column.id))
                .map(|v| Cell {
                    id: Some(v.id),
                    column_id: column.id,
                    value: v.value.clone(),
                })
                .unwrap_or(Cell {
                    id: None,
                    column_id: column.id,
                    value: String::new(),
                })
        })
        .collect()
}

fn section_mut(sections: &mut [Section], id: RowId) -> Option<&mut Section> {
    sections.iter_mut().find(|s| s.id == id)
}

/// All sections of one category kind
pub struct CategoryDataset {
    kind: CategoryKind,
    name: String,
}

impl CategoryDataset {
    pub fn new(kind: CategoryKind) -> Self {
        Self {
            kind,
            name: format!("{kind} categories"),
        }
    }

    pub fn kind(&self) -> CategoryKind {
        self.kind
    }

    async fn fetch_section(backend: &dyn Backend, category: CategoryRecord) -> Result<Section> {
        let column_query = Query::table(COLUMN_DEFINITIONS)
            .eq("category_id", category.id)
            .order("column_order", true);
        let row_query = Query::table(CATEGORY_DATA)
            .eq("category_id", category.id)
            .order("row_number", true);
        let (columns, rows) =
            futures::try_join!(backend.select(&column_query), backend.select(&row_query))?;
        let columns: Vec<Column> = decode::<ColumnRecord>(columns)?
            .into_iter()
            .enumerate()
            .map(|(i, c)| Column {
                id: c.id,
                name: c.column_name,
                order: c.column_order.unwrap_or(i as i64 + 1),
            })
            .collect();
        let rows: Vec<RowRecord> = decode(rows)?;

        let values = try_join_all(rows.iter().map(|row| {
            let query = Query::table(CATEGORY_DATA_VALUES).eq("category_data_id", row.id);
            async move { backend.select(&query).await }
        }))
        .await?;

        let rows = rows
            .into_iter()
            .zip(values)
            .enumerate()
            .map(|(i, (row, values))| {
                Ok(SectionRow {
                    id: row.id,
                    row_number: row.row_number.unwrap_or(i as i64 + 1),
                    cells: cells_from(decode(values)?, &columns),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Section {
            id: category.id,
            header: category.header,
            columns,
            rows,
        })
    }
}

#[async_trait]
impl Dataset for CategoryDataset {
    type State = Vec<Section>;

    fn name(&self) -> &str {
        &self.name
    }

    fn topics(&self) -> Vec<Topic> {
        [CATEGORIES, COLUMN_DEFINITIONS, CATEGORY_DATA, CATEGORY_DATA_VALUES]
            .into_iter()
            .map(Topic::all)
            .collect()
    }

    async fn fetch(&self, backend: &dyn Backend) -> Result<Self::State> {
        let categories: Vec<CategoryRecord> = decode(
            backend
                .select(
                    &Query::table(CATEGORIES)
                        .eq("type", self.kind.as_str())
                        .order("date_added", true),
                )
                .await?,
        )?;
        try_join_all(
            categories
                .into_iter()
                .map(|category| Self::fetch_section(backend, category)),
        )
        .await
    }
}

/// Sections of one category kind kept in sync with the store
pub struct CategoryBoard {
    view: SyncedView<CategoryDataset>,
    expanded: Mutex<HashSet<RowId>>,
}

impl CategoryBoard {
    pub async fn open(
        backend: Arc<dyn Backend>,
        kind: CategoryKind,
        options: ViewOptions,
    ) -> Result<Self> {
        Ok(Self {
            view: SyncedView::open(backend, CategoryDataset::new(kind), options).await?,
            expanded: Mutex::new(HashSet::new()),
        })
    }

    pub fn view(&self) -> &SyncedView<CategoryDataset> {
        &self.view
    }

    pub fn kind(&self) -> CategoryKind {
        self.view.dataset().kind()
    }

    pub fn sections(&self) -> Vec<Section> {
        self.view.snapshot()
    }

    pub fn section(&self, id: RowId) -> Result<Section> {
        self.view
            .read(|sections| sections.iter().find(|s| s.id == id).cloned())
            .ok_or(HoldbackError::SectionNotFound(id))
    }

    pub fn is_expanded(&self, id: RowId) -> bool {
        self.expanded.lock().contains(&id)
    }

    /// Flip a section open or closed; returns the new state
    pub fn toggle_expanded(&self, id: RowId) -> bool {
        let mut expanded = self.expanded.lock();
        if expanded.remove(&id) {
            false
        } else {
            expanded.insert(id);
            true
        }
    }

    /// Create a section with one column, one row and one empty cell.
    pub async fn add_section(&self, header: Option<&str>) -> Result<RowId> {
        let _hold = self.view.hold_refetches().await;
        let header = header.unwrap_or(NEW_SECTION_HEADER);
        let category = encode(&NewCategory {
            kind: self.kind(),
            header,
            date_added: jiff::Timestamp::now().to_string(),
        })?;
        let id = first_id(self.view.insert(CATEGORIES, vec![category]).await?)?;

        match self.fill_new_section(id).await {
            Ok((column, row)) => {
                let section = Section {
                    id,
                    header: header.to_string(),
                    columns: vec![column],
                    rows: vec![row],
                };
                self.view.apply_local(move |sections| sections.push(section));
                self.expanded.lock().insert(id);
                tracing::info!("added {} section {id}", self.kind());
                Ok(id)
            }
            Err(e) => {
                // Leave no half-built section behind
                if let Err(cleanup) = self.view.delete(CATEGORIES, id, Vec::new()).await {
                    tracing::warn!("could not remove partial section {id}: {cleanup}");
                }
                Err(e)
            }
        }
    }

    async fn fill_new_section(&self, category_id: RowId) -> Result<(Column, SectionRow)> {
        let column_id = first_id(
            self.view
                .insert(
                    COLUMN_DEFINITIONS,
                    vec![encode(&NewColumn {
                        category_id,
                        column_name: FIRST_COLUMN_NAME,
                        column_order: 1,
                    })?],
                )
                .await?,
        )?;
        let row_id = first_id(
            self.view
                .insert(
                    CATEGORY_DATA,
                    vec![encode(&NewRow {
                        category_id,
                        row_number: 1,
                    })?],
                )
                .await?,
        )?;
        let cell_id = first_id(
            self.view
                .insert(
                    CATEGORY_DATA_VALUES,
                    vec![encode(&NewValue {
                        category_data_id: row_id,
                        column_definition_id: column_id,
                        value: "",
                    })?],
                )
                .await?,
        )?;
        Ok((
            Column {
                id: column_id,
                name: FIRST_COLUMN_NAME.to_string(),
                order: 1,
            },
            SectionRow {
                id: row_id,
                row_number: 1,
                cells: vec![Cell {
                    id: Some(cell_id),
                    column_id,
                    value: String::new(),
                }],
            },
        ))
    }

    pub async fn delete_section(&self, id: RowId) -> Result<()> {
        let _hold = self.view.hold_refetches().await;
        let section = self.section(id)?;
        self.view
            .delete(CATEGORIES, id, section.dependents())
            .await?;
        self.view.apply_local(|sections| sections.retain(|s| s.id != id));
        self.expanded.lock().remove(&id);
        Ok(())
    }

    pub fn rename_section(&self, id: RowId, header: &str) -> Result<()> {
        self.section(id)?;
        let local = header.to_string();
        self.view.edit_field(
            FieldKey::new(CATEGORIES, id, "header"),
            Value::from(header),
            move |sections| {
                if let Some(section) = section_mut(sections, id) {
                    section.header = local.clone();
                }
            },
        );
        Ok(())
    }

    /// Append a row with one empty cell per column.
    pub async fn add_row(&self, section_id: RowId) -> Result<RowId> {
        let _hold = self.view.hold_refetches().await;
        let section = self.section(section_id)?;
        let row_number = section.next_row_number();
        let row_id = first_id(
            self.view
                .insert(
                    CATEGORY_DATA,
                    vec![encode(&NewRow {
                        category_id: section_id,
                        row_number,
                    })?],
                )
                .await?,
        )?;
        let cells = self.insert_empty_cells(row_id, &section.columns).await?;
        let row = SectionRow {
            id: row_id,
            row_number,
            cells,
        };
        self.view.apply_local(move |sections| {
            if let Some(section) = section_mut(sections, section_id) {
                section.rows.push(row);
            }
        });
        Ok(row_id)
    }

    async fn insert_empty_cells(&self, row_id: RowId, columns: &[Column]) -> Result<Vec<Cell>> {
        let records = columns
            .iter()
            .map(|c| {
                encode(&NewValue {
                    category_data_id: row_id,
                    column_definition_id: c.id,
                    value: "",
                })
            })
            .collect::<Result<Vec<Record>>>()?;
        let inserted: Vec<ValueRecord> = decode(self.view.insert(CATEGORY_DATA_VALUES, records).await?)?;
        Ok(cells_from(inserted, columns))
    }

    pub async fn delete_row(&self, section_id: RowId, row_id: RowId) -> Result<()> {
        let _hold = self.view.hold_refetches().await;
        let section = self.section(section_id)?;
        let row = section
            .rows
            .iter()
            .find(|r| r.id == row_id)
            .ok_or_else(|| HoldbackError::RowNotFound {
                table: CATEGORY_DATA.to_string(),
                id: row_id,
            })?;
        self.view
            .delete(CATEGORY_DATA, row_id, row_cell_keys(row).collect())
            .await?;
        self.view.apply_local(|sections| {
            if let Some(section) = section_mut(sections, section_id) {
                section.rows.retain(|r| r.id != row_id);
            }
        });
        Ok(())
    }

    /// Add a column with an empty cell in every row.
    pub async fn add_column(&self, section_id: RowId) -> Result<RowId> {
        let _hold = self.view.hold_refetches().await;
        let section = self.section(section_id)?;
        if section.columns.len() >= MAX_SECTION_COLUMNS {
            return Err(HoldbackError::ColumnLimit(MAX_SECTION_COLUMNS));
        }
        let order = section.next_column_order();
        let column_id = first_id(
            self.view
                .insert(
                    COLUMN_DEFINITIONS,
                    vec![encode(&NewColumn {
                        category_id: section_id,
                        column_name: NEW_COLUMN_NAME,
                        column_order: order,
                    })?],
                )
                .await?,
        )?;
        let column = Column {
            id: column_id,
            name: NEW_COLUMN_NAME.to_string(),
            order,
        };

        let records = section
            .rows
            .iter()
            .map(|row| {
                encode(&NewValue {
                    category_data_id: row.id,
                    column_definition_id: column_id,
                    value: "",
                })
            })
            .collect::<Result<Vec<Record>>>()?;
        let inserted: Vec<ValueRecord> = decode(self.view.insert(CATEGORY_DATA_VALUES, records).await?)?;

        self.view.apply_local(move |sections| {
            if let Some(section) = section_mut(sections, section_id) {
                section.columns.push(column);
                for row in &mut section.rows {
                    let cell = inserted
                        .iter()
                        .find(|v| v.category_data_id == Some(row.id))
                        .map(|v| v.id);
                    row.cells.push(Cell {
                        id: cell,
                        column_id,
                        value: String::new(),
                    });
                }
            }
        });
        Ok(column_id)
    }

    /// Remove the last column of a section.
    pub async fn delete_column(&self, section_id: RowId) -> Result<()> {
        let _hold = self.view.hold_refetches().await;
        let section = self.section(section_id)?;
        if section.columns.len() <= 1 {
            return Err(HoldbackError::LastColumn);
        }
        let Some(column) = section.columns.last() else {
            return Err(HoldbackError::LastColumn);
        };
        let column_id = column.id;
        let cascaded = section
            .rows
            .iter()
            .flat_map(|r| r.cells.iter())
            .filter(|c| c.column_id == column_id)
            .filter_map(|c| c.id)
            .map(|id| EchoKey::row(CATEGORY_DATA_VALUES, id))
            .collect();
        self.view
            .delete(COLUMN_DEFINITIONS, column_id, cascaded)
            .await?;
        self.view.apply_local(|sections| {
            if let Some(section) = section_mut(sections, section_id) {
                section.columns.retain(|c| c.id != column_id);
                for row in &mut section.rows {
                    row.cells.retain(|c| c.column_id != column_id);
                }
            }
        });
        Ok(())
    }

    pub fn rename_column(&self, column_id: RowId, name: &str) -> Result<()> {
        let known = self.view.read(|sections| {
            sections
                .iter()
                .any(|s| s.columns.iter().any(|c| c.id == column_id))
        });
        if !known {
            return Err(HoldbackError::RowNotFound {
                table: COLUMN_DEFINITIONS.to_string(),
                id: column_id,
            });
        }
        let local = name.to_string();
        self.view.edit_field(
            FieldKey::new(COLUMN_DEFINITIONS, column_id, "column_name"),
            Value::from(name),
            move |sections| {
                for section in sections.iter_mut() {
                    if let Some(column) = section.columns.iter_mut().find(|c| c.id == column_id) {
                        column.name = local.clone();
                    }
                }
            },
        );
        Ok(())
    }

    pub fn update_cell(&self, cell_id: RowId, value: &str) -> Result<()> {
        let known = self.view.read(|sections| {
            sections.iter().any(|s| {
                s.rows
                    .iter()
                    .any(|r| r.cells.iter().any(|c| c.id == Some(cell_id)))
            })
        });
        if !known {
            return Err(HoldbackError::RowNotFound {
                table: CATEGORY_DATA_VALUES.to_string(),
                id: cell_id,
            });
        }
        let local = value.to_string();
        self.view.edit_field(
            FieldKey::new(CATEGORY_DATA_VALUES, cell_id, "value"),
            Value::from(value),
            move |sections| {
                for section in sections.iter_mut() {
                    if let Some(cell) = section.find_cell_mut(cell_id) {
                        cell.value = local.clone();
                    }
                }
            },
        );
        Ok(())
    }

    /// Save pending edits and release the subscription.
    pub async fn close(self) {
        self.view.close().await;
    }
}

fn first_id(records: Vec<Record>) -> Result<RowId> {
    records
        .first()
        .ok_or(HoldbackError::MissingId)
        .and_then(crate::backend::record_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(id: RowId) -> Column {
        Column {
            id,
            name: format!("c{id}"),
            order: id,
        }
    }

    #[test]
    fn test_kind_round_trip() {
        assert_eq!("Inspection".parse::<CategoryKind>().unwrap(), CategoryKind::Inspection);
        assert_eq!(CategoryKind::Construction.to_string(), "construction");
        assert!("plumbing".parse::<CategoryKind>().is_err());
    }

    #[test]
    fn test_cells_align_with_columns() {
        let values = vec![
            ValueRecord {
                id: 11,
                category_data_id: Some(4),
                column_definition_id: Some(2),
                value: "b".to_string(),
            },
            ValueRecord {
                id: 10,
                category_data_id: Some(4),
                column_definition_id: Some(1),
                value: "a".to_string(),
            },
        ];
        let cells = cells_from(values, &[column(1), column(2), column(3)]);
        let rendered: Vec<(Option<RowId>, &str)> =
            cells.iter().map(|c| (c.id, c.value.as_str())).collect();
        assert_eq!(rendered, vec![(Some(10), "a"), (Some(11), "b"), (None, "")]);
    }

    #[test]
    fn test_section_dependents_cover_columns_rows_and_cells() {
        let section = Section {
            id: 1,
            header: "Scaffolding".to_string(),
            columns: vec![column(5)],
            rows: vec![SectionRow {
                id: 8,
                row_number: 1,
                cells: vec![Cell {
                    id: Some(13),
                    column_id: 5,
                    value: String::new(),
                }],
            }],
        };
        assert_eq!(
            section.dependents(),
            vec![
                EchoKey::row(COLUMN_DEFINITIONS, 5),
                EchoKey::row(CATEGORY_DATA, 8),
                EchoKey::row(CATEGORY_DATA_VALUES, 13),
            ]
        );
        assert_eq!(section.next_row_number(), 2);
        assert_eq!(section.next_column_order(), 6);
    }
}
