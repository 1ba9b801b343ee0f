use clap::Subcommand;
use serde_json::json;

use crate::backend::field;
use crate::commands::{OutputOptions, Session, print_json};
use crate::display::equipment_table;
use crate::error::Result;
use crate::model::EquipmentBoard;
use crate::model::tables::{EQUIPMENT_CELLS, EQUIPMENT_COLUMNS};

#[derive(Debug, Subcommand)]
pub enum EquipmentAction {
    /// List equipment types with their grids
    Ls,
    /// Add an equipment type with one column, one row and one empty cell
    AddType { name: String },
    /// Append a row to a type
    AddRow { type_id: i64 },
    /// Delete a row; the type goes with its last row
    RmRow { row: i64 },
    /// Add a column to a type (at most 7)
    AddColumn {
        type_id: i64,
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete a column and its cells
    RmColumn { column: i64 },
    /// Rename a column
    RenameColumn { column: i64, name: String },
    /// Set a cell value
    SetCell { cell: i64, value: String },
}

pub async fn cmd_equipment(
    session: &Session,
    action: EquipmentAction,
    output: OutputOptions,
) -> Result<()> {
    let board = EquipmentBoard::open(session.backend.clone(), session.options).await?;
    let view = board.view();

    match action {
        EquipmentAction::Ls => {
            let groups = board.groups();
            if output.json {
                let groups: Vec<serde_json::Value> = groups
                    .iter()
                    .map(|g| {
                        json!({
                            "id": g.kind.id,
                            "name": g.kind.name,
                            "canAddColumn": board.can_add_column(g.kind.id),
                            "columns": g.columns.iter().map(|c| json!({"id": c.id, "name": c.name})).collect::<Vec<_>>(),
                            "rows": g.rows.iter().map(|r| json!({
                                "id": r.row.id,
                                "cells": r.cells.iter().map(|c| json!({"id": c.id, "columnId": c.column_id, "value": c.value})).collect::<Vec<_>>(),
                            })).collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                print_json(&json!(groups))?;
            } else if groups.is_empty() {
                println!("No equipment types.");
            } else {
                for group in groups.iter() {
                    let table = equipment_table(group, true, board.can_add_column(group.kind.id));
                    println!("{table}\n");
                }
            }
        }
        EquipmentAction::AddType { name } => {
            let id = board.add_type(&name).await?;
            println!("Added equipment type {id}");
        }
        EquipmentAction::AddRow { type_id } => {
            let row = board.add_row(type_id).await?;
            println!("Added row {row}");
        }
        EquipmentAction::RmRow { row } => {
            if board.delete_row(row).await? {
                println!("Deleted row {row} and its now empty equipment type");
            } else {
                println!("Deleted row {row}");
            }
        }
        EquipmentAction::AddColumn { type_id, name } => {
            let column = board.add_column(type_id, name.as_deref()).await?;
            println!("Added column {column}");
        }
        EquipmentAction::RmColumn { column } => {
            board.delete_column(column).await?;
            println!("Deleted column {column}");
        }
        EquipmentAction::RenameColumn { column, name } => {
            view.update_now(EQUIPMENT_COLUMNS, column, field("name", name))
                .await?;
            println!("Renamed column {column}");
        }
        EquipmentAction::SetCell { cell, value } => {
            view.update_now(EQUIPMENT_CELLS, cell, field("value", value))
                .await?;
            println!("Updated cell {cell}");
        }
    }

    board.close().await;
    Ok(())
}
