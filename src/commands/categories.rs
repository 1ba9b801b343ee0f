use clap::Subcommand;
use serde_json::json;

use crate::backend::field;
use crate::commands::{OutputOptions, Session, print_json};
use crate::display::section_table;
use crate::error::Result;
use crate::model::tables::{CATEGORIES, CATEGORY_DATA_VALUES, COLUMN_DEFINITIONS};
use crate::model::{CategoryBoard, CategoryKind, Section};

#[derive(Debug, Subcommand)]
pub enum CategoryAction {
    /// List sections with their grids
    Ls,
    /// Add a section with one column, one row and one empty cell
    Add { header: Option<String> },
    /// Delete a section
    Rm { section: i64 },
    /// Rename a section
    Rename { section: i64, header: String },
    /// Append a row to a section
    AddRow { section: i64 },
    /// Delete a row of a section
    RmRow { section: i64, row: i64 },
    /// Add a column to a section (at most 3)
    AddColumn { section: i64 },
    /// Remove the last column of a section
    RmColumn { section: i64 },
    /// Rename a column
    RenameColumn { column: i64, name: String },
    /// Set a cell value
    SetCell { cell: i64, value: String },
}

fn section_json(section: &Section) -> serde_json::Value {
    json!({
        "id": section.id,
        "header": section.header,
        "columns": section.columns.iter().map(|c| json!({"id": c.id, "name": c.name})).collect::<Vec<_>>(),
        "rows": section.rows.iter().map(|r| json!({
            "id": r.id,
            "rowNumber": r.row_number,
            "cells": r.cells.iter().map(|c| json!({"id": c.id, "value": c.value})).collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
    })
}

pub async fn cmd_categories(
    session: &Session,
    kind: CategoryKind,
    action: CategoryAction,
    output: OutputOptions,
) -> Result<()> {
    let board = CategoryBoard::open(session.backend.clone(), kind, session.options).await?;
    let view = board.view();

    match action {
        CategoryAction::Ls => {
            let sections = board.sections();
            if output.json {
                print_json(&json!(sections.iter().map(section_json).collect::<Vec<_>>()))?;
            } else if sections.is_empty() {
                println!("No {kind} sections.");
            } else {
                for section in &sections {
                    println!("{}\n", section_table(section, true));
                }
            }
        }
        CategoryAction::Add { header } => {
            let id = board.add_section(header.as_deref()).await?;
            println!("Added section {id}");
        }
        CategoryAction::Rm { section } => {
            board.delete_section(section).await?;
            println!("Deleted section {section}");
        }
        CategoryAction::Rename { section, header } => {
            board.section(section)?;
            view.update_now(CATEGORIES, section, field("header", header))
                .await?;
            println!("Renamed section {section}");
        }
        CategoryAction::AddRow { section } => {
            let row = board.add_row(section).await?;
            println!("Added row {row} to section {section}");
        }
        CategoryAction::RmRow { section, row } => {
            board.delete_row(section, row).await?;
            println!("Deleted row {row}");
        }
        CategoryAction::AddColumn { section } => {
            let column = board.add_column(section).await?;
            println!("Added column {column} to section {section}");
        }
        CategoryAction::RmColumn { section } => {
            board.delete_column(section).await?;
            println!("Removed last column of section {section}");
        }
        CategoryAction::RenameColumn { column, name } => {
            view.update_now(COLUMN_DEFINITIONS, column, field("column_name", name))
                .await?;
            println!("Renamed column {column}");
        }
        CategoryAction::SetCell { cell, value } => {
            view.update_now(CATEGORY_DATA_VALUES, cell, field("value", value))
                .await?;
            println!("Updated cell {cell}");
        }
    }

    board.close().await;
    Ok(())
}
