use clap::Subcommand;
use jiff::Zoned;
use serde_json::json;

use crate::backend::field;
use crate::commands::{OutputOptions, Session, print_json};
use crate::display::projects_table;
use crate::error::Result;
use crate::model::tables::QUOTED_PROJECTS;
use crate::model::{ProjectBoard, ProjectField, QuotedProject};

#[derive(Debug, Subcommand)]
pub enum ProjectAction {
    /// List projects by closing date
    Ls,
    /// Add a blank project closing today at noon
    Add,
    /// Set one field of a project
    Set {
        id: i64,
        /// ref, name, location, date or time
        field: ProjectField,
        value: String,
    },
    /// Delete a project
    Rm { id: i64 },
}

fn project_json(project: &QuotedProject, today: jiff::civil::Date) -> serde_json::Value {
    json!({
        "id": project.id,
        "quotationRef": project.quotation_ref,
        "name": project.name,
        "location": project.location,
        "closingDate": project.closing_date.map(|d| d.to_string()),
        "closingTime": project.closing_time,
        "daysLeft": project.days_left(today),
    })
}

pub async fn cmd_projects(
    session: &Session,
    action: ProjectAction,
    output: OutputOptions,
) -> Result<()> {
    let board = ProjectBoard::open(session.backend.clone(), session.options).await?;
    let today = Zoned::now().date();

    match action {
        ProjectAction::Ls => {
            let projects = board.projects();
            if output.json {
                print_json(&json!(
                    projects
                        .iter()
                        .map(|p| project_json(p, today))
                        .collect::<Vec<_>>()
                ))?;
            } else {
                println!("{}", projects_table(&projects, today));
            }
        }
        ProjectAction::Add => {
            let project = board.add_project(today).await?;
            if output.json {
                print_json(&project_json(&project, today))?;
            } else {
                println!("Added project {}", project.id);
            }
        }
        ProjectAction::Set { id, field: name, value } => {
            // One-shot runs save right away instead of waiting out the window
            let normalized = name.parse_value(&value)?;
            board
                .view()
                .update_now(QUOTED_PROJECTS, id, field(name.column(), normalized))
                .await?;
            println!("Updated {name} of project {id}");
        }
        ProjectAction::Rm { id } => {
            board.delete_project(id).await?;
            println!("Deleted project {id}");
        }
    }

    board.close().await;
    Ok(())
}
