use jiff::Zoned;
use owo_colors::OwoColorize;
use tokio::sync::broadcast::error::RecvError;

use crate::commands::Session;
use crate::display::{modified_line, projects_table};
use crate::error::Result;
use crate::model::{CategoryBoard, CategoryKind, EquipmentBoard, ModifiedTracker, ProjectBoard};
use crate::sync::ViewEvent;

fn describe(source: &str, event: &ViewEvent) -> Option<String> {
    match event {
        ViewEvent::Reconciled => Some(format!("{} refreshed", source.cyan())),
        ViewEvent::WriteFailed { key, error } => {
            Some(format!("{} could not save {key}: {error}", source.red()))
        }
        ViewEvent::Toast { success, message } => Some(if *success {
            message.green().to_string()
        } else {
            message.red().to_string()
        }),
        ViewEvent::LocalEdit => None,
    }
}

fn report(source: &str, event: std::result::Result<ViewEvent, RecvError>) -> bool {
    match event {
        Ok(event) => {
            if let Some(line) = describe(source, &event) {
                println!("{line}");
            }
            true
        }
        Err(RecvError::Lagged(skipped)) => {
            tracing::debug!("{source}: skipped {skipped} notifications");
            true
        }
        Err(RecvError::Closed) => false,
    }
}

/// Follow every dataset and print what changes until interrupted
pub async fn cmd_watch(session: &Session) -> Result<()> {
    let backend = &session.backend;
    let projects = ProjectBoard::open(backend.clone(), session.options).await?;
    let construction =
        CategoryBoard::open(backend.clone(), CategoryKind::Construction, session.options).await?;
    let inspection =
        CategoryBoard::open(backend.clone(), CategoryKind::Inspection, session.options).await?;
    let equipment = EquipmentBoard::open(backend.clone(), session.options).await?;
    let modified = ModifiedTracker::open(backend.clone(), session.options).await?;

    println!("{}", projects_table(&projects.projects(), Zoned::now().date()));
    println!("{}", modified_line(modified.latest().as_ref()));
    println!("{}", "Watching for changes, Ctrl-C to stop".dimmed());

    let mut project_events = projects.view().events();
    let mut construction_events = construction.view().events();
    let mut inspection_events = inspection.view().events();
    let mut equipment_events = equipment.view().events();
    let mut modified_events = modified.view().events();

    loop {
        let open = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = project_events.recv() => report("projects", event),
            event = construction_events.recv() => report("construction", event),
            event = inspection_events.recv() => report("inspection", event),
            event = equipment_events.recv() => report("equipment", event),
            event = modified_events.recv() => {
                let open = !matches!(event, Err(RecvError::Closed));
                if let Ok(ViewEvent::Reconciled) = event {
                    println!("{}", modified_line(modified.latest().as_ref()));
                }
                open
            }
        };
        if !open {
            break;
        }
    }

    projects.close().await;
    construction.close().await;
    inspection.close().await;
    equipment.close().await;
    Ok(())
}
