//! Terminal rendering of the dashboard datasets.

use jiff::civil::Date;
use owo_colors::OwoColorize;
use tabled::builder::Builder;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::model::category::Section;
use crate::model::equipment::EquipmentGroup;
use crate::model::{QuotedProject, TableModified, Urgency};

#[derive(Tabled)]
struct ProjectRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Quotation Ref")]
    quotation_ref: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Location")]
    location: String,
    #[tabled(rename = "Closing Date")]
    closing_date: String,
    #[tabled(rename = "Time")]
    closing_time: String,
    #[tabled(rename = "Days Left")]
    days_left: String,
}

pub fn paint_urgency(text: &str, urgency: Urgency) -> String {
    match urgency {
        Urgency::Red => text.red().to_string(),
        Urgency::Yellow => text.yellow().to_string(),
        Urgency::Green => text.green().to_string(),
    }
}

/// Projects table, days-left cell coloured by urgency
pub fn projects_table(projects: &[QuotedProject], today: Date) -> String {
    if projects.is_empty() {
        return "No quoted projects.".to_string();
    }
    let rows: Vec<ProjectRow> = projects
        .iter()
        .map(|p| {
            let days = p
                .days_left(today)
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string());
            ProjectRow {
                id: p.id,
                quotation_ref: p.quotation_ref.clone(),
                name: p.name.clone(),
                location: p.location.clone(),
                closing_date: p
                    .closing_date
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                closing_time: p.closing_time.clone(),
                days_left: paint_urgency(&days, p.urgency(today)),
            }
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    table.to_string()
}

/// One section as a heading plus its grid, cell ids in brackets
pub fn section_table(section: &Section, expanded: bool) -> String {
    let heading = format!("{} {}", format!("[{}]", section.id).cyan(), section.header.bold());
    if !expanded {
        return format!("{heading} ({} rows)", section.rows.len());
    }
    let mut builder = Builder::default();
    builder.push_record(
        std::iter::once("#".to_string())
            .chain(section.columns.iter().map(|c| format!("{} [{}]", c.name, c.id))),
    );
    for row in &section.rows {
        builder.push_record(
            std::iter::once(format!("{} [{}]", row.row_number, row.id)).chain(
                row.cells.iter().map(|cell| match cell.id {
                    Some(id) => format!("{} [{id}]", cell.value),
                    None => "-".to_string(),
                }),
            ),
        );
    }
    let mut table = builder.build();
    table.with(Style::rounded());
    format!("{heading}\n{table}")
}

/// One equipment type as a heading plus its grid
pub fn equipment_table(group: &EquipmentGroup, expanded: bool, can_add_column: bool) -> String {
    let mut heading = format!(
        "{} {}",
        format!("[{}]", group.kind.id).cyan(),
        group.kind.name.bold()
    );
    if !can_add_column {
        heading.push_str(&format!(" {}", "(column limit reached)".dimmed()));
    }
    if !expanded {
        return format!("{heading} ({} rows)", group.rows.len());
    }
    let mut builder = Builder::default();
    builder.push_record(
        std::iter::once("Row".to_string())
            .chain(group.columns.iter().map(|c| format!("{} [{}]", c.name, c.id))),
    );
    for row in &group.rows {
        builder.push_record(
            std::iter::once(row.row.id.to_string())
                .chain(row.cells.iter().map(|c| format!("{} [{}]", c.value, c.id))),
        );
    }
    let mut table = builder.build();
    table.with(Style::rounded());
    format!("{heading}\n{table}")
}

pub fn modified_line(latest: Option<&TableModified>) -> String {
    match latest {
        Some(m) => format!("Last modified {} ({})", m.updated_at, m.table.dimmed()),
        None => "No updates found in any table".to_string(),
    }
}
