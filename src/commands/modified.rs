use serde_json::json;

use crate::commands::{OutputOptions, Session, print_json};
use crate::display::modified_line;
use crate::error::Result;
use crate::model::modified::latest_modified;
use crate::model::tables::MODIFIED_TABLES;

/// Print the newest change across the dashboard tables
pub async fn cmd_modified(session: &Session, output: OutputOptions) -> Result<()> {
    let latest = latest_modified(session.backend.as_ref(), &MODIFIED_TABLES).await?;
    if output.json {
        print_json(&json!(latest.as_ref().map(|m| json!({
            "table": m.table,
            "updatedAt": m.updated_at.to_string(),
        }))))?;
    } else {
        println!("{}", modified_line(latest.as_ref()));
    }
    Ok(())
}
