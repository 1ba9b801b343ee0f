//! Quoted projects board.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use jiff::civil::{Date, Time};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::backend::{Backend, Query, RowId, Topic, decode, encode};
use crate::error::{HoldbackError, Result};
use crate::sync::{Dataset, FieldKey, SyncedView, ViewOptions};

use super::null_as_default;
use super::tables::QUOTED_PROJECTS;

/// Closing time given to freshly added projects
pub const DEFAULT_CLOSING_TIME: &str = "12:00";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotedProject {
    pub id: RowId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub quotation_ref: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub location: String,
    #[serde(default, deserialize_with = "closing_date")]
    pub closing_date: Option<Date>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub closing_time: String,
}

/// The store keeps `closingDate` either as a date or as a full timestamp.
fn closing_date<'de, D>(deserializer: D) -> std::result::Result<Option<Date>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| parse_date(&s).ok()))
}

fn parse_date(raw: &str) -> Result<Date> {
    let raw = raw.trim();
    let day = raw.get(..10).unwrap_or(raw);
    day.parse::<Date>()
        .map_err(|e| HoldbackError::InvalidValue {
            field: "closingDate".to_string(),
            reason: e.to_string(),
        })
}

impl QuotedProject {
    /// Whole days from `today` until closing. Past dates are negative.
    pub fn days_left(&self, today: Date) -> Option<i64> {
        self.closing_date
            .map(|closing| closing.duration_since(today).as_secs() / 86_400)
    }

    pub fn urgency(&self, today: Date) -> Urgency {
        self.days_left(today)
            .map(Urgency::from_days)
            .unwrap_or(Urgency::Green)
    }

    fn set(&mut self, field: ProjectField, value: &Value) {
        let text = value.as_str().unwrap_or_default().to_string();
        match field {
            ProjectField::QuotationRef => self.quotation_ref = text,
            ProjectField::Name => self.name = text,
            ProjectField::Location => self.location = text,
            ProjectField::ClosingDate => self.closing_date = parse_date(&text).ok(),
            ProjectField::ClosingTime => self.closing_time = text,
        }
    }
}

/// Colour band of a project row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Red,
    Yellow,
    Green,
}

impl Urgency {
    pub fn from_days(days: i64) -> Self {
        match days {
            1..=10 => Urgency::Red,
            11..=20 => Urgency::Yellow,
            _ => Urgency::Green,
        }
    }
}

/// Editable columns of a quoted project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectField {
    QuotationRef,
    Name,
    Location,
    ClosingDate,
    ClosingTime,
}

pub const VALID_PROJECT_FIELDS: &[&str] = &["ref", "name", "location", "date", "time"];

impl ProjectField {
    /// Column name in the store
    pub fn column(self) -> &'static str {
        match self {
            ProjectField::QuotationRef => "quotationRef",
            ProjectField::Name => "name",
            ProjectField::Location => "location",
            ProjectField::ClosingDate => "closingDate",
            ProjectField::ClosingTime => "closingTime",
        }
    }

    /// Check and normalize a user-entered value
    pub fn parse_value(self, raw: &str) -> Result<Value> {
        match self {
            ProjectField::ClosingDate => Ok(Value::from(parse_date(raw)?.to_string())),
            ProjectField::ClosingTime => {
                let time = raw.trim().parse::<Time>().map_err(|e| HoldbackError::InvalidValue {
                    field: self.column().to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Value::from(time.strftime("%H:%M").to_string()))
            }
            _ => Ok(Value::from(raw)),
        }
    }
}

impl fmt::Display for ProjectField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.column())
    }
}

impl FromStr for ProjectField {
    type Err = HoldbackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ref" | "quotationref" | "quotation-ref" => Ok(ProjectField::QuotationRef),
            "name" => Ok(ProjectField::Name),
            "location" => Ok(ProjectField::Location),
            "date" | "closingdate" | "closing-date" => Ok(ProjectField::ClosingDate),
            "time" | "closingtime" | "closing-time" => Ok(ProjectField::ClosingTime),
            _ => Err(HoldbackError::UnknownField {
                table: QUOTED_PROJECTS.to_string(),
                field: s.to_string(),
            }),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewProject<'a> {
    quotation_ref: &'a str,
    name: &'a str,
    location: &'a str,
    closing_date: Date,
    closing_time: &'a str,
}

pub struct ProjectsDataset;

#[async_trait]
impl Dataset for ProjectsDataset {
    type State = Vec<QuotedProject>;

    fn name(&self) -> &str {
        "projects"
    }

    fn topics(&self) -> Vec<Topic> {
        vec![Topic::all(QUOTED_PROJECTS)]
    }

    async fn fetch(&self, backend: &dyn Backend) -> Result<Self::State> {
        let rows = backend
            .select(&Query::table(QUOTED_PROJECTS).order("closingDate", true))
            .await?;
        decode(rows)
    }
}

/// Quoted projects kept in sync with the store
pub struct ProjectBoard {
    view: SyncedView<ProjectsDataset>,
}

impl ProjectBoard {
    pub async fn open(backend: Arc<dyn Backend>, options: ViewOptions) -> Result<Self> {
        Ok(Self {
            view: SyncedView::open(backend, ProjectsDataset, options).await?,
        })
    }

    pub fn view(&self) -> &SyncedView<ProjectsDataset> {
        &self.view
    }

    /// Projects ordered by closing date; undated ones last.
    pub fn projects(&self) -> Vec<QuotedProject> {
        let mut projects = self.view.snapshot();
        projects.sort_by(|a, b| match (a.closing_date, b.closing_date) {
            (Some(x), Some(y)) => x.cmp(&y).then(a.id.cmp(&b.id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        });
        projects
    }

    pub fn get(&self, id: RowId) -> Option<QuotedProject> {
        self.view.read(|projects| projects.iter().find(|p| p.id == id).cloned())
    }

    /// Insert a blank project closing on `today` at noon.
    pub async fn add_project(&self, today: Date) -> Result<QuotedProject> {
        let _hold = self.view.hold_refetches().await;
        let record = encode(&NewProject {
            quotation_ref: "",
            name: "",
            location: "",
            closing_date: today,
            closing_time: DEFAULT_CLOSING_TIME,
        })?;
        let inserted = self.view.insert(QUOTED_PROJECTS, vec![record]).await?;
        let project = decode::<QuotedProject>(inserted)?
            .into_iter()
            .next()
            .ok_or(HoldbackError::MissingId)?;
        tracing::info!("added project {}", project.id);
        let local = project.clone();
        self.view.apply_local(move |projects| projects.push(local));
        Ok(project)
    }

    /// Edit one field now and save it once typing pauses.
    pub fn update_project(&self, id: RowId, field: ProjectField, raw: &str) -> Result<()> {
        if self.get(id).is_none() {
            return Err(HoldbackError::RowNotFound {
                table: QUOTED_PROJECTS.to_string(),
                id,
            });
        }
        let value = field.parse_value(raw)?;
        let local = value.clone();
        self.view.edit_field(
            FieldKey::new(QUOTED_PROJECTS, id, field.column()),
            value,
            move |projects| {
                if let Some(project) = projects.iter_mut().find(|p| p.id == id) {
                    project.set(field, &local);
                }
            },
        );
        Ok(())
    }

    pub async fn delete_project(&self, id: RowId) -> Result<()> {
        let _hold = self.view.hold_refetches().await;
        self.view.delete(QUOTED_PROJECTS, id, Vec::new()).await?;
        self.view.apply_local(|projects| projects.retain(|p| p.id != id));
        Ok(())
    }

    /// Save pending edits and release the subscription.
    pub async fn close(self) {
        self.view.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jiff::civil::date;
    use serde_json::json;

    fn project(closing: Option<Date>) -> QuotedProject {
        QuotedProject {
            id: 1,
            quotation_ref: String::new(),
            name: String::new(),
            location: String::new(),
            closing_date: closing,
            closing_time: DEFAULT_CLOSING_TIME.to_string(),
        }
    }

    #[test]
    fn test_urgency_bands() {
        assert_eq!(Urgency::from_days(0), Urgency::Green);
        assert_eq!(Urgency::from_days(1), Urgency::Red);
        assert_eq!(Urgency::from_days(10), Urgency::Red);
        assert_eq!(Urgency::from_days(11), Urgency::Yellow);
        assert_eq!(Urgency::from_days(20), Urgency::Yellow);
        assert_eq!(Urgency::from_days(21), Urgency::Green);
        assert_eq!(Urgency::from_days(-3), Urgency::Green);
    }

    #[test]
    fn test_days_left() {
        let today = date(2024, 5, 1);
        assert_eq!(project(Some(date(2024, 5, 11))).days_left(today), Some(10));
        assert_eq!(project(Some(date(2024, 4, 29))).days_left(today), Some(-2));
        assert_eq!(project(None).days_left(today), None);
        assert_eq!(project(Some(date(2024, 5, 15))).urgency(today), Urgency::Yellow);
    }

    #[test]
    fn test_decode_accepts_timestamps_and_nulls() {
        let p: QuotedProject = serde_json::from_value(json!({
            "id": 7,
            "quotationRef": null,
            "name": "Depot",
            "closingDate": "2024-06-30T00:00:00+00:00",
            "closingTime": "09:00",
            "updated_at": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(p.quotation_ref, "");
        assert_eq!(p.location, "");
        assert_eq!(p.closing_date, Some(date(2024, 6, 30)));
    }

    #[test]
    fn test_field_parsing() {
        assert_eq!("ref".parse::<ProjectField>().unwrap(), ProjectField::QuotationRef);
        assert_eq!("Closing-Time".parse::<ProjectField>().unwrap(), ProjectField::ClosingTime);
        assert!("budget".parse::<ProjectField>().is_err());

        assert_eq!(
            ProjectField::ClosingTime.parse_value("09:30:00").unwrap(),
            json!("09:30")
        );
        assert_eq!(
            ProjectField::ClosingDate.parse_value("2024-07-01").unwrap(),
            json!("2024-07-01")
        );
        assert!(ProjectField::ClosingDate.parse_value("tomorrow").is_err());
        assert_eq!(ProjectField::Name.parse_value("Depot").unwrap(), json!("Depot"));
    }
}
