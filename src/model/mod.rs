//! Dashboard datasets: quoted projects, construction/inspection categories,
//! equipment tables and the last-modified clock.

pub mod category;
pub mod equipment;
pub mod grouping;
pub mod modified;
pub mod project;
pub mod tables;

use serde::{Deserialize, Deserializer};

pub use category::{CategoryBoard, CategoryKind, Section};
pub use equipment::{EquipmentBoard, EquipmentGroup};
pub use modified::{ModifiedClock, ModifiedTracker, TableModified};
pub use project::{ProjectBoard, ProjectField, QuotedProject, Urgency};

/// Column cap of a category section
pub const MAX_SECTION_COLUMNS: usize = 3;

/// Column cap of an equipment type
pub const MAX_EQUIPMENT_COLUMNS: usize = 7;

/// Read a nullable column, mapping `null` to the type's default.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
