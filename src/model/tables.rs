//! Table names of the hosted schema and the cascades between them.

use crate::backend::Cascade;

pub const QUOTED_PROJECTS: &str = "QuotedProjects";

pub const CATEGORIES: &str = "Categories";
pub const COLUMN_DEFINITIONS: &str = "ColumnDefinitions";
pub const CATEGORY_DATA: &str = "CategoryData";
pub const CATEGORY_DATA_VALUES: &str = "CategoryDataValues";

pub const EQUIPMENT_TYPES: &str = "equipmentType";
pub const EQUIPMENT_COLUMNS: &str = "equipmentColumns";
pub const EQUIPMENT_ROWS: &str = "equipmentRows";
pub const EQUIPMENT_CELLS: &str = "equipmentCells";

/// Tables whose newest `updated_at` makes up the modified time
pub const MODIFIED_TABLES: [&str; 8] = [
    QUOTED_PROJECTS,
    CATEGORIES,
    CATEGORY_DATA_VALUES,
    COLUMN_DEFINITIONS,
    EQUIPMENT_ROWS,
    EQUIPMENT_CELLS,
    EQUIPMENT_COLUMNS,
    EQUIPMENT_TYPES,
];

/// Foreign keys declared `ON DELETE CASCADE` in the hosted schema
pub fn cascades() -> Vec<Cascade> {
    vec![
        Cascade::new(COLUMN_DEFINITIONS, "category_id", CATEGORIES),
        Cascade::new(CATEGORY_DATA, "category_id", CATEGORIES),
        Cascade::new(CATEGORY_DATA_VALUES, "category_data_id", CATEGORY_DATA),
        Cascade::new(CATEGORY_DATA_VALUES, "column_definition_id", COLUMN_DEFINITIONS),
        Cascade::new(EQUIPMENT_COLUMNS, "type_id", EQUIPMENT_TYPES),
        Cascade::new(EQUIPMENT_ROWS, "type_id", EQUIPMENT_TYPES),
        Cascade::new(EQUIPMENT_CELLS, "row_id", EQUIPMENT_ROWS),
        Cascade::new(EQUIPMENT_CELLS, "column_id", EQUIPMENT_COLUMNS),
    ]
}
