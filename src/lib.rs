pub mod backend;
pub mod commands;
pub mod config;
pub mod display;
pub mod error;
pub mod model;
pub mod sync;

pub use backend::{Backend, MemoryBackend, RestBackend};
pub use config::Config;
pub use error::{HoldbackError, Result};
pub use model::{CategoryBoard, CategoryKind, EquipmentBoard, ModifiedTracker, ProjectBoard};
pub use sync::{SyncedView, ViewEvent, ViewOptions};
