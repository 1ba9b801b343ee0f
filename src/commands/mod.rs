mod categories;
mod equipment;
mod modified;
mod projects;
mod watch;

pub use categories::{CategoryAction, cmd_categories};
pub use equipment::{EquipmentAction, cmd_equipment};
pub use modified::cmd_modified;
pub use projects::{ProjectAction, cmd_projects};
pub use watch::cmd_watch;

use std::sync::Arc;

use crate::backend::{Backend, MemoryBackend, RestBackend};
use crate::config::Config;
use crate::error::Result;
use crate::model::tables;
use crate::sync::ViewOptions;

/// Output options shared by listing commands
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputOptions {
    pub json: bool,
}

pub fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Backend connection and view tuning for one command run
pub struct Session {
    pub backend: Arc<dyn Backend>,
    pub options: ViewOptions,
}

impl Session {
    /// Connect to the configured backend, or to an empty in-process store
    /// when `memory` is set.
    pub fn connect(config: &Config, memory: bool) -> Result<Self> {
        let backend: Arc<dyn Backend> = if memory {
            tracing::debug!("using in-memory store");
            Arc::new(MemoryBackend::with_cascades(tables::cascades()))
        } else {
            Arc::new(RestBackend::from_config(config)?)
        };
        Ok(Self {
            backend,
            options: ViewOptions::from(config),
        })
    }
}

/// Gate on the configured PIN, if there is one.
pub fn check_pin(config: &Config, entered: Option<&str>) -> Result<()> {
    if config.pin.is_none() {
        return Ok(());
    }
    config.verify_pin(entered.unwrap_or_default())
}
