pub mod config;
pub mod events;
pub mod patch;
pub mod rejects;
pub mod types;

pub use config::{FormatConfig, WorkerConfig};
pub use patch::PatchHelper;
pub use rejects::extract_error_data;
pub use types::*;
