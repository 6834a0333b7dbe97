pub mod app;
pub mod count;
pub mod csv;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod processed;
pub mod reconcile;
pub mod schedule;
pub mod settings;
pub mod snapshot;
pub mod state;
pub mod stats;
pub mod storage;

pub use app::router;
pub use orchestrator::{AcceptOutcome, SaveOrchestrator, SaveOutcome, SaveReason};
pub use state::AppState;
pub use storage::{resolve_data_path, resolve_export_dir, FileDelivery, JsonFileStore};
