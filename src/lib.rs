pub mod downloader;
pub mod manager;
pub mod models;
pub mod output;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod server;
pub mod settings;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::downloader::{EngineError, ExtractionEngine, MediaInfo, TransferRequest, YtDlp};
    pub use crate::manager::{JobManager, ManagerError};
    pub use crate::models::{EventStatus, JobRecord, JobStatus, ProgressEvent};
    pub use crate::settings::{Settings, SettingsStore};
}
