// Modules
pub mod audio;
pub mod config;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod render;
pub mod server;

pub use audio::decoder::MonoAudio;
pub use audio::downbeat::DownbeatTracker;
pub use error::AnalysisError;
pub use pipeline::{analyze_upload, AnalysisOutcome};
