// REST API routes: the analysis endpoint and a health probe.

use axum::{
    extract::{Multipart, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

use super::AppState;
use crate::error::AnalysisError;
use crate::pipeline::{self, AnalysisOutcome, EventRecord};

// ---- Response types ----

/// The flat analysis document. `speed`/`length` duplicate `tempo`/`duration`
/// — both spellings are external contract. Absent tags serialize as null,
/// not as missing keys.
#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub tempo: f64,
    pub beat_times: Vec<f64>,
    pub onset_times: Vec<f64>,
    pub rms: Vec<f32>,
    pub duration: f64,
    pub downbeats: Vec<f64>,
    pub image_base64: Option<String>,
    pub speed: f64,
    pub length: f64,
    pub events: Vec<EventRecord>,
    pub song_label: Option<String>,
    pub artist: Option<String>,
    pub genre: Option<String>,
}

impl From<AnalysisOutcome> for AnalysisResponse {
    fn from(outcome: AnalysisOutcome) -> Self {
        AnalysisResponse {
            tempo: outcome.tempo,
            beat_times: outcome.beat_times,
            onset_times: outcome.onset_times,
            rms: outcome.rms,
            duration: outcome.duration,
            downbeats: outcome.downbeats,
            image_base64: outcome.image_base64,
            speed: outcome.tempo,
            length: outcome.duration,
            events: outcome.events,
            song_label: outcome.tags.title,
            artist: outcome.tags.artist,
            genre: outcome.tags.genre,
        }
    }
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub name: String,
    pub version: String,
    pub downbeat_model: bool,
}

// ---- Route registration ----

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/analyze", post(analyze))
        .route("/health", get(health))
}

// ---- Handlers ----

async fn health(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        name: "beatscope".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        downbeat_model: state.tracker.is_available(),
    })
}

/// Analyze one uploaded audio file. Accepts the first file-bearing multipart
/// field; the whole pipeline runs on a blocking thread so CPU-bound work
/// does not stall the async workers.
async fn analyze(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<AnalysisResponse>, AnalysisError> {
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AnalysisError::BadUpload(format!("Malformed multipart body: {}", e)))?
    {
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AnalysisError::BadUpload(format!("Failed to read upload: {}", e)))?;
        if !bytes.is_empty() {
            upload = Some(bytes);
            break;
        }
    }

    let bytes =
        upload.ok_or_else(|| AnalysisError::BadUpload("No file field in upload".to_string()))?;

    let tracker = state.tracker.clone();
    let outcome = tokio::task::spawn_blocking(move || pipeline::analyze_upload(&bytes, &tracker))
        .await
        .map_err(|e| AnalysisError::Analysis(format!("Analysis task panicked: {}", e)))??;

    Ok(Json(AnalysisResponse::from(outcome)))
}
