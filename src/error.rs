// Request-level error taxonomy. Each pipeline stage that can fail a request
// gets its own variant with a user-facing message; soft-degraded stages
// (metadata, downbeat tracking) never surface here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("File too large")]
    TooLarge,

    #[error("Invalid upload: {0}")]
    BadUpload(String),

    #[error("Failed to decode audio: {0}")]
    Decode(String),

    #[error("Rhythm analysis failed: {0}")]
    Analysis(String),

    #[error("Visualization failed: {0}")]
    Render(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalysisError {
    fn status(&self) -> StatusCode {
        match self {
            AnalysisError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AnalysisError::BadUpload(_) | AnalysisError::Decode(_) => StatusCode::BAD_REQUEST,
            AnalysisError::Analysis(_) | AnalysisError::Render(_) | AnalysisError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AnalysisError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_large_maps_to_413() {
        assert_eq!(AnalysisError::TooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_decode_maps_to_400() {
        let err = AnalysisError::Decode("bad stream".into());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "Failed to decode audio: bad stream");
    }

    #[test]
    fn test_hard_failures_map_to_500() {
        assert_eq!(
            AnalysisError::Analysis("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AnalysisError::Render("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
