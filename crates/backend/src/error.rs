use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};
use tts_engine::{AudioError, StyleError};

#[derive(Debug, Error)]
pub enum ApiError {
    /// The request could not be bound to the expected parameters.
    #[error("{0}")]
    BadRequest(String),
    #[error("Missing required parameter: speaker_name or text or lang")]
    MissingParameter,
    #[error("Invalid language: {lang}. Available: [{}]", .available.join(" "))]
    InvalidLanguage { lang: String, available: Vec<String> },
    #[error("Invalid speaker_name: {speaker} ({source})")]
    UnknownSpeaker {
        speaker: String,
        #[source]
        source: StyleError,
    },
    #[error("TTS failed: {0:#}")]
    Synthesis(anyhow::Error),
    #[error("Failed to encode WAV: {0}")]
    Encoding(#[from] AudioError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_)
            | ApiError::MissingParameter
            | ApiError::InvalidLanguage { .. }
            | ApiError::UnknownSpeaker { .. } => StatusCode::BAD_REQUEST,
            ApiError::Synthesis(_) | ApiError::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        if status.is_server_error() {
            error!(target = "supertonic::api", status = status.as_u16(), error = %message, "request failed");
        } else {
            debug!(target = "supertonic::api", status = status.as_u16(), error = %message, "request rejected");
        }
        (status, Json(ErrorBody { error: message })).into_response()
    }
}
