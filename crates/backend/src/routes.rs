use std::{fmt, sync::Arc, time::Duration};

use axum::{
    async_trait,
    extract::{FromRequest, Multipart, Query, Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Form, Json, Router,
};
use bytes::Bytes;
use serde::{de, Deserialize, Deserializer, Serialize};
use tower_http::timeout::TimeoutLayer;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::{
    error::ApiError,
    synth::{SynthesisRequest, Synthesizer},
};

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Clone)]
pub struct AppState {
    pub synthesizer: Arc<Synthesizer>,
    pub languages: Arc<[String]>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Clone, Copy, Debug)]
pub struct RequestId(pub Uuid);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `/tts` parameters. Absent or null fields bind as empty strings and are
/// rejected during validation rather than binding.
#[derive(Debug, Default, Deserialize)]
pub struct TtsParams {
    #[serde(default)]
    pub speaker_name: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default, deserialize_with = "deserialize_text_gain")]
    pub volume_gain: Option<f32>,
}

/// JSON bodies carry the gain as a number only.
#[derive(Debug, Deserialize)]
struct JsonTtsParams {
    #[serde(default)]
    speaker_name: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    lang: Option<String>,
    #[serde(default)]
    volume_gain: Option<f32>,
}

impl JsonTtsParams {
    fn into_params(self) -> Result<TtsParams, ApiError> {
        if let Some(gain) = self.volume_gain {
            check_gain(gain).map_err(ApiError::BadRequest)?;
        }
        Ok(TtsParams {
            speaker_name: self.speaker_name,
            text: self.text,
            lang: self.lang,
            volume_gain: self.volume_gain,
        })
    }
}

// Query strings, urlencoded and multipart forms carry the gain as text.
fn deserialize_text_gain<'de, D>(deserializer: D) -> Result<Option<f32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_gain(&raw).map_err(de::Error::custom),
        None => Ok(None),
    }
}

fn parse_gain(raw: &str) -> Result<Option<f32>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let gain = raw
        .parse::<f32>()
        .map_err(|_| format!("invalid volume_gain: {raw}"))?;
    check_gain(gain)?;
    Ok(Some(gain))
}

fn check_gain(gain: f32) -> Result<(), String> {
    if gain.is_finite() {
        Ok(())
    } else {
        Err("volume_gain must be a finite number".to_string())
    }
}

#[async_trait]
impl<S> FromRequest<S> for TtsParams
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        if req.method() == Method::GET {
            return bind_query(&req);
        }

        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("application/json") {
            let Json(params) = Json::<JsonTtsParams>::from_request(req, state)
                .await
                .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
            params.into_params()
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            let Form(params) = Form::<TtsParams>::from_request(req, state)
                .await
                .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
            Ok(params)
        } else if content_type.starts_with("multipart/form-data") {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
            bind_multipart(multipart).await
        } else {
            bind_query(&req)
        }
    }
}

fn bind_query(req: &Request) -> Result<TtsParams, ApiError> {
    let Query(params) = Query::<TtsParams>::try_from_uri(req.uri())
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    Ok(params)
}

async fn bind_multipart(mut multipart: Multipart) -> Result<TtsParams, ApiError> {
    let mut params = TtsParams::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let slot = match name.as_str() {
            "speaker_name" => &mut params.speaker_name,
            "text" => &mut params.text,
            "lang" => &mut params.lang,
            "volume_gain" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.body_text()))?;
                params.volume_gain = parse_gain(&raw).map_err(ApiError::BadRequest)?;
                continue;
            }
            _ => continue,
        };
        *slot = Some(
            field
                .text()
                .await
                .map_err(|err| ApiError::BadRequest(err.body_text()))?,
        );
    }
    Ok(params)
}

pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(home).post(home))
        .route("/tts", get(tts).post(tts))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(middleware::from_fn(assign_request_id))
        .with_state(state)
}

async fn assign_request_id(mut req: Request, next: Next) -> Response {
    let request_id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(request_id);

    let span = info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn home() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

async fn tts(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    params: TtsParams,
) -> Result<Response, ApiError> {
    let speaker_name = params.speaker_name.unwrap_or_default();
    let text = params.text.unwrap_or_default();
    let lang = params.lang.unwrap_or_default();
    let volume_gain = params.volume_gain;

    if speaker_name.is_empty() || text.is_empty() || lang.is_empty() {
        return Err(ApiError::MissingParameter);
    }
    if !state.languages.iter().any(|allowed| *allowed == lang) {
        return Err(ApiError::InvalidLanguage {
            lang,
            available: state.languages.to_vec(),
        });
    }
    let style = state
        .synthesizer
        .style(&speaker_name)
        .map_err(|source| ApiError::UnknownSpeaker {
            speaker: speaker_name.clone(),
            source,
        })?;

    info!(
        target = "supertonic::api",
        speaker = %speaker_name,
        lang = %lang,
        text_size = text.len(),
        volume_gain = ?volume_gain,
        "tts request accepted"
    );

    let request = SynthesisRequest {
        request_id: request_id.0,
        speaker: speaker_name,
        text,
        lang,
        volume_gain,
    };
    let outcome = state.synthesizer.synthesize(&request, style).await?;
    info!(
        target = "supertonic::api",
        lang = %request.lang,
        text_size = request.text.len(),
        sample_rate = outcome.sample_rate,
        waveform_len = outcome.waveform_len,
        duration_secs = outcome.duration_secs,
        elapsed_secs = outcome.elapsed.as_secs_f32(),
        rtf = outcome.rtf,
        "tts succeeded"
    );

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "audio/wav"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"output.wav\""),
        ],
        Bytes::from(outcome.wav),
    )
        .into_response())
}
