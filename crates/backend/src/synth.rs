use std::time::{Duration, Instant};

use tokio::task;
use tracing::instrument;
use tts_engine::{
    apply_gain, encode_wav, ModelPool, StyleCache, StyleDescriptor, StyleError, SynthesisInput,
    SynthesisParams,
};
use uuid::Uuid;

use crate::error::ApiError;

/// A validated `/tts` request.
#[derive(Clone, Debug)]
pub struct SynthesisRequest {
    pub request_id: Uuid,
    pub speaker: String,
    pub text: String,
    pub lang: String,
    pub volume_gain: Option<f32>,
}

#[derive(Debug)]
pub struct SynthesisOutcome {
    pub wav: Vec<u8>,
    pub sample_rate: u32,
    pub waveform_len: usize,
    pub duration_secs: f32,
    pub elapsed: Duration,
    pub rtf: f32,
}

/// Owns the model pool and the style cache for the lifetime of the server.
pub struct Synthesizer {
    pool: ModelPool,
    styles: StyleCache,
    params: SynthesisParams,
}

impl Synthesizer {
    pub fn new(pool: ModelPool, styles: StyleCache, params: SynthesisParams) -> Self {
        Self {
            pool,
            styles,
            params,
        }
    }

    pub fn style(&self, speaker: &str) -> Result<StyleDescriptor, StyleError> {
        self.styles.get(speaker)
    }

    pub fn speakers(&self) -> Vec<String> {
        self.styles.speakers()
    }

    pub fn pool(&self) -> &ModelPool {
        &self.pool
    }

    #[instrument(skip_all, fields(request_id = %request.request_id, speaker = %request.speaker))]
    pub async fn synthesize(
        &self,
        request: &SynthesisRequest,
        style: StyleDescriptor,
    ) -> Result<SynthesisOutcome, ApiError> {
        let lease = self.pool.acquire().await;
        let text = request.text.clone();
        let lang = request.lang.clone();
        let params = self.params.clone();

        let started_at = Instant::now();
        // The lease travels with the blocking call and is released as soon as
        // the engine returns; a client disconnect does not cut it short.
        let (result, sample_rate) = task::spawn_blocking(move || {
            let mut lease = lease;
            let sample_rate = lease.sample_rate();
            let result = lease.synthesize(&SynthesisInput {
                text: &text,
                lang: &lang,
                style: &style,
                params: &params,
            });
            lease.release();
            (result, sample_rate)
        })
        .await
        .map_err(|err| ApiError::Synthesis(anyhow::anyhow!("synthesis task aborted: {err}")))?;
        let elapsed = started_at.elapsed();

        let mut synthesized = result.map_err(ApiError::Synthesis)?;
        if let Some(gain) = request.volume_gain {
            apply_gain(&mut synthesized.samples, gain);
        }

        let duration_secs = synthesized.duration_secs;
        let rtf = if duration_secs > 0.0 {
            elapsed.as_secs_f32() / duration_secs
        } else {
            0.0
        };
        let wav = encode_wav(&synthesized.samples, sample_rate)?;
        Ok(SynthesisOutcome {
            wav,
            sample_rate,
            waveform_len: synthesized.samples.len(),
            duration_secs,
            elapsed,
            rtf,
        })
    }
}
