use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::pool::InstancePool;
use crate::style::VoiceStyle;

/// Knobs forwarded unchanged to the engine on every call.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SynthesisParams {
    /// Diffusion step count.
    #[serde(default = "default_total_step")]
    pub total_step: u32,
    #[serde(default = "default_speed")]
    pub speed: f32,
    /// Seconds of silence appended after the speech.
    #[serde(default = "default_silence_duration")]
    pub silence_duration: f32,
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self {
            total_step: default_total_step(),
            speed: default_speed(),
            silence_duration: default_silence_duration(),
        }
    }
}

fn default_total_step() -> u32 {
    5
}

fn default_speed() -> f32 {
    1.0
}

fn default_silence_duration() -> f32 {
    0.3
}

pub struct SynthesisInput<'a> {
    pub text: &'a str,
    pub lang: &'a str,
    pub style: &'a VoiceStyle,
    pub params: &'a SynthesisParams,
}

#[derive(Clone, Debug, Default)]
pub struct Synthesized {
    /// Normalized amplitudes in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    /// Duration of the produced speech as reported by the engine.
    pub duration_secs: f32,
}

/// A loaded inference context.
///
/// `synthesize` takes `&mut self`: an instance serves one call at a time and
/// is shared between requests only through an [`InstancePool`].
pub trait SpeechModel: Send + 'static {
    fn sample_rate(&self) -> u32;

    fn synthesize(&mut self, input: &SynthesisInput<'_>) -> Result<Synthesized>;
}

impl<M: SpeechModel + ?Sized> SpeechModel for Box<M> {
    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn synthesize(&mut self, input: &SynthesisInput<'_>) -> Result<Synthesized> {
        (**self).synthesize(input)
    }
}

pub type ModelPool = InstancePool<Box<dyn SpeechModel>>;

/// Loads `size` instances through `factory` and pools them.
///
/// Any failing instance aborts the whole load.
pub fn load_pool<M, F>(size: usize, mut factory: F) -> Result<InstancePool<M>>
where
    M: Send + 'static,
    F: FnMut(usize) -> Result<M>,
{
    let mut instances = Vec::with_capacity(size);
    for index in 0..size {
        let instance =
            factory(index).with_context(|| format!("failed to load TTS model instance {index}"))?;
        info!(target = "supertonic::engine", index, "loaded TTS instance");
        instances.push(instance);
    }
    Ok(InstancePool::new(instances)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_pool_builds_requested_size() {
        let pool = load_pool(3, |index| Ok(index)).unwrap();
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn load_pool_fails_on_first_bad_instance() {
        let err = load_pool(3, |index| {
            if index == 1 {
                anyhow::bail!("model file missing");
            }
            Ok(index)
        })
        .unwrap_err();
        assert!(err.to_string().contains("instance 1"));
    }

    #[test]
    fn load_pool_rejects_zero_size() {
        assert!(load_pool(0, |index| Ok(index)).is_err());
    }

    #[test]
    fn default_params_match_server_constants() {
        let params = SynthesisParams::default();
        assert_eq!(params.total_step, 5);
        assert_eq!(params.speed, 1.0);
        assert_eq!(params.silence_duration, 0.3);
    }
}
