use std::io::Cursor;

use hound::{SampleFormat, WavSpec, WavWriter};
use thiserror::Error;

const WAV_HEADER_LEN: usize = 44;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("sample rate must be greater than zero")]
    InvalidSampleRate,
    #[error(transparent)]
    Encode(#[from] hound::Error),
}

/// Amplifies `samples` in place and hard-clips them to `[-1.0, 1.0]`.
///
/// Only gains above 1.0 do anything; attenuation is not supported here.
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    if gain.is_nan() || gain <= 1.0 {
        return;
    }
    for sample in samples.iter_mut() {
        *sample = (*sample * gain).clamp(-1.0, 1.0);
    }
}

/// Encodes normalized samples as a mono 16-bit PCM WAV file.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    if sample_rate == 0 {
        return Err(AudioError::InvalidSampleRate);
    }

    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut buffer = Vec::with_capacity(WAV_HEADER_LEN + samples.len() * 2);
    {
        let mut cursor = Cursor::new(&mut buffer);
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(to_pcm16(sample))?;
        }
        writer.finalize()?;
    }

    Ok(buffer)
}

fn to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
