use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

const STYLE_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum StyleError {
    #[error("failed to read voice style directory {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("voice style not found: {0}")]
    NotFound(String),
}

/// Row-major float tensor as stored in a style file.
#[derive(Clone, Debug, PartialEq)]
pub struct StyleTensor {
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

/// Conditioning vectors for one speaker. Opaque to the serving path.
#[derive(Clone, Debug, PartialEq)]
pub struct VoiceStyle {
    pub ttl: StyleTensor,
    pub dp: StyleTensor,
}

pub type StyleDescriptor = Arc<VoiceStyle>;

pub trait StyleLoader: Send + Sync {
    /// Builds one style out of the given files (stacked as a batch).
    fn load(&self, paths: &[PathBuf]) -> Result<VoiceStyle>;
}

/// Reads `{"style_ttl": {...}, "style_dp": {...}}` style files.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonStyleLoader;

#[derive(Deserialize)]
struct StyleFile {
    style_ttl: RawTensor,
    style_dp: RawTensor,
}

#[derive(Deserialize)]
struct RawTensor {
    data: JsonValue,
    dims: Vec<usize>,
    #[serde(rename = "type", default)]
    dtype: Option<String>,
}

impl StyleLoader for JsonStyleLoader {
    fn load(&self, paths: &[PathBuf]) -> Result<VoiceStyle> {
        let mut ttl_parts = Vec::with_capacity(paths.len());
        let mut dp_parts = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = fs::read(path)
                .with_context(|| format!("failed to read voice style {}", path.display()))?;
            let file: StyleFile = serde_json::from_slice(&bytes)
                .with_context(|| format!("failed to parse voice style {}", path.display()))?;
            ttl_parts.push(
                file.style_ttl
                    .into_tensor()
                    .with_context(|| format!("invalid style_ttl in {}", path.display()))?,
            );
            dp_parts.push(
                file.style_dp
                    .into_tensor()
                    .with_context(|| format!("invalid style_dp in {}", path.display()))?,
            );
        }
        Ok(VoiceStyle {
            ttl: stack_batch(ttl_parts).context("style_ttl shapes disagree")?,
            dp: stack_batch(dp_parts).context("style_dp shapes disagree")?,
        })
    }
}

impl RawTensor {
    fn into_tensor(self) -> Result<StyleTensor> {
        if let Some(dtype) = self.dtype.as_deref() {
            ensure!(dtype == "float32", "unsupported tensor type '{dtype}'");
        }
        ensure!(!self.dims.is_empty(), "tensor dims must not be empty");

        let mut data = Vec::new();
        flatten_into(&self.data, &mut data)?;
        let expected: usize = self.dims.iter().product();
        ensure!(
            data.len() == expected,
            "tensor holds {} values but dims {:?} need {}",
            data.len(),
            self.dims,
            expected
        );
        Ok(StyleTensor {
            dims: self.dims,
            data,
        })
    }
}

fn flatten_into(value: &JsonValue, out: &mut Vec<f32>) -> Result<()> {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                flatten_into(item, out)?;
            }
            Ok(())
        }
        JsonValue::Number(number) => {
            let sample = number
                .as_f64()
                .ok_or_else(|| anyhow!("tensor value {number} is not a float"))?;
            out.push(sample as f32);
            Ok(())
        }
        other => bail!("unexpected tensor value {other}"),
    }
}

fn stack_batch(parts: Vec<StyleTensor>) -> Result<StyleTensor> {
    let mut parts = parts.into_iter();
    let Some(mut stacked) = parts.next() else {
        bail!("no style files given");
    };
    for part in parts {
        ensure!(
            part.dims[1..] == stacked.dims[1..],
            "dims {:?} do not match {:?}",
            part.dims,
            stacked.dims
        );
        stacked.dims[0] += part.dims[0];
        stacked.data.extend(part.data);
    }
    Ok(stacked)
}

/// Speaker name to style, filled once at startup and read-only afterwards.
#[derive(Debug, Default)]
pub struct StyleCache {
    styles: HashMap<String, StyleDescriptor>,
}

impl StyleCache {
    /// Loads every `<speaker>.json` in `dir`.
    ///
    /// Files that fail to load are logged and skipped; only an unreadable
    /// directory is an error.
    pub fn preload(dir: impl AsRef<Path>, loader: &dyn StyleLoader) -> Result<Self, StyleError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|source| StyleError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut candidates = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(target = "supertonic::styles", %err, "skipping unreadable directory entry");
                    continue;
                }
            };
            if entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(STYLE_EXTENSION) {
                continue;
            }
            candidates.push(path);
        }
        candidates.sort();

        let mut styles = HashMap::with_capacity(candidates.len());
        for path in candidates {
            let Some(speaker) = path.file_stem().and_then(|stem| stem.to_str()) else {
                warn!(target = "supertonic::styles", path = %path.display(), "skipping style with non UTF-8 name");
                continue;
            };
            let speaker = speaker.to_string();
            match loader.load(std::slice::from_ref(&path)) {
                Ok(style) => {
                    styles.insert(speaker, Arc::new(style));
                }
                Err(err) => {
                    warn!(
                        target = "supertonic::styles",
                        speaker = %speaker,
                        error = %format!("{err:#}"),
                        "failed to load voice style"
                    );
                }
            }
        }

        info!(
            target = "supertonic::styles",
            count = styles.len(),
            dir = %dir.display(),
            "loaded voice styles into cache"
        );
        Ok(Self { styles })
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, VoiceStyle)>,
    {
        Self {
            styles: entries
                .into_iter()
                .map(|(speaker, style)| (speaker, Arc::new(style)))
                .collect(),
        }
    }

    pub fn get(&self, speaker: &str) -> Result<StyleDescriptor, StyleError> {
        self.styles
            .get(speaker)
            .cloned()
            .ok_or_else(|| StyleError::NotFound(speaker.to_string()))
    }

    pub fn speakers(&self) -> Vec<String> {
        let mut speakers: Vec<String> = self.styles.keys().cloned().collect();
        speakers.sort();
        speakers
    }

    pub fn len(&self) -> usize {
        self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.styles.is_empty()
    }
}
