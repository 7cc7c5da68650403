use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod audio;
pub mod model;
pub mod pool;
#[cfg(feature = "python")]
pub mod python;
pub mod style;

pub use audio::{apply_gain, encode_wav, AudioError};
pub use model::{load_pool, ModelPool, SpeechModel, SynthesisInput, SynthesisParams, Synthesized};
pub use pool::{InstancePool, Lease, PoolError};
#[cfg(feature = "python")]
pub use python::PythonSpeechModel;
pub use style::{
    JsonStyleLoader, StyleCache, StyleDescriptor, StyleError, StyleLoader, StyleTensor, VoiceStyle,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Directory holding the exported model files.
    #[serde(default = "default_onnx_dir")]
    pub onnx_dir: PathBuf,
    /// Extra import path for the engine's python package.
    #[serde(default)]
    pub python_package_path: Option<PathBuf>,
    #[serde(default = "default_module")]
    pub module: String,
    #[serde(default)]
    pub use_gpu: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            onnx_dir: default_onnx_dir(),
            python_package_path: None,
            module: default_module(),
            use_gpu: false,
        }
    }
}

fn default_onnx_dir() -> PathBuf {
    PathBuf::from("assets/onnx")
}

fn default_module() -> String {
    "helper".to_string()
}

/// Loads one inference instance with the engine compiled into this build.
#[cfg(feature = "python")]
pub fn load_speech_model(config: &EngineConfig) -> Result<Box<dyn SpeechModel>> {
    Ok(Box::new(PythonSpeechModel::load(config)?))
}

#[cfg(not(feature = "python"))]
pub fn load_speech_model(_config: &EngineConfig) -> Result<Box<dyn SpeechModel>> {
    anyhow::bail!("no inference engine compiled in; rebuild with `--features python`")
}
