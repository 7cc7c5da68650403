use anyhow::{anyhow, Context, Result};
use numpy::{PyArray1, PyArray2, PyArrayMethods};
use pyo3::{
    prelude::*,
    types::{PyList, PyModule},
};
use tracing::info;

use crate::model::{SpeechModel, SynthesisInput, Synthesized};
use crate::style::{StyleTensor, VoiceStyle};
use crate::EngineConfig;

/// Inference context hosted by a Python module.
///
/// The module must expose `load_text_to_speech(onnx_dir, use_gpu)` returning
/// a callable with a `sample_rate` attribute, and a `Style(ttl, dp)` class.
pub struct PythonSpeechModel {
    module: Py<PyModule>,
    engine: Py<PyAny>,
    sample_rate: u32,
}

impl PythonSpeechModel {
    pub fn load(config: &EngineConfig) -> Result<Self> {
        let package_path = config
            .python_package_path
            .as_ref()
            .map(|path| {
                path.canonicalize()
                    .with_context(|| format!("python package path {} not found", path.display()))
            })
            .transpose()?;
        let onnx_dir = config.onnx_dir.to_string_lossy().into_owned();

        Python::with_gil(|py| -> Result<Self> {
            if let Some(path) = package_path {
                let sys_path = py.import_bound("sys")?.getattr("path")?;
                let sys_path = sys_path.downcast::<PyList>().map_err(PyErr::from)?;
                let entry = path.to_string_lossy().into_owned();
                if !sys_path.contains(entry.as_str())? {
                    sys_path.insert(0, entry)?;
                }
            }

            let module = PyModule::import_bound(py, config.module.as_str())
                .with_context(|| format!("failed to import python module '{}'", config.module))?;
            let engine = module
                .getattr("load_text_to_speech")?
                .call1((onnx_dir.as_str(), config.use_gpu))
                .context("load_text_to_speech failed")?;
            let sample_rate: u32 = engine
                .getattr("sample_rate")?
                .extract()
                .context("engine sample_rate must be an integer")?;

            info!(
                target = "supertonic::engine",
                module = %config.module,
                onnx_dir = %onnx_dir,
                sample_rate,
                "initialized python TTS runtime"
            );

            Ok(Self {
                module: module.unbind(),
                engine: engine.unbind(),
                sample_rate,
            })
        })
    }
}

impl SpeechModel for PythonSpeechModel {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn synthesize(&mut self, input: &SynthesisInput<'_>) -> Result<Synthesized> {
        Python::with_gil(|py| -> Result<Synthesized> {
            let style = build_style(py, self.module.bind(py), input.style)?;
            let result = self.engine.bind(py).call1((
                input.text,
                input.lang,
                style,
                input.params.total_step,
                input.params.speed,
                input.params.silence_duration,
            ))?;
            let (wav, duration): (Bound<'_, PyAny>, Bound<'_, PyAny>) = result
                .extract()
                .context("engine must return a (wav, duration) pair")?;

            Ok(Synthesized {
                samples: extract_waveform(&wav)?,
                duration_secs: extract_scalar(&duration)?,
            })
        })
    }
}

fn build_style<'py>(
    py: Python<'py>,
    module: &Bound<'py, PyModule>,
    style: &VoiceStyle,
) -> Result<Bound<'py, PyAny>> {
    let ttl = tensor_to_array(py, &style.ttl)?;
    let dp = tensor_to_array(py, &style.dp)?;
    Ok(module.getattr("Style")?.call1((ttl, dp))?)
}

fn tensor_to_array<'py>(py: Python<'py>, tensor: &StyleTensor) -> Result<Bound<'py, PyAny>> {
    let flat = PyArray1::from_slice_bound(py, &tensor.data);
    let shaped = flat.reshape(tensor.dims.clone())?;
    Ok(shaped.into_any())
}

fn extract_waveform(bound: &Bound<'_, PyAny>) -> Result<Vec<f32>> {
    if let Ok(array) = bound.downcast::<PyArray1<f32>>() {
        return Ok(array.readonly().as_array().iter().copied().collect());
    }

    if let Ok(array) = bound.downcast::<PyArray2<f32>>() {
        return Ok(array.readonly().as_array().iter().copied().collect());
    }

    if let Ok(array) = bound.downcast::<PyArray1<f64>>() {
        return Ok(array
            .readonly()
            .as_array()
            .iter()
            .map(|&sample| sample as f32)
            .collect());
    }

    if let Ok(array) = bound.downcast::<PyArray2<f64>>() {
        return Ok(array
            .readonly()
            .as_array()
            .iter()
            .map(|&sample| sample as f32)
            .collect());
    }

    Err(anyhow!(
        "unsupported waveform dtype: expected float32 or float64"
    ))
}

// Engines report duration either as a float or as a one-element array.
fn extract_scalar(bound: &Bound<'_, PyAny>) -> Result<f32> {
    if let Ok(value) = bound.extract::<f32>() {
        return Ok(value);
    }

    if let Ok(array) = bound.downcast::<PyArray1<f32>>() {
        if let Some(&value) = array.readonly().as_array().iter().next() {
            return Ok(value);
        }
    }

    if let Ok(array) = bound.downcast::<PyArray1<f64>>() {
        if let Some(&value) = array.readonly().as_array().iter().next() {
            return Ok(value as f32);
        }
    }

    Err(anyhow!("unsupported duration value returned by engine"))
}
