use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{ensure, Context, Result};
use config as config_rs;
use serde::Deserialize;
use tts_engine::{EngineConfig, SynthesisParams};

const ENV_PREFIX: &str = "SUPERTONIC";

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Append logs to this file instead of stdout.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub synthesis: SynthesisParams,
    #[serde(default)]
    pub voices: VoicesConfig,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_size")]
    pub size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct VoicesConfig {
    #[serde(default = "default_style_dir")]
    pub style_dir: PathBuf,
}

impl Default for VoicesConfig {
    fn default() -> Self {
        Self {
            style_dir: default_style_dir(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_pool_size() -> usize {
    2
}

fn default_style_dir() -> PathBuf {
    PathBuf::from("assets/voice_styles")
}

fn default_languages() -> Vec<String> {
    ["en", "ko", "es", "pt", "fr"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl AppConfig {
    /// Reads the optional TOML file, then `SUPERTONIC__*` environment overrides.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut builder = config_rs::Config::builder();
        if let Some(ref path) = path {
            builder = builder.add_source(config_rs::File::from(path.clone()));
        }
        builder = builder.add_source(config_rs::Environment::with_prefix(ENV_PREFIX).separator("__"));

        let cfg = builder.build().with_context(|| match path {
            Some(ref path) => format!("failed to load configuration from {}", path.display()),
            None => "failed to load configuration from environment".to_string(),
        })?;

        let mut app_cfg = Self::from_config(cfg)?;
        if let Some(base) = path.as_deref().and_then(Path::parent) {
            app_cfg.rebase_paths(base);
        }
        Ok(app_cfg)
    }

    fn from_config(cfg: config_rs::Config) -> Result<Self> {
        let app_cfg: AppConfig = cfg
            .try_deserialize()
            .context("failed to deserialize configuration")?;
        app_cfg.validate()?;
        Ok(app_cfg)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.pool.size >= 1, "pool.size must be at least 1");
        ensure!(
            !self.languages.is_empty(),
            "languages must list at least one language"
        );
        ensure!(
            self.synthesis.total_step >= 1,
            "synthesis.total_step must be at least 1"
        );
        ensure!(
            self.synthesis.speed > 0.0,
            "synthesis.speed must be positive"
        );
        ensure!(
            self.synthesis.silence_duration >= 0.0,
            "synthesis.silence_duration must not be negative"
        );
        Ok(())
    }

    fn rebase_paths(&mut self, base: &Path) {
        self.voices.style_dir = absolute_path(base, &self.voices.style_dir);
        self.engine.onnx_dir = absolute_path(base, &self.engine.onnx_dir);
        if let Some(ref mut package) = self.engine.python_package_path {
            *package = absolute_path(base, package);
        }
        if let Some(ref mut log_file) = self.log_file {
            *log_file = absolute_path(base, log_file);
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn absolute_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Result<AppConfig> {
        let cfg = config_rs::Config::builder()
            .add_source(config_rs::File::from_str(toml, config_rs::FileFormat::Toml))
            .build()?;
        AppConfig::from_config(cfg)
    }

    #[test]
    fn defaults_match_reference_server() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8000");
        assert_eq!(cfg.pool.size, 2);
        assert_eq!(cfg.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(cfg.request_timeout(), Duration::from_secs(600));
        assert_eq!(cfg.languages, vec!["en", "ko", "es", "pt", "fr"]);
        assert_eq!(cfg.synthesis, SynthesisParams::default());
        assert_eq!(cfg.voices.style_dir, PathBuf::from("assets/voice_styles"));
        assert_eq!(cfg.engine.onnx_dir, PathBuf::from("assets/onnx"));
        assert!(cfg.log_file.is_none());
    }

    #[test]
    fn parse_full_config() {
        let cfg = parse(
            r#"
bind_addr = "127.0.0.1:9000"
shutdown_grace_secs = 2
languages = ["en", "ko"]

[pool]
size = 4

[synthesis]
total_step = 8
speed = 1.1

[voices]
style_dir = "styles"

[engine]
module = "supertonic_helper"
use_gpu = true
"#,
        )
        .unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.pool.size, 4);
        assert_eq!(cfg.shutdown_grace(), Duration::from_secs(2));
        assert_eq!(cfg.languages, vec!["en", "ko"]);
        assert_eq!(cfg.synthesis.total_step, 8);
        assert_eq!(cfg.synthesis.silence_duration, 0.3);
        assert_eq!(cfg.engine.module, "supertonic_helper");
        assert!(cfg.engine.use_gpu);
    }

    #[test]
    fn zero_pool_is_rejected() {
        let err = parse("[pool]\nsize = 0\n").unwrap_err();
        assert!(err.to_string().contains("pool.size"));
    }

    #[test]
    fn empty_language_table_is_rejected() {
        let mut cfg = parse("").unwrap();
        cfg.languages.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn relative_paths_follow_config_file() {
        let mut cfg = parse("[voices]\nstyle_dir = \"styles\"\n").unwrap();
        cfg.rebase_paths(Path::new("/srv/tts"));
        assert_eq!(cfg.voices.style_dir, PathBuf::from("/srv/tts/styles"));
        assert_eq!(cfg.engine.onnx_dir, PathBuf::from("/srv/tts/assets/onnx"));
    }
}
