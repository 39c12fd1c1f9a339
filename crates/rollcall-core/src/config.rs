//! Layered configuration: defaults, optional TOML file, `ROLLCALL_*` variables.
//!
//! Binaries apply their own command-line flags on top of the loaded value.

use crate::matcher::{LENIENT_TOLERANCE, STRICT_TOLERANCE};
use crate::recognition::Tolerances;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the person table and the embedding blob.
    pub data_dir: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Camera indices tried in order until one opens.
    pub camera_indices: Vec<u32>,
    pub tolerance: f32,
    pub lenient_tolerance: f32,
    /// Run detection on every Nth frame.
    pub frame_skip: u32,
    /// Flip frames horizontally so the preview behaves like a mirror.
    pub mirror: bool,
    /// Frames discarded after opening the camera (AGC/AE settle).
    pub warmup_frames: usize,
    /// Frames examined by a web registration before giving up.
    pub capture_attempts: usize,
    pub host: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            model_dir: default_model_dir(),
            camera_indices: vec![0, 1, 2],
            tolerance: STRICT_TOLERANCE,
            lenient_tolerance: LENIENT_TOLERANCE,
            frame_skip: 2,
            mirror: true,
            warmup_frames: 4,
            capture_attempts: 100,
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl Config {
    /// Defaults, then the config file if one is found, then the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_file_path() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `ROLLCALL_*` overrides. Unparseable values are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("ROLLCALL_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("ROLLCALL_CAMERA_INDICES") {
            match parse_indices(&raw) {
                Some(indices) => self.camera_indices = indices,
                None => tracing::warn!(value = %raw, "ignoring invalid ROLLCALL_CAMERA_INDICES"),
            }
        }
        override_parsed(&lookup, "ROLLCALL_TOLERANCE", &mut self.tolerance);
        override_parsed(&lookup, "ROLLCALL_LENIENT_TOLERANCE", &mut self.lenient_tolerance);
        override_parsed(&lookup, "ROLLCALL_FRAME_SKIP", &mut self.frame_skip);
        override_parsed(&lookup, "ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames);
        override_parsed(&lookup, "ROLLCALL_CAPTURE_ATTEMPTS", &mut self.capture_attempts);
        override_parsed(&lookup, "ROLLCALL_PORT", &mut self.port);
        if let Some(mirror) = lookup("ROLLCALL_MIRROR") {
            self.mirror = mirror != "0" && !mirror.eq_ignore_ascii_case("false");
        }
        if let Some(host) = lookup("ROLLCALL_HOST") {
            self.host = host;
        }
    }

    pub fn tolerances(&self) -> Tolerances {
        Tolerances {
            strict: self.tolerance,
            lenient: self.lenient_tolerance,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `$XDG_DATA_HOME/rollcall/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("rollcall/models")
}

/// `ROLLCALL_CONFIG` if set, else the XDG config file when it exists.
fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("ROLLCALL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let path = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("rollcall/config.toml");
    path.is_file().then_some(path)
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn override_parsed<T, F>(lookup: &F, key: &str, slot: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
        }
    }
}

fn parse_indices(raw: &str) -> Option<Vec<u32>> {
    let indices = raw
        .split(',')
        .map(|part| part.trim().parse().ok())
        .collect::<Option<Vec<u32>>>()?;
    (!indices.is_empty()).then_some(indices)
}
