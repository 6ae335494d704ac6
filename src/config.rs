//! Application settings. Defaults are overridden by an optional TOML file,
//! which is in turn overridden by `CROPDETECT__*` environment variables
//! (for example `CROPDETECT__SERVER__PORT=9000`).

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default settings file, read when present
pub const DEFAULT_CONFIG_FILE: &str = "cropdetect.toml";

/// Default `RUST_LOG` filter
pub const RUST_LOG: &str = "info,actix_web=info";

/// Image extensions the uploader accepts
pub const ACCEPTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Message shown when the model finds nothing
pub const NO_DETECTIONS_MESSAGE: &str = "No nutrient deficiency detected in this image.";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub model: ModelSettings,
    #[serde(default)]
    pub annotate: AnnotateSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Upper bound on a JSON request body (base64 image included)
    pub max_payload_bytes: usize,
}

/// Where to run inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    /// CUDA when available, CPU otherwise
    Auto,
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Path to the TorchScript export of the detector
    pub path: PathBuf,
    pub device: DeviceChoice,
    /// Side of the square network input
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    /// Label per class id, in the order the model was trained with
    pub class_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnnotateSettings {
    /// TrueType font for box labels, replacing the bundled DejaVu Sans
    pub font_path: Option<PathBuf>,
    /// Box outline width in pixels; scaled with each image when unset
    pub line_width: Option<u32>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        ModelSettings {
            path: PathBuf::from("best.torchscript"),
            device: DeviceChoice::Auto,
            input_size: 640,
            confidence_threshold: 0.25,
            iou_threshold: 0.7,
            max_detections: 300,
            class_names: vec![],
        }
    }
}

impl Settings {
    /// Load settings from `path` (if it exists) and the environment
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::builder()?
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("CROPDETECT").separator("__"))
            .build()?
            .try_deserialize::<Settings>()?
            .validated()
    }

    /// Reject values the pipeline cannot run with
    fn validated(self) -> Result<Self, ConfigError> {
        let model = &self.model;
        if model.input_size == 0 {
            return Err(invalid("model.input_size must be positive"));
        }
        if !(0.0..=1.0).contains(&model.confidence_threshold) {
            return Err(invalid(format!(
                "model.confidence_threshold must be within [0, 1], got {}",
                model.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&model.iou_threshold) {
            return Err(invalid(format!(
                "model.iou_threshold must be within [0, 1], got {}",
                model.iou_threshold
            )));
        }
        if model.max_detections == 0 {
            return Err(invalid("model.max_detections must be positive"));
        }
        if self.annotate.line_width == Some(0) {
            return Err(invalid("annotate.line_width must be positive"));
        }
        Ok(self)
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let model = ModelSettings::default();
        Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8501)?
            .set_default("server.max_payload_bytes", 32 * 1024 * 1024)?
            .set_default("model.path", model.path.to_string_lossy().to_string())?
            .set_default("model.device", "auto")?
            .set_default("model.input_size", model.input_size as i64)?
            .set_default("model.confidence_threshold", model.confidence_threshold as f64)?
            .set_default("model.iou_threshold", model.iou_threshold as f64)?
            .set_default("model.max_detections", model.max_detections as i64)?
            .set_default("model.class_names", Vec::<String>::new())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Message(msg.into())
}
