use inference::{DetectorConfig, ModelSelector};
use serde::Deserialize;
use std::path::PathBuf;

pub use common::{Environment, LogLevel};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound for a whole multipart request body
    pub max_upload_bytes: usize,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Staging area for uploads while a detector reads them
    pub upload_dir: PathBuf,
    /// Archive of inputs accepted by the JSON endpoints
    pub result_dir: PathBuf,
    /// Shared root of the `predict*` run directories
    pub runs_root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub model_path: String,
    /// Fallback labels for exports without embedded class names
    #[serde(default)]
    pub class_names: Vec<String>,
    #[serde(flatten)]
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub log_level: LogLevel,
    pub environment: Environment,
    #[serde(default)]
    pub otel_endpoint: Option<String>,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub pole: ModelConfig,
    pub lamp: ModelConfig,
}

impl Config {
    pub fn model(&self, selector: ModelSelector) -> &ModelConfig {
        match selector {
            ModelSelector::Pole => &self.pole,
            ModelSelector::Lamp => &self.lamp,
        }
    }
}

fn set_detector_defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
    selector: ModelSelector,
    model_path: &str,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
    let key = selector.as_str();
    let defaults = DetectorConfig::for_selector(selector);

    builder
        .set_default(format!("{key}.model_path"), model_path)?
        .set_default(format!("{key}.class_names"), vec![key.to_string()])?
        .set_default(format!("{key}.input_size"), defaults.input_size as i64)?
        .set_default(
            format!("{key}.confidence_threshold"),
            defaults.confidence_threshold as f64,
        )?
        .set_default(format!("{key}.iou_threshold"), defaults.iou_threshold as f64)?
        .set_default(format!("{key}.augment"), defaults.augment)?
        .set_default(format!("{key}.max_detections"), defaults.max_detections as i64)
}

/// Layered configuration: built-in defaults, then an optional `gateway.toml`
/// in the working directory, then `GATEWAY_*` environment variables
/// (`GATEWAY_POLE__CONFIDENCE_THRESHOLD=0.25`).
pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let builder = config::Config::builder()
        .set_default("log_level", "info")?
        .set_default("environment", "development")?
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 5000_i64)?
        .set_default("server.max_upload_bytes", 32_i64 * 1024 * 1024)?
        .set_default("storage.upload_dir", "static/images")?
        .set_default("storage.result_dir", "static/results")?
        .set_default("storage.runs_root", inference::runs::DEFAULT_RUNS_ROOT)?;

    let builder = set_detector_defaults(builder, ModelSelector::Pole, "models/pole.onnx")?;
    let builder = set_detector_defaults(builder, ModelSelector::Lamp, "models/lamp.onnx")?;

    let config = builder
        .add_source(config::File::with_name("gateway").required(false))
        .add_source(
            config::Environment::with_prefix("GATEWAY")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("pole.class_names")
                .with_list_parse_key("lamp.class_names")
                .try_parsing(true),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    for selector in ModelSelector::ALL {
        config
            .model(selector)
            .detector
            .validate()
            .map_err(|e| config::ConfigError::Message(format!("{selector}: {e}")))?;
    }

    Ok(config)
}
