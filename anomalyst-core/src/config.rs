//! Configuration system for Anomalyst.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI
//! overrides. Config files may be YAML, TOML or JSON; environment variables use the
//! `ANOMALYST_` prefix with `__` separating nested keys (`ANOMALYST_TRAINER__MAX_EPOCHS=3`).

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ConfigError, Error, Result};

/// Metric names understood by the trainer.
pub const METRIC_NAMES: &[&str] = &["F1Score", "AUROC"];

/// Complete configuration of a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Global seed for weight initialization and data shuffling.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Export the trained model for OpenVINO deployment.
    #[serde(default)]
    pub openvino: bool,
    /// Path to an NNCF (quantization) YAML config. An empty path means unset.
    #[serde(default, deserialize_with = "empty_path_as_none")]
    pub nncf: Option<PathBuf>,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub visualization: VisualizationConfig,
    #[serde(default)]
    pub tiling: TilingConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: Some(42),
            openvino: false,
            nncf: None,
            project: ProjectConfig::default(),
            model: ModelConfig::default(),
            data: DataConfig::default(),
            trainer: TrainerConfig::default(),
            metrics: MetricsConfig::default(),
            visualization: VisualizationConfig::default(),
            tiling: TilingConfig::default(),
        }
    }
}

fn empty_path_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let path = Option::<PathBuf>::deserialize(deserializer)?;
    Ok(path.filter(|p| !p.as_os_str().is_empty()))
}

/// Project-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Where visualizations go when `visualization.image_save_path` is unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// How per-layer distance maps are combined into one anomaly map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyMapMode {
    #[default]
    Add,
    Multiply,
}

/// Reverse distillation model hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name, used for the run directory.
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Network input size as `[height, width]`.
    #[serde(default = "default_input_size")]
    pub input_size: [usize; 2],
    #[serde(default = "default_backbone")]
    pub backbone: String,
    #[serde(default = "default_layers")]
    pub layers: Vec<String>,
    #[serde(default)]
    pub anomaly_map_mode: AnomalyMapMode,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default)]
    pub early_stopping: EarlyStoppingConfig,
    /// Optional pretrained encoder weights (burn record).
    #[serde(default)]
    pub backbone_weights: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            input_size: default_input_size(),
            backbone: default_backbone(),
            layers: default_layers(),
            anomaly_map_mode: AnomalyMapMode::default(),
            lr: default_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            early_stopping: EarlyStoppingConfig::default(),
            backbone_weights: None,
        }
    }
}

fn default_model_name() -> String {
    "reverse_distillation".to_string()
}

fn default_input_size() -> [usize; 2] {
    [256, 256]
}

fn default_backbone() -> String {
    "resnet_tiny".to_string()
}

fn default_layers() -> Vec<String> {
    vec!["layer1".into(), "layer2".into(), "layer3".into()]
}

fn default_lr() -> f64 {
    0.005
}

fn default_beta1() -> f64 {
    0.5
}

fn default_beta2() -> f64 {
    0.99
}

/// Whether a monitored metric should go down or up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    Min,
    #[default]
    Max,
}

impl fmt::Display for MonitorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorMode::Min => write!(f, "min"),
            MonitorMode::Max => write!(f, "max"),
        }
    }
}

/// Early stopping settings, shared by the model section and trainer callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    #[serde(alias = "monitor", default = "default_monitor")]
    pub metric: String,
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default)]
    pub mode: MonitorMode,
    #[serde(default)]
    pub min_delta: f64,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            metric: default_monitor(),
            patience: default_patience(),
            mode: MonitorMode::Max,
            min_delta: 0.0,
        }
    }
}

fn default_monitor() -> String {
    "pixel_AUROC".to_string()
}

fn default_patience() -> usize {
    3
}

/// Dataset settings for the folder datamodule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Datamodule name, used for the run directory.
    #[serde(default = "default_data_name")]
    pub name: String,
    #[serde(default = "default_data_root")]
    pub root: PathBuf,
    #[serde(default = "default_category")]
    pub category: String,
    /// Images are resized to `[height, width]`.
    #[serde(default = "default_input_size")]
    pub image_size: [usize; 2],
    #[serde(default = "default_train_batch")]
    pub train_batch_size: usize,
    #[serde(default = "default_eval_batch")]
    pub eval_batch_size: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            name: default_data_name(),
            root: default_data_root(),
            category: default_category(),
            image_size: default_input_size(),
            train_batch_size: default_train_batch(),
            eval_batch_size: default_eval_batch(),
        }
    }
}

fn default_data_name() -> String {
    "mvtec".to_string()
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./datasets/MVTec")
}

fn default_category() -> String {
    "bottle".to_string()
}

fn default_train_batch() -> usize {
    8
}

fn default_eval_batch() -> usize {
    8
}

/// A callback declared in `trainer.callbacks`.
///
/// Follows the `{class_path, init_args}` shape; only the last path segment of
/// `class_path` is significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEntry {
    pub class_path: String,
    #[serde(default)]
    pub init_args: serde_json::Value,
}

impl CallbackEntry {
    pub fn name(&self) -> &str {
        self.class_path
            .rsplit('.')
            .next()
            .unwrap_or(self.class_path.as_str())
    }
}

/// Trainer loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    #[serde(default)]
    pub default_root_dir: Option<PathBuf>,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default)]
    pub limit_train_batches: Option<usize>,
    #[serde(default = "default_val_every")]
    pub check_val_every_n_epoch: usize,
    #[serde(default)]
    pub resume_from_checkpoint: Option<PathBuf>,
    #[serde(default)]
    pub callbacks: Vec<CallbackEntry>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            default_root_dir: None,
            max_epochs: default_max_epochs(),
            limit_train_batches: None,
            check_val_every_n_epoch: default_val_every(),
            resume_from_checkpoint: None,
            callbacks: Vec::new(),
        }
    }
}

fn default_max_epochs() -> usize {
    200
}

fn default_val_every() -> usize {
    1
}

/// Score normalization applied after thresholding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMethod {
    MinMax,
    Cdf,
}

impl NormalizationMethod {
    /// Parses the configured method; `none` and the empty string disable normalization.
    pub fn parse(method: &str) -> std::result::Result<Option<Self>, ConfigError> {
        match method.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "null" => Ok(None),
            "min_max" => Ok(Some(Self::MinMax)),
            "cdf" => Ok(Some(Self::Cdf)),
            _ => Err(ConfigError::UnknownNormalization {
                method: method.to_string(),
            }),
        }
    }
}

/// Thresholding, metric and normalization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub adaptive_threshold: bool,
    #[serde(default)]
    pub default_image_threshold: Option<f64>,
    #[serde(default)]
    pub default_pixel_threshold: Option<f64>,
    #[serde(default = "default_metric_names")]
    pub image_metric_names: Vec<String>,
    #[serde(default = "default_metric_names")]
    pub pixel_metric_names: Vec<String>,
    #[serde(default = "default_normalization")]
    pub normalization_method: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            adaptive_threshold: true,
            default_image_threshold: None,
            default_pixel_threshold: None,
            image_metric_names: default_metric_names(),
            pixel_metric_names: default_metric_names(),
            normalization_method: default_normalization(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_metric_names() -> Vec<String> {
    METRIC_NAMES.iter().map(|s| s.to_string()).collect()
}

fn default_normalization() -> String {
    "min_max".to_string()
}

/// Visualization display mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisualizationMode {
    Full,
    Simple,
}

impl FromStr for VisualizationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "simple" => Ok(Self::Simple),
            other => Err(ConfigError::UnknownVisualizationMode {
                mode: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for VisualizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Simple => write!(f, "simple"),
        }
    }
}

/// Task type, which decides the visualization layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Classification,
    Segmentation,
}

impl FromStr for Task {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "classification" => Ok(Self::Classification),
            "segmentation" => Ok(Self::Segmentation),
            other => Err(ConfigError::UnknownTask {
                task: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classification => write!(f, "classification"),
            Self::Segmentation => write!(f, "segmentation"),
        }
    }
}

/// Output sinks and layout of rendered predictions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizationConfig {
    #[serde(default = "default_vis_mode")]
    pub mode: String,
    #[serde(default = "default_vis_task")]
    pub task: String,
    #[serde(default)]
    pub image_save_path: Option<PathBuf>,
    #[serde(default)]
    pub save_images: bool,
    #[serde(default)]
    pub show_images: bool,
    #[serde(default)]
    pub log_images: bool,
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        Self {
            mode: default_vis_mode(),
            task: default_vis_task(),
            image_save_path: None,
            save_images: false,
            show_images: false,
            log_images: false,
        }
    }
}

impl VisualizationConfig {
    pub fn parsed_mode(&self) -> std::result::Result<VisualizationMode, ConfigError> {
        self.mode.parse()
    }

    pub fn parsed_task(&self) -> std::result::Result<Task, ConfigError> {
        self.task.parse()
    }

    /// True when at least one output sink is enabled.
    pub fn any_sink(&self) -> bool {
        self.save_images || self.show_images || self.log_images
    }
}

fn default_vis_mode() -> String {
    "full".to_string()
}

fn default_vis_task() -> String {
    "segmentation".to_string()
}

/// Tiled inference settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TilingConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub tile_size: Option<usize>,
    #[serde(default)]
    pub stride: Option<usize>,
}

impl TilingConfig {
    /// Returns `(tile_size, stride)` when tiling is enabled and well formed.
    pub fn resolved(&self) -> std::result::Result<Option<(usize, usize)>, ConfigError> {
        if !self.enable {
            return Ok(None);
        }
        let tile = self.tile_size.ok_or_else(|| ConfigError::InvalidTiling {
            reason: "tiling.tile_size is required when tiling is enabled".into(),
        })?;
        let stride = self.stride.unwrap_or(tile);
        if tile == 0 || stride == 0 {
            return Err(ConfigError::InvalidTiling {
                reason: "tile_size and stride must be positive".into(),
            });
        }
        if stride > tile {
            return Err(ConfigError::InvalidTiling {
                reason: format!("stride {stride} larger than tile size {tile} leaves gaps"),
            });
        }
        Ok(Some((tile, stride)))
    }
}

impl RunConfig {
    /// The NNCF config path, if one is set. An empty path counts as unset.
    pub fn nncf_config(&self) -> Option<&Path> {
        self.nncf.as_deref().filter(|p| !p.as_os_str().is_empty())
    }

    /// Validate every enum-like setting, failing fast on the first problem.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.visualization.parsed_mode()?;
        self.visualization.parsed_task()?;
        NormalizationMethod::parse(&self.metrics.normalization_method)?;

        for name in self
            .metrics
            .image_metric_names
            .iter()
            .chain(self.metrics.pixel_metric_names.iter())
        {
            if !METRIC_NAMES.contains(&name.as_str()) {
                return Err(ConfigError::UnknownMetric { name: name.clone() });
            }
        }

        if self.openvino && self.nncf_config().is_some() {
            return Err(ConfigError::ExportConflict);
        }

        if self.trainer.max_epochs == 0 {
            return Err(ConfigError::invalid(
                "trainer.max_epochs",
                "must be at least 1",
            ));
        }
        if self.data.train_batch_size == 0 || self.data.eval_batch_size == 0 {
            return Err(ConfigError::invalid("data.*_batch_size", "must be at least 1"));
        }
        if self.model.lr.is_nan() || self.model.lr <= 0.0 {
            return Err(ConfigError::invalid("model.lr", "must be positive"));
        }
        if self.model.input_size != self.data.image_size {
            return Err(ConfigError::invalid(
                "model.input_size",
                format!(
                    "{:?} must match data.image_size {:?}",
                    self.model.input_size, self.data.image_size
                ),
            ));
        }
        if !self.metrics.adaptive_threshold
            && (self.metrics.default_image_threshold.is_none()
                || self.metrics.default_pixel_threshold.is_none())
        {
            return Err(ConfigError::invalid(
                "metrics.default_*_threshold",
                "both thresholds are required when adaptive_threshold is false",
            ));
        }

        if let Some((tile, _)) = self.tiling.resolved()? {
            let [h, w] = self.data.image_size;
            if tile > h || tile > w {
                return Err(ConfigError::InvalidTiling {
                    reason: format!("tile size {tile} exceeds image size {h}x{w}"),
                });
            }
        }
        Ok(())
    }
}

/// Parse a `key.path=value` override. The value is read as a YAML scalar, so
/// `true`, `3`, `0.5` and `null` keep their types.
pub fn parse_override(raw: &str) -> std::result::Result<(String, serde_yaml::Value), ConfigError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| ConfigError::invalid(raw, "overrides must look like key.path=value"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigError::invalid(raw, "override key is empty"));
    }
    let value = serde_yaml::from_str(value.trim())
        .unwrap_or_else(|_| serde_yaml::Value::String(value.trim().to_string()));
    Ok((key.to_string(), value))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit `key.path=value` overrides
/// 2. Environment variables (prefixed with `ANOMALYST_`)
/// 3. Config file (`.yaml`, `.yml`, `.toml` or `.json`)
/// 4. Built-in defaults
pub fn load_config(config_file: Option<&Path>, overrides: &[String]) -> Result<RunConfig> {
    let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file not found: {}", path.display()),
            )));
        }
        figment = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => figment.merge(Toml::file(path)),
            Some("json") => figment.merge(Json::file(path)),
            _ => figment.merge(Yaml::file(path)),
        };
    }

    figment = figment.merge(Env::prefixed("ANOMALYST_").split("__"));

    for raw in overrides {
        let (key, value) = parse_override(raw)?;
        tracing::debug!(key = %key, "Applying configuration override");
        figment = figment.merge(Serialized::global(&key, value));
    }

    let config: RunConfig = figment.extract().map_err(Box::new)?;
    Ok(config)
}
