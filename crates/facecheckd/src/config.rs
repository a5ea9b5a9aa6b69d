use facecheck_core::codec::DecodeLimits;
use facecheck_core::{DistanceMetric, FaceVerifier, PresenceParams, ServiceSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!("unknown bus '{other}'")),
        }
    }
}

/// Daemon configuration: defaults, then the TOML file named by
/// `FACECHECK_CONFIG`, then `FACECHECK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Directory holding stored reference images.
    pub reference_dir: PathBuf,
    pub bus: BusKind,
    /// Minimum SCRFD score for a detection to count.
    pub detector_confidence: f32,
    pub distance_metric: DistanceMetric,
    /// Decision boundary; defaults to the metric's ArcFace threshold.
    pub match_threshold: f32,
    pub presence_scale_factor: f32,
    pub presence_min_neighbors: usize,
    pub presence_min_size: u32,
    pub reference_height: u32,
    pub reference_quality: u8,
    pub max_image_dimension: u32,
    /// Timeout in seconds for one engine round-trip.
    pub request_timeout_secs: u64,
    /// Set once a file or env layer names `match_threshold`; a later metric
    /// change then keeps it instead of falling back to the metric default.
    threshold_explicit: bool,
}

/// Mirror of `Config` where every key is optional, as read from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    reference_dir: Option<PathBuf>,
    bus: Option<BusKind>,
    detector_confidence: Option<f32>,
    distance_metric: Option<DistanceMetric>,
    match_threshold: Option<f32>,
    presence_scale_factor: Option<f32>,
    presence_min_neighbors: Option<usize>,
    presence_min_size: Option<u32>,
    reference_height: Option<u32>,
    reference_quality: Option<u8>,
    max_image_dimension: Option<u32>,
    request_timeout_secs: Option<u64>,
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facecheck")
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        let metric = DistanceMetric::default();
        let presence = PresenceParams::default();
        let settings = ServiceSettings::default();
        Self {
            model_dir: data_dir.join("models"),
            reference_dir: data_dir.join("references"),
            bus: BusKind::default(),
            detector_confidence: facecheck_core::detector::SCRFD_CONFIDENCE_THRESHOLD,
            distance_metric: metric,
            match_threshold: metric.default_threshold(),
            presence_scale_factor: presence.scale_factor,
            presence_min_neighbors: presence.min_neighbors,
            presence_min_size: presence.min_size,
            reference_height: settings.reference_height,
            reference_quality: settings.reference_quality,
            max_image_dimension: settings.decode_limits.max_dimension,
            request_timeout_secs: 10,
            threshold_explicit: false,
        }
    }
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("FACECHECK_CONFIG") {
            config.merge_file(Path::new(&path))?;
        }
        config.merge_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.merge_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "config file applied");
        Ok(())
    }

    fn merge_toml(&mut self, text: &str) -> Result<(), toml::de::Error> {
        let file: FileConfig = toml::from_str(text)?;

        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.reference_dir {
            self.reference_dir = v;
        }
        if let Some(v) = file.bus {
            self.bus = v;
        }
        if let Some(v) = file.detector_confidence {
            self.detector_confidence = v;
        }
        if let Some(v) = file.match_threshold {
            self.match_threshold = v;
            self.threshold_explicit = true;
        }
        if let Some(v) = file.distance_metric {
            self.set_metric(v);
        }
        if let Some(v) = file.presence_scale_factor {
            self.presence_scale_factor = v;
        }
        if let Some(v) = file.presence_min_neighbors {
            self.presence_min_neighbors = v;
        }
        if let Some(v) = file.presence_min_size {
            self.presence_min_size = v;
        }
        if let Some(v) = file.reference_height {
            self.reference_height = v;
        }
        if let Some(v) = file.reference_quality {
            self.reference_quality = v;
        }
        if let Some(v) = file.max_image_dimension {
            self.max_image_dimension = v;
        }
        if let Some(v) = file.request_timeout_secs {
            self.request_timeout_secs = v;
        }
        Ok(())
    }

    fn set_metric(&mut self, metric: DistanceMetric) {
        self.distance_metric = metric;
        if !self.threshold_explicit {
            self.match_threshold = metric.default_threshold();
        }
    }

    /// Overlay `FACECHECK_*` variables supplied by `lookup`.
    fn merge_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("FACECHECK_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACECHECK_REFERENCE_DIR") {
            self.reference_dir = PathBuf::from(v);
        }
        env_parse(&lookup, "FACECHECK_BUS", &mut self.bus)?;
        env_parse(&lookup, "FACECHECK_DETECTOR_CONFIDENCE", &mut self.detector_confidence)?;
        if env_parse(&lookup, "FACECHECK_MATCH_THRESHOLD", &mut self.match_threshold)? {
            self.threshold_explicit = true;
        }
        let mut metric = self.distance_metric;
        if env_parse(&lookup, "FACECHECK_DISTANCE_METRIC", &mut metric)? {
            self.set_metric(metric);
        }
        env_parse(&lookup, "FACECHECK_PRESENCE_SCALE_FACTOR", &mut self.presence_scale_factor)?;
        env_parse(&lookup, "FACECHECK_PRESENCE_MIN_NEIGHBORS", &mut self.presence_min_neighbors)?;
        env_parse(&lookup, "FACECHECK_PRESENCE_MIN_SIZE", &mut self.presence_min_size)?;
        env_parse(&lookup, "FACECHECK_REFERENCE_HEIGHT", &mut self.reference_height)?;
        env_parse(&lookup, "FACECHECK_REFERENCE_QUALITY", &mut self.reference_quality)?;
        env_parse(&lookup, "FACECHECK_MAX_IMAGE_DIMENSION", &mut self.max_image_dimension)?;
        env_parse(&lookup, "FACECHECK_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.presence_scale_factor.is_nan() || self.presence_scale_factor <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "presence_scale_factor must be greater than 1.0, got {}",
                self.presence_scale_factor
            )));
        }
        if self.reference_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "reference_quality must be within 0..=100, got {}",
                self.reference_quality
            )));
        }
        if self.reference_height == 0 || self.max_image_dimension == 0 {
            return Err(ConfigError::Invalid(
                "reference_height and max_image_dimension must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.detector_confidence) {
            return Err(ConfigError::Invalid(format!(
                "detector_confidence must be within 0..=1, got {}",
                self.detector_confidence
            )));
        }
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a non-negative number, got {}",
                self.match_threshold
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be non-zero".into()));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(facecheck_core::SCRFD_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(facecheck_core::ARCFACE_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn verifier(&self) -> FaceVerifier {
        FaceVerifier::new(self.distance_metric, self.match_threshold)
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            decode_limits: DecodeLimits {
                max_dimension: self.max_image_dimension,
            },
            presence: PresenceParams {
                scale_factor: self.presence_scale_factor,
                min_neighbors: self.presence_min_neighbors,
                min_size: self.presence_min_size,
            },
            reference_height: self.reference_height,
            reference_quality: self.reference_quality,
        }
    }
}

/// Parse `key` into `slot` when set. Returns whether the variable was present.
fn env_parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<bool, ConfigError> {
    let Some(value) = lookup(key) else {
        return Ok(false);
    };
    *slot = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.clone(),
    })?;
    Ok(true)
}
