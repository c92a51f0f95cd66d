use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::artifact::{FixedLocation, LocationResolver, RandomLetter};
use crate::transport::{ImageMethod, RetryPolicy};

const DEFAULT_OUTPUT_DIR: &str = "captures";
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_LEFT_THRESHOLD: u32 = 100;
const DEFAULT_PIXELS_PER_UNIT: f64 = 10.0;
const DEFAULT_POSITION: &str = "unknown";
const DEFAULT_MATERIAL: &str = "concrete";
const DEFAULT_FRAME_INTERVAL_MS: u64 = 1000;
const DEFAULT_JPEG_QUALITY: u8 = 90;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_BACKOFF_MS: u64 = 2000;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_RETRY_AFTER_SECS: u64 = 300;
const DEFAULT_DEBUG_BODY_LEN: usize = 300;

#[derive(Debug, Deserialize, Default)]
struct RunConfigFile {
    output_dir: Option<PathBuf>,
    left_threshold: Option<u32>,
    pixels_per_unit: Option<f64>,
    position: Option<String>,
    material: Option<String>,
    frame_interval_ms: Option<u64>,
    location: Option<String>,
    jpeg_quality: Option<u8>,
    upload: Option<UploadConfigFile>,
    transport: Option<TransportConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadConfigFile {
    endpoint: Option<String>,
    api_key: Option<String>,
    image_method: Option<String>,
    background: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct TransportConfigFile {
    max_attempts: Option<u32>,
    base_backoff_ms: Option<u64>,
    timeout_ms: Option<u64>,
    max_retry_after_secs: Option<u64>,
    debug_body_len: Option<usize>,
    verbose_diagnostics: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    model_path: Option<PathBuf>,
    script_path: Option<PathBuf>,
    input_size: Option<u32>,
    class_names: Option<Vec<String>>,
    confidence: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub output_dir: PathBuf,
    /// Pixel x-coordinate of the leading margin.
    pub left_threshold: u32,
    pub pixels_per_unit: f64,
    pub position: String,
    pub material: String,
    pub frame_interval: Duration,
    pub location_policy: LocationPolicy,
    pub jpeg_quality: u8,
    pub upload: UploadSettings,
    pub transport: TransportSettings,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone, Default)]
pub struct UploadSettings {
    /// No endpoint means local persistence only.
    pub endpoint: Option<Url>,
    pub api_key: Option<String>,
    pub image_method: ImageMethod,
    pub background: bool,
}

impl UploadSettings {
    pub fn enabled(&self) -> bool {
        self.endpoint.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub timeout: Duration,
    pub max_retry_after: Duration,
    pub debug_body_len: usize,
    pub verbose_diagnostics: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_retry_after: Duration::from_secs(DEFAULT_MAX_RETRY_AFTER_SECS),
            debug_body_len: DEFAULT_DEBUG_BODY_LEN,
            verbose_diagnostics: true,
        }
    }
}

impl TransportSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: self.base_backoff,
            max_retry_after: self.max_retry_after,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub model_path: Option<PathBuf>,
    /// Replay file for offline runs; takes precedence over `model_path`.
    pub script_path: Option<PathBuf>,
    pub input_size: u32,
    pub class_names: Vec<String>,
    pub confidence: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            script_path: None,
            input_size: DEFAULT_INPUT_SIZE,
            class_names: Vec::new(),
            confidence: DEFAULT_CONFIDENCE,
        }
    }
}

/// How `crack_location` is filled in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LocationPolicy {
    /// Random uppercase letter. A placeholder, not a measurement.
    #[default]
    Random,
    Fixed(String),
}

impl LocationPolicy {
    pub fn resolver(&self) -> Box<dyn LocationResolver> {
        match self {
            LocationPolicy::Random => Box::new(RandomLetter),
            LocationPolicy::Fixed(label) => Box::new(FixedLocation(label.clone())),
        }
    }
}

impl FromStr for LocationPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("random") {
            return Ok(LocationPolicy::Random);
        }
        match s.strip_prefix("fixed:") {
            Some(label) if !label.trim().is_empty() => {
                Ok(LocationPolicy::Fixed(label.trim().to_string()))
            }
            _ => Err(anyhow!(
                "location policy must be 'random' or 'fixed:<label>', got '{}'",
                s
            )),
        }
    }
}

/// Where frames come from. Exactly one per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelection {
    Folder(PathBuf),
    Camera(String),
}

impl SourceSelection {
    pub fn from_parts(folder: Option<PathBuf>, camera: Option<String>) -> Result<Self> {
        match (folder, camera) {
            (Some(folder), None) => Ok(SourceSelection::Folder(folder)),
            (None, Some(camera)) if !camera.trim().is_empty() => {
                Ok(SourceSelection::Camera(camera))
            }
            (None, Some(_)) => Err(anyhow!("camera device must not be empty")),
            (Some(_), Some(_)) => Err(anyhow!("choose either a source folder or a camera, not both")),
            (None, None) => Err(anyhow!("a source folder or a camera device is required")),
        }
    }
}

/// Command-line layer. `None` leaves the file/env value in place.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub output_dir: Option<PathBuf>,
    pub confidence: Option<f32>,
    pub left_threshold: Option<u32>,
    pub pixels_per_unit: Option<f64>,
    pub position: Option<String>,
    pub material: Option<String>,
    pub location: Option<String>,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub image_method: Option<String>,
    pub background_upload: bool,
    pub model_path: Option<PathBuf>,
    pub class_names: Option<String>,
    pub script_path: Option<PathBuf>,
}

impl ConfigOverrides {
    pub fn apply(&self, cfg: &mut RunConfig) -> Result<()> {
        if let Some(output) = &self.output_dir {
            cfg.output_dir = output.clone();
        }
        if let Some(conf) = self.confidence {
            cfg.detector.confidence = conf;
        }
        if let Some(threshold) = self.left_threshold {
            cfg.left_threshold = threshold;
        }
        if let Some(ppu) = self.pixels_per_unit {
            cfg.pixels_per_unit = ppu;
        }
        if let Some(position) = &self.position {
            cfg.position = position.clone();
        }
        if let Some(material) = &self.material {
            cfg.material = material.clone();
        }
        if let Some(location) = &self.location {
            cfg.location_policy = location.parse()?;
        }
        if let Some(endpoint) = &self.endpoint {
            cfg.upload.endpoint = Some(parse_endpoint(endpoint)?);
        }
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            cfg.upload.api_key = Some(key.clone());
        }
        if let Some(method) = &self.image_method {
            cfg.upload.image_method = method.parse::<ImageMethod>()?;
        }
        if self.background_upload {
            cfg.upload.background = true;
        }
        if let Some(model) = &self.model_path {
            cfg.detector.model_path = Some(model.clone());
        }
        if let Some(names) = &self.class_names {
            cfg.detector.class_names = split_csv(names);
        }
        if let Some(script) = &self.script_path {
            cfg.detector.script_path = Some(script.clone());
        }
        Ok(())
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            left_threshold: DEFAULT_LEFT_THRESHOLD,
            pixels_per_unit: DEFAULT_PIXELS_PER_UNIT,
            position: DEFAULT_POSITION.to_string(),
            material: DEFAULT_MATERIAL.to_string(),
            frame_interval: Duration::from_millis(DEFAULT_FRAME_INTERVAL_MS),
            location_policy: LocationPolicy::Random,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            upload: UploadSettings::default(),
            transport: TransportSettings::default(),
            detector: DetectorSettings::default(),
        }
    }
}

impl RunConfig {
    /// Load from `path` (or `CRACK_CONFIG` when `path` is `None`), apply
    /// `CRACK_*` environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg = Self::load_layered(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// File and environment layers only. Callers that add command-line
    /// overrides validate once those are applied.
    pub fn load_layered(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("CRACK_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => RunConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Layer file, environment and `overrides`, then validate the result.
    pub fn resolve(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut cfg = Self::load_layered(path)?;
        overrides.apply(&mut cfg)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RunConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let upload = file.upload.unwrap_or_default();
        let transport = file.transport.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();

        let endpoint = upload
            .endpoint
            .filter(|e| !e.trim().is_empty())
            .map(|e| parse_endpoint(&e))
            .transpose()?;
        let image_method = match upload.image_method {
            Some(method) => method.parse()?,
            None => ImageMethod::default(),
        };
        let location_policy = match file.location {
            Some(policy) => policy.parse()?,
            None => defaults.location_policy,
        };

        Ok(Self {
            output_dir: file.output_dir.unwrap_or(defaults.output_dir),
            left_threshold: file.left_threshold.unwrap_or(defaults.left_threshold),
            pixels_per_unit: file.pixels_per_unit.unwrap_or(defaults.pixels_per_unit),
            position: file.position.unwrap_or(defaults.position),
            material: file.material.unwrap_or(defaults.material),
            frame_interval: file
                .frame_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.frame_interval),
            location_policy,
            jpeg_quality: file.jpeg_quality.unwrap_or(defaults.jpeg_quality),
            upload: UploadSettings {
                endpoint,
                api_key: upload.api_key.filter(|k| !k.is_empty()),
                image_method,
                background: upload.background.unwrap_or(false),
            },
            transport: TransportSettings {
                max_attempts: transport
                    .max_attempts
                    .unwrap_or(defaults.transport.max_attempts),
                base_backoff: transport
                    .base_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.transport.base_backoff),
                timeout: transport
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.transport.timeout),
                max_retry_after: transport
                    .max_retry_after_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.transport.max_retry_after),
                debug_body_len: transport
                    .debug_body_len
                    .unwrap_or(defaults.transport.debug_body_len),
                verbose_diagnostics: transport
                    .verbose_diagnostics
                    .unwrap_or(defaults.transport.verbose_diagnostics),
            },
            detector: DetectorSettings {
                model_path: detector.model_path,
                script_path: detector.script_path,
                input_size: detector.input_size.unwrap_or(defaults.detector.input_size),
                class_names: detector.class_names.unwrap_or_default(),
                confidence: detector.confidence.unwrap_or(defaults.detector.confidence),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = env_nonempty("CRACK_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(endpoint) = env_nonempty("CRACK_ENDPOINT") {
            self.upload.endpoint = Some(parse_endpoint(&endpoint)?);
        }
        if let Some(key) = env_nonempty("CRACK_API_KEY") {
            self.upload.api_key = Some(key);
        }
        if let Some(threshold) = env_nonempty("CRACK_LEFT_THRESHOLD") {
            self.left_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("CRACK_LEFT_THRESHOLD must be a non-negative integer"))?;
        }
        if let Some(ppu) = env_nonempty("CRACK_PIXELS_PER_UNIT") {
            self.pixels_per_unit = ppu
                .parse()
                .map_err(|_| anyhow!("CRACK_PIXELS_PER_UNIT must be a number"))?;
        }
        if let Some(position) = env_nonempty("CRACK_POSITION") {
            self.position = position;
        }
        if let Some(material) = env_nonempty("CRACK_MATERIAL") {
            self.material = material;
        }
        if let Some(confidence) = env_nonempty("CRACK_CONFIDENCE") {
            self.detector.confidence = confidence
                .parse()
                .map_err(|_| anyhow!("CRACK_CONFIDENCE must be a number"))?;
        }
        if let Some(attempts) = env_nonempty("CRACK_MAX_ATTEMPTS") {
            self.transport.max_attempts = attempts
                .parse()
                .map_err(|_| anyhow!("CRACK_MAX_ATTEMPTS must be a positive integer"))?;
        }
        Ok(())
    }

    /// Check cross-field constraints on the fully layered config.
    pub fn validate(&self) -> Result<()> {
        if !(self.pixels_per_unit.is_finite() && self.pixels_per_unit > 0.0) {
            return Err(anyhow!("pixels_per_unit must be greater than zero"));
        }
        let confidence = self.detector.confidence;
        if !(confidence > 0.0 && confidence <= 1.0) {
            return Err(anyhow!("confidence must be in (0, 1], got {}", confidence));
        }
        if self.transport.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be at least 1"));
        }
        if self.frame_interval.is_zero() {
            return Err(anyhow!("frame interval must be greater than zero"));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(anyhow!("jpeg_quality must be in 1..=100"));
        }
        if let Some(endpoint) = &self.upload.endpoint {
            if !matches!(endpoint.scheme(), "http" | "https") {
                return Err(anyhow!("endpoint must be an http(s) URL, got {}", endpoint));
            }
            if self.upload.api_key.is_none() {
                return Err(anyhow!(
                    "an api key is required when an endpoint is configured (CRACK_API_KEY)"
                ));
            }
        }
        Ok(())
    }
}

pub fn parse_endpoint(raw: &str) -> Result<Url> {
    Url::parse(raw.trim()).map_err(|e| anyhow!("invalid endpoint '{}': {}", raw, e))
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<RunConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

/// Split a comma-separated list, dropping blanks.
pub fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
