use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{BackoffPolicy, SupervisorConfig};
use crate::api::ApiConfig;
use crate::detect::{ScanParams, DEFAULT_MAX_HITS};
use crate::ingest::{SourceOptions, VideoSourceDescriptor};
use crate::orchestrator::PipelineSettings;
use crate::pipeline::DEFAULT_WHITELIST;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8888";
const DEFAULT_CAMERA_INDEX: u32 = 0;
const DEFAULT_CAMERA_WIDTH: u32 = 1920;
const DEFAULT_CAMERA_HEIGHT: u32 = 1080;
const DEFAULT_READ_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 100;
const DEFAULT_BACKOFF_MAX_MS: u64 = 5_000;
const DEFAULT_MODEL_PATH: &str = "models/region_classifier.onnx";
const DEFAULT_WINDOW: (u32, u32) = (24, 8);
const DEFAULT_SCALE_FACTOR: f64 = 1.1;
const DEFAULT_MIN_NEIGHBORS: u32 = 5;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
const DEFAULT_HTTP_WORKERS: usize = 4;
const DEFAULT_HTTP_QUEUE: usize = 8;
const DEFAULT_ENVELOPE: (u32, u32) = (640, 480);
const DEFAULT_JPEG_QUALITY: u8 = 90;
const DEFAULT_OCR_LANGUAGE: &str = "eng";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ServerConfigFile {
    listen_addr: Option<String>,
    http: Option<HttpConfigFile>,
    camera: Option<CameraConfigFile>,
    reconnect: Option<ReconnectConfigFile>,
    detection: Option<DetectionConfigFile>,
    output: Option<OutputConfigFile>,
    ocr: Option<OcrConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct HttpConfigFile {
    workers: Option<usize>,
    queue: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    index: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    uri: Option<String>,
    read_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ReconnectConfigFile {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectionConfigFile {
    model: Option<String>,
    window_width: Option<u32>,
    window_height: Option<u32>,
    scale_factor: Option<f64>,
    min_neighbors: Option<u32>,
    min_width: Option<u32>,
    min_height: Option<u32>,
    max_hits: Option<usize>,
    threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OutputConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OcrConfigFile {
    whitelist: Option<String>,
    language: Option<String>,
    datapath: Option<String>,
}

/// Values supplied on the command line. They win over everything else.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub listen_addr: Option<String>,
    pub camera_index: Option<u32>,
    pub camera_width: Option<u32>,
    pub camera_height: Option<u32>,
    pub camera_uri: Option<String>,
    pub model_path: Option<String>,
    pub max_reconnect_attempts: Option<u32>,
}

/// Fully resolved server configuration.
///
/// Resolved once at startup: CLI override > environment > TOML file
/// (`WEBCAM_CONFIG`) > defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub http: HttpSettings,
    pub camera: CameraSettings,
    pub reconnect: ReconnectSettings,
    pub detection: DetectionSettings,
    pub output: OutputSettings,
    pub ocr: OcrSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpSettings {
    /// Request handler threads.
    pub workers: usize,
    /// Accepted connections waiting for a handler before new ones get 503.
    pub queue: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    /// Remote stream; replaces local device selection when set.
    pub uri: Option<String>,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSettings {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    pub model_path: String,
    pub window: (u32, u32),
    pub scale_factor: f64,
    pub min_neighbors: u32,
    pub min_size: (u32, u32),
    pub max_hits: usize,
    /// Model score a window needs to count as a hit.
    pub score_threshold: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSettings {
    pub envelope: (u32, u32),
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrSettings {
    pub whitelist: String,
    pub language: String,
    pub datapath: Option<String>,
}

impl ServerConfig {
    /// Resolve the configuration from defaults, file, environment and `overrides`.
    pub fn load(overrides: &ConfigOverrides) -> Result<Self> {
        let config_path = overrides.config_path.clone().or_else(|| {
            std::env::var("WEBCAM_CONFIG")
                .ok()
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from)
        });
        let file_cfg = match config_path.as_deref() {
            Some(path) => read_config_file(path)?,
            None => ServerConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.apply_overrides(overrides);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServerConfigFile) -> Self {
        let http = file.http.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let reconnect = file.reconnect.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let output = file.output.unwrap_or_default();
        let ocr = file.ocr.unwrap_or_default();

        Self {
            listen_addr: file
                .listen_addr
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            http: HttpSettings {
                workers: http.workers.unwrap_or(DEFAULT_HTTP_WORKERS),
                queue: http.queue.unwrap_or(DEFAULT_HTTP_QUEUE),
            },
            camera: CameraSettings {
                index: camera.index.unwrap_or(DEFAULT_CAMERA_INDEX),
                width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
                uri: camera.uri,
                read_timeout: Duration::from_millis(
                    camera.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
                ),
            },
            reconnect: ReconnectSettings {
                initial_backoff: Duration::from_millis(
                    reconnect
                        .initial_backoff_ms
                        .unwrap_or(DEFAULT_BACKOFF_INITIAL_MS),
                ),
                max_backoff: Duration::from_millis(
                    reconnect.max_backoff_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS),
                ),
                max_attempts: reconnect.max_attempts.filter(|attempts| *attempts > 0),
            },
            detection: DetectionSettings {
                model_path: detection
                    .model
                    .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string()),
                window: (
                    detection.window_width.unwrap_or(DEFAULT_WINDOW.0),
                    detection.window_height.unwrap_or(DEFAULT_WINDOW.1),
                ),
                scale_factor: detection.scale_factor.unwrap_or(DEFAULT_SCALE_FACTOR),
                min_neighbors: detection.min_neighbors.unwrap_or(DEFAULT_MIN_NEIGHBORS),
                min_size: (
                    detection.min_width.unwrap_or(0),
                    detection.min_height.unwrap_or(0),
                ),
                max_hits: detection.max_hits.unwrap_or(DEFAULT_MAX_HITS),
                score_threshold: detection.threshold.unwrap_or(DEFAULT_SCORE_THRESHOLD),
            },
            output: OutputSettings {
                envelope: (
                    output.width.unwrap_or(DEFAULT_ENVELOPE.0),
                    output.height.unwrap_or(DEFAULT_ENVELOPE.1),
                ),
                jpeg_quality: output.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            ocr: OcrSettings {
                whitelist: ocr
                    .whitelist
                    .unwrap_or_else(|| DEFAULT_WHITELIST.to_string()),
                language: ocr
                    .language
                    .unwrap_or_else(|| DEFAULT_OCR_LANGUAGE.to_string()),
                datapath: ocr.datapath,
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_string("WEBCAM_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(index) = env_parse::<u32>("CAMERA_INDEX")? {
            self.camera.index = index;
        }
        if let Some(width) = env_parse::<u32>("CAMERA_WIDTH")? {
            self.camera.width = width;
        }
        if let Some(height) = env_parse::<u32>("CAMERA_HEIGHT")? {
            self.camera.height = height;
        }
        if let Some(uri) = env_string("CAMERA_URI") {
            self.camera.uri = Some(uri);
        }
        if let Some(model) = env_string("DETECTION_MODEL") {
            self.detection.model_path = model;
        }
        if let Some(whitelist) = env_string("OCR_WHITELIST") {
            self.ocr.whitelist = whitelist;
        }
        if let Some(attempts) = env_parse::<u32>("RECONNECT_MAX_ATTEMPTS")? {
            self.reconnect.max_attempts = (attempts > 0).then_some(attempts);
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(addr) = &overrides.listen_addr {
            self.listen_addr = addr.clone();
        }
        if let Some(index) = overrides.camera_index {
            self.camera.index = index;
        }
        if let Some(width) = overrides.camera_width {
            self.camera.width = width;
        }
        if let Some(height) = overrides.camera_height {
            self.camera.height = height;
        }
        if let Some(uri) = &overrides.camera_uri {
            self.camera.uri = Some(uri.clone());
        }
        if let Some(model) = &overrides.model_path {
            self.detection.model_path = model.clone();
        }
        if let Some(attempts) = overrides.max_reconnect_attempts {
            self.reconnect.max_attempts = (attempts > 0).then_some(attempts);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            bail!("listen address must not be empty");
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            bail!(
                "camera size must be non-zero, got {}x{}",
                self.camera.width,
                self.camera.height
            );
        }
        if let Some(uri) = &self.camera.uri {
            if uri.trim().is_empty() {
                bail!("camera uri must not be blank");
            }
        }
        if self.reconnect.initial_backoff > self.reconnect.max_backoff {
            bail!(
                "initial reconnect backoff {:?} exceeds ceiling {:?}",
                self.reconnect.initial_backoff,
                self.reconnect.max_backoff
            );
        }
        if self.detection.model_path.trim().is_empty() {
            bail!("detection model path must not be empty");
        }
        if self.detection.window.0 == 0 || self.detection.window.1 == 0 {
            bail!("detection window must be non-zero");
        }
        if self.detection.scale_factor.is_nan() || self.detection.scale_factor <= 1.0 {
            bail!(
                "detection scale factor must be greater than 1.0, got {}",
                self.detection.scale_factor
            );
        }
        if self.detection.max_hits == 0 {
            bail!("detection max_hits must be non-zero");
        }
        if !self.detection.score_threshold.is_finite() {
            bail!(
                "detection threshold must be finite, got {}",
                self.detection.score_threshold
            );
        }
        if self.http.workers == 0 {
            bail!("http workers must be non-zero");
        }
        if self.output.envelope.0 == 0 || self.output.envelope.1 == 0 {
            bail!("output envelope must be non-zero");
        }
        if !(1..=100).contains(&self.output.jpeg_quality) {
            bail!(
                "jpeg quality must be within 1..=100, got {}",
                self.output.jpeg_quality
            );
        }
        Ok(())
    }

    /// The configured video source. A URI replaces the local device.
    pub fn descriptor(&self) -> VideoSourceDescriptor {
        match &self.camera.uri {
            Some(uri) => VideoSourceDescriptor::Remote { uri: uri.clone() },
            None => VideoSourceDescriptor::Local {
                device_index: self.camera.index,
                width: self.camera.width,
                height: self.camera.height,
            },
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: self.listen_addr.clone(),
            workers: self.http.workers,
            queue: self.http.queue,
        }
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            read_timeout: self.camera.read_timeout,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            backoff: BackoffPolicy {
                initial: self.reconnect.initial_backoff,
                max: self.reconnect.max_backoff,
            },
            max_reconnect_attempts: self.reconnect.max_attempts,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            scan: ScanParams {
                scale_factor: self.detection.scale_factor,
                min_neighbors: self.detection.min_neighbors,
                min_size: self.detection.min_size,
                max_size: None,
                max_hits: self.detection.max_hits,
            },
            envelope: self.output.envelope,
            jpeg_quality: self.output.jpeg_quality,
            ocr_whitelist: self.ocr.whitelist.clone(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<ServerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer, got '{}'", key, raw)),
        None => Ok(None),
    }
}
