//! Webcam snapshot server.
//!
//! Serves still frames from one live video source, optionally with region
//! detection, cropping and text extraction applied per request.
//!
//! # Architecture
//!
//! Two independent execution contexts share exactly one structure:
//!
//! 1. **Capture supervisor**: a single thread that owns the video source
//!    handle, performs every blocking read and reconnects on failure.
//! 2. **Request handlers**: a fixed pool of HTTP worker threads, each reading
//!    the latest published frame and running the pipeline over it.
//!
//! The `FrameCache` is the handoff between them: single writer, many readers,
//! immutable snapshots swapped under a lock held only for the exchange.
//!
//! # Module Structure
//!
//! - `ingest`: video source descriptors and capture handles (stub, V4L2, GStreamer)
//! - `capture`: the capture supervisor, its state and reconnect backoff
//! - `frame`: published frame snapshots and the single-slot cache
//! - `detect`: window classifiers and the multi-scale region scan
//! - `pipeline`: annotate, crop, resize, OCR and JPEG encoding
//! - `orchestrator`: per-request composition of the pipeline
//! - `api`: the HTTP surface
//! - `config`: startup configuration

pub mod api;
pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod orchestrator;
pub mod pipeline;

pub use capture::{CaptureState, CaptureStats, CaptureStatus, CaptureSupervisor, SupervisorHandle};
pub use config::{ConfigOverrides, ServerConfig};
pub use detect::{load_classifier, Region, WindowClassifier};
pub use error::{ModelLoadError, RequestError, SourceError};
pub use frame::{FrameCache, FrameSnapshot};
pub use ingest::{CaptureHandle, FrameSource, SourceOptions, VideoSource, VideoSourceDescriptor};
pub use orchestrator::{FrameResponse, Orchestrator, PipelineSettings, RequestParameters};
pub use pipeline::TextRecognizer;
