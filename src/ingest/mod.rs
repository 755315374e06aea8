//! Video source handles.
//!
//! A `VideoSourceDescriptor` names one local device or one remote stream.
//! `FrameSource::open` turns it into a `CaptureHandle`, which performs blocking
//! reads until it fails. A failed handle is never reused: the capture
//! supervisor closes it and opens a fresh one.
//!
//! Backends:
//! - `stub://` URIs: deterministic synthetic frames (always available)
//! - local devices: V4L2 (`ingest-v4l2` feature)
//! - remote URIs: GStreamer (`rtsp-gstreamer` feature)
//!
//! Handles are owned by exactly one thread and are never shared.

use image::RgbImage;
use std::fmt;
use std::time::Duration;

use crate::error::SourceError;

mod normalize;
#[cfg(feature = "rtsp-gstreamer")]
pub mod remote;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use synthetic::SyntheticHandle;

pub const STUB_SCHEME: &str = "stub://";

/// Which video source to capture from. Resolved once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VideoSourceDescriptor {
    /// Local capture device `/dev/video<device_index>`. Width and height are hints.
    Local {
        device_index: u32,
        width: u32,
        height: u32,
    },
    /// Network stream (or `stub://`). The stream dictates its own resolution.
    Remote { uri: String },
}

impl fmt::Display for VideoSourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local {
                device_index,
                width,
                height,
            } => write!(f, "/dev/video{device_index} ({width}x{height} requested)"),
            Self::Remote { uri } => f.write_str(uri),
        }
    }
}

/// An open capture device.
pub trait CaptureHandle: Send {
    /// One blocking read. An error means the handle must be discarded.
    fn read_frame(&mut self) -> Result<RgbImage, SourceError>;

    /// Release underlying resources. Calling it again is a no-op.
    fn close(&mut self);
}

/// Something that can open capture handles.
pub trait FrameSource: Send {
    type Handle: CaptureHandle;

    fn open(&mut self) -> Result<Self::Handle, SourceError>;

    /// Human readable source name for logs.
    fn name(&self) -> String;
}

/// Settings applied to every handle opened from a descriptor.
#[derive(Clone, Copy, Debug)]
pub struct SourceOptions {
    /// Best-effort read timeout. Backends without support log and continue.
    pub read_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(2_000),
        }
    }
}

/// `FrameSource` built from a `VideoSourceDescriptor`.
#[derive(Clone, Debug)]
pub struct VideoSource {
    descriptor: VideoSourceDescriptor,
    options: SourceOptions,
}

impl VideoSource {
    pub fn new(descriptor: VideoSourceDescriptor, options: SourceOptions) -> Self {
        Self {
            descriptor,
            options,
        }
    }

    pub fn descriptor(&self) -> &VideoSourceDescriptor {
        &self.descriptor
    }
}

impl FrameSource for VideoSource {
    type Handle = VideoHandle;

    fn open(&mut self) -> Result<VideoHandle, SourceError> {
        match &self.descriptor {
            VideoSourceDescriptor::Remote { uri } if uri.starts_with(STUB_SCHEME) => {
                Ok(VideoHandle::Synthetic(SyntheticHandle::open(uri)?))
            }
            VideoSourceDescriptor::Local {
                device_index,
                width,
                height,
            } => open_local(*device_index, *width, *height, self.options),
            VideoSourceDescriptor::Remote { uri } => open_remote(uri, self.options),
        }
    }

    fn name(&self) -> String {
        self.descriptor.to_string()
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_local(
    device_index: u32,
    width: u32,
    height: u32,
    options: SourceOptions,
) -> Result<VideoHandle, SourceError> {
    v4l2::V4l2Handle::open(device_index, width, height, options).map(VideoHandle::V4l2)
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_local(
    device_index: u32,
    _width: u32,
    _height: u32,
    _options: SourceOptions,
) -> Result<VideoHandle, SourceError> {
    Err(SourceError::open(
        format!("/dev/video{device_index}"),
        "local capture requires the ingest-v4l2 feature",
    ))
}

#[cfg(feature = "rtsp-gstreamer")]
fn open_remote(uri: &str, options: SourceOptions) -> Result<VideoHandle, SourceError> {
    remote::GstreamerHandle::open(uri, options).map(VideoHandle::Gstreamer)
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn open_remote(uri: &str, _options: SourceOptions) -> Result<VideoHandle, SourceError> {
    Err(SourceError::open(
        uri,
        "remote streams require the rtsp-gstreamer feature",
    ))
}

/// Handle returned by `VideoSource`.
pub enum VideoHandle {
    Synthetic(SyntheticHandle),
    #[cfg(feature = "ingest-v4l2")]
    V4l2(v4l2::V4l2Handle),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(remote::GstreamerHandle),
}

impl CaptureHandle for VideoHandle {
    fn read_frame(&mut self) -> Result<RgbImage, SourceError> {
        match self {
            Self::Synthetic(handle) => handle.read_frame(),
            #[cfg(feature = "ingest-v4l2")]
            Self::V4l2(handle) => handle.read_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            Self::Gstreamer(handle) => handle.read_frame(),
        }
    }

    fn close(&mut self) {
        match self {
            Self::Synthetic(handle) => handle.close(),
            #[cfg(feature = "ingest-v4l2")]
            Self::V4l2(handle) => handle.close(),
            #[cfg(feature = "rtsp-gstreamer")]
            Self::Gstreamer(handle) => handle.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_uri_opens_synthetic_handle() -> anyhow::Result<()> {
        let mut source = VideoSource::new(
            VideoSourceDescriptor::Remote {
                uri: "stub://front?size=64x48".to_string(),
            },
            SourceOptions::default(),
        );
        let mut handle = source.open()?;
        let frame = handle.read_frame()?;
        assert_eq!(frame.dimensions(), (64, 48));
        handle.close();
        handle.close();
        Ok(())
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    #[test]
    fn local_without_feature_is_open_error() {
        let mut source = VideoSource::new(
            VideoSourceDescriptor::Local {
                device_index: 0,
                width: 1920,
                height: 1080,
            },
            SourceOptions::default(),
        );
        assert!(matches!(source.open(), Err(SourceError::Open { .. })));
    }

    #[test]
    fn descriptor_display_names_device() {
        let local = VideoSourceDescriptor::Local {
            device_index: 2,
            width: 640,
            height: 480,
        };
        assert_eq!(local.to_string(), "/dev/video2 (640x480 requested)");
    }
}
