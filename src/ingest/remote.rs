//! GStreamer capture handle for remote streams.
//!
//! Any URI `uridecodebin` understands is accepted (rtsp://, http://, file://).
//! The appsink keeps at most one buffer and drops older ones, so a read always
//! returns the newest decoded frame rather than a queued one.

use gstreamer::prelude::*;
use image::RgbImage;

use super::normalize::{to_rgb_image, PixelFormat};
use super::{CaptureHandle, SourceOptions};
use crate::error::SourceError;

pub struct GstreamerHandle {
    uri: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    read_timeout: Option<gstreamer::ClockTime>,
    frame_count: u64,
    closed: bool,
}

impl GstreamerHandle {
    pub fn open(uri: &str, options: SourceOptions) -> Result<Self, SourceError> {
        gstreamer::init()
            .map_err(|err| SourceError::open(uri, format!("init gstreamer: {err}")))?;

        let description = format!(
            "uridecodebin uri={} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            uri
        );
        let pipeline = gstreamer::parse::launch(&description)
            .map_err(|err| SourceError::open(uri, format!("build pipeline: {err}")))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| SourceError::open(uri, "pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| SourceError::open(uri, "appsink element missing from pipeline"))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| SourceError::open(uri, "appsink element has unexpected type"))?;
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        let read_timeout = if options.read_timeout.is_zero() {
            log::warn!("GstreamerHandle: read timeout disabled for {}", uri);
            None
        } else {
            Some(gstreamer::ClockTime::from_mseconds(
                options.read_timeout.as_millis() as u64,
            ))
        };

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|err| SourceError::open(uri, format!("start pipeline: {err}")))?;
        let (result, _, _) = pipeline.state(read_timeout);
        if let Err(err) = result {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(SourceError::open(
                uri,
                format!("pipeline did not start: {err}"),
            ));
        }

        let mut handle = Self {
            uri: uri.to_string(),
            pipeline,
            appsink,
            read_timeout,
            frame_count: 0,
            closed: false,
        };
        if let Some(error) = handle.poll_bus() {
            handle.close();
            return Err(SourceError::open(uri, error));
        }
        Ok(handle)
    }

    /// Drain pending bus messages and return the first error or EOS.
    fn poll_bus(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let mut failure = None;
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) if failure.is_none() => {
                    failure = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) if failure.is_none() => {
                    failure = Some("stream reached EOS".to_string());
                }
                _ => {}
            }
        }
        failure
    }
}

impl CaptureHandle for GstreamerHandle {
    fn read_frame(&mut self) -> Result<RgbImage, SourceError> {
        if self.closed {
            return Err(SourceError::read(&self.uri, "handle is closed"));
        }
        if let Some(error) = self.poll_bus() {
            return Err(SourceError::read(&self.uri, error));
        }

        let sample = self
            .appsink
            .try_pull_sample(self.read_timeout)
            .ok_or_else(|| SourceError::read(&self.uri, "stream stalled"))?;
        let image = sample_to_image(&sample).map_err(|err| SourceError::read(&self.uri, err))?;

        if self.frame_count == 0 {
            log::info!(
                "GstreamerHandle: {} streaming at {}x{}",
                self.uri,
                image.width(),
                image.height()
            );
        }
        self.frame_count += 1;
        Ok(image)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstreamerHandle: failed to stop {}: {}", self.uri, err);
        }
        log::info!(
            "GstreamerHandle: closed {} after {} frames",
            self.uri,
            self.frame_count
        );
    }
}

impl Drop for GstreamerHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage, String> {
    let buffer = sample.buffer().ok_or("sample missing buffer")?;
    let caps = sample.caps().ok_or("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps)
        .map_err(|err| format!("parse caps as video info: {err}"))?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer
        .map_readable()
        .map_err(|err| format!("map buffer: {err}"))?;
    let data = map.as_slice();

    if stride == row_bytes {
        return to_rgb_image(data, width, height, PixelFormat::Rgb24)
            .map_err(|err| format!("{err:#}"));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .ok_or("buffer row is out of bounds")?,
        );
    }
    to_rgb_image(&pixels, width, height, PixelFormat::Rgb24).map_err(|err| format!("{err:#}"))
}
