//! V4L2 capture handle for local devices.
//!
//! Opens `/dev/video<index>`, requests YUYV at the hinted size and reads back
//! whatever the driver negotiated. Drivers may clamp the size or substitute
//! another pixel format; the negotiated values are logged and used as-is.
//! The mmap stream holds a single buffer so every read returns the newest
//! frame the driver has.

use image::RgbImage;
use std::time::Duration;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::FourCC;

use super::normalize::{to_rgb_image, PixelFormat};
use super::{CaptureHandle, SourceOptions};
use crate::error::SourceError;

const BUFFER_COUNT: u32 = 1;

pub struct V4l2Handle {
    path: String,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    format: PixelFormat,
    frame_count: u64,
}

impl V4l2Handle {
    pub fn open(
        device_index: u32,
        width: u32,
        height: u32,
        options: SourceOptions,
    ) -> Result<Self, SourceError> {
        let path = format!("/dev/video{device_index}");
        let device =
            v4l::Device::new(device_index as usize).map_err(|err| SourceError::open(&path, err))?;

        let mut requested = device
            .format()
            .map_err(|err| SourceError::open(&path, format!("read format: {err}")))?;
        requested.width = width;
        requested.height = height;
        requested.fourcc = FourCC::new(b"YUYV");

        let negotiated = match device.set_format(&requested) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Handle: failed to set format on {}: {}", path, err);
                device
                    .format()
                    .map_err(|err| SourceError::open(&path, format!("read format: {err}")))?
            }
        };

        let format = pixel_format(negotiated.fourcc).ok_or_else(|| {
            SourceError::open(
                &path,
                format!("unsupported pixel format {}", negotiated.fourcc),
            )
        })?;

        if negotiated.width != width || negotiated.height != height {
            log::warn!(
                "V4l2Handle: {} negotiated {}x{} instead of requested {}x{}",
                path,
                negotiated.width,
                negotiated.height,
                width,
                height
            );
        }

        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|err| SourceError::open(&path, format!("create buffer stream: {err}")))?;
        set_read_timeout(&mut stream, options.read_timeout);

        log::info!(
            "V4l2Handle: opened {} at {}x{} {}",
            path,
            negotiated.width,
            negotiated.height,
            negotiated.fourcc
        );

        Ok(Self {
            path,
            stream: Some(stream),
            width: negotiated.width,
            height: negotiated.height,
            format,
            frame_count: 0,
        })
    }
}

impl CaptureHandle for V4l2Handle {
    fn read_frame(&mut self) -> Result<RgbImage, SourceError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SourceError::read(&self.path, "handle is closed"))?;
        let (buf, meta) = stream
            .next()
            .map_err(|err| SourceError::read(&self.path, err))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let payload = if used == 0 { buf } else { &buf[..used] };

        let image = to_rgb_image(payload, self.width, self.height, self.format)
            .map_err(|err| SourceError::read(&self.path, format!("{err:#}")))?;
        self.frame_count += 1;
        Ok(image)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            log::info!(
                "V4l2Handle: closed {} after {} frames",
                self.path,
                self.frame_count
            );
        }
    }
}

impl Drop for V4l2Handle {
    fn drop(&mut self) {
        self.close();
    }
}

fn pixel_format(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"YUYV" => Some(PixelFormat::Yuyv),
        b"MJPG" => Some(PixelFormat::Mjpeg),
        b"RGB3" => Some(PixelFormat::Rgb24),
        _ => None,
    }
}

fn set_read_timeout(stream: &mut MmapStream<'static>, timeout: Duration) {
    if timeout.is_zero() {
        log::warn!("V4l2Handle: read timeout disabled; reads may block indefinitely");
        return;
    }
    stream.set_timeout(timeout);
}
