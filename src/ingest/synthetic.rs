//! Synthetic source for `stub://` URIs.
//!
//! Produces a dark gradient background with one bright rectangle that drifts
//! horizontally, paced at roughly 30 fps. Frame content depends only on the
//! frame counter, so two handles opened on the same URI produce the same frames.
//!
//! `stub://name?size=WxH` sets the frame size (default 640x480).

use image::{Rgb, RgbImage};
use std::time::Duration;

use crate::error::SourceError;

use super::CaptureHandle;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const FRAME_INTERVAL: Duration = Duration::from_millis(33);

pub struct SyntheticHandle {
    uri: String,
    width: u32,
    height: u32,
    frame_count: u64,
    open: bool,
}

impl SyntheticHandle {
    pub fn open(uri: &str) -> Result<Self, SourceError> {
        let (width, height) = parse_size(uri)?;
        log::info!("SyntheticHandle: opened {} ({}x{})", uri, width, height);
        Ok(Self {
            uri: uri.to_string(),
            width,
            height,
            frame_count: 0,
            open: true,
        })
    }

    /// Render frame `index` without pacing.
    pub fn render(width: u32, height: u32, index: u64) -> RgbImage {
        let mut image = RgbImage::from_fn(width, height, |x, y| {
            let shade = ((x + y) % 64) as u8;
            Rgb([shade, shade, shade])
        });

        let rect_w = (width / 4).max(1);
        let rect_h = (height / 8).max(1);
        let travel = u64::from(width.saturating_sub(rect_w)).max(1);
        let left = (index % travel) as u32;
        let top = height / 2 - rect_h / 2;
        for y in top..(top + rect_h).min(height) {
            for x in left..(left + rect_w).min(width) {
                image.put_pixel(x, y, Rgb([250, 250, 250]));
            }
        }
        image
    }
}

impl CaptureHandle for SyntheticHandle {
    fn read_frame(&mut self) -> Result<RgbImage, SourceError> {
        if !self.open {
            return Err(SourceError::read(&self.uri, "handle is closed"));
        }
        std::thread::sleep(FRAME_INTERVAL);
        self.frame_count += 1;
        Ok(Self::render(self.width, self.height, self.frame_count))
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            log::info!(
                "SyntheticHandle: closed {} after {} frames",
                self.uri,
                self.frame_count
            );
        }
    }
}

impl Drop for SyntheticHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn parse_size(uri: &str) -> Result<(u32, u32), SourceError> {
    let Some((_, query)) = uri.split_once('?') else {
        return Ok((DEFAULT_WIDTH, DEFAULT_HEIGHT));
    };
    for pair in query.split('&') {
        if let Some(("size", value)) = pair.split_once('=') {
            let parsed = value
                .split_once('x')
                .and_then(|(w, h)| Some((w.parse::<u32>().ok()?, h.parse::<u32>().ok()?)));
            return match parsed {
                Some((w, h)) if w > 0 && h > 0 => Ok((w, h)),
                _ => Err(SourceError::open(
                    uri,
                    format!("invalid size '{value}', expected WxH"),
                )),
            };
        }
    }
    Ok((DEFAULT_WIDTH, DEFAULT_HEIGHT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_size_without_query() -> anyhow::Result<()> {
        let handle = SyntheticHandle::open("stub://cam")?;
        assert_eq!((handle.width, handle.height), (640, 480));
        Ok(())
    }

    #[test]
    fn rejects_malformed_size() {
        assert!(matches!(
            SyntheticHandle::open("stub://cam?size=wide"),
            Err(SourceError::Open { .. })
        ));
    }

    #[test]
    fn render_is_deterministic() {
        assert_eq!(
            SyntheticHandle::render(32, 24, 5),
            SyntheticHandle::render(32, 24, 5)
        );
        assert_ne!(
            SyntheticHandle::render(32, 24, 5),
            SyntheticHandle::render(32, 24, 6)
        );
    }

    #[test]
    fn closed_handle_fails_reads() -> anyhow::Result<()> {
        let mut handle = SyntheticHandle::open("stub://cam?size=8x8")?;
        assert!(handle.read_frame().is_ok());
        handle.close();
        assert!(matches!(handle.read_frame(), Err(SourceError::Read { .. })));
        Ok(())
    }
}
