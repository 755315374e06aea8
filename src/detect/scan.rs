use std::borrow::Cow;

use anyhow::{ensure, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

use super::backend::WindowClassifier;
use super::group::{group_regions, GROUP_EPS};
use super::region::{sort_regions, Region};

/// Default cap on raw hits per frame.
pub const DEFAULT_MAX_HITS: usize = 20_000;

/// Multi-scale scan parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScanParams {
    /// Growth factor between successive window sizes. Must exceed 1.
    pub scale_factor: f64,
    /// Hits a cluster needs beyond this count to survive grouping.
    pub min_neighbors: u32,
    /// Smallest window (in frame pixels) that is evaluated.
    pub min_size: (u32, u32),
    /// Largest window evaluated; `None` scans up to the frame size.
    pub max_size: Option<(u32, u32)>,
    /// Raw hits kept before grouping. The scan stops at the scale that
    /// reaches it.
    pub max_hits: usize,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 5,
            min_size: (0, 0),
            max_size: None,
            max_hits: DEFAULT_MAX_HITS,
        }
    }
}

/// Find candidate regions in `frame`.
///
/// The frame is converted to grayscale and scanned at window sizes growing by
/// `scale_factor`. Each scale downsamples the image instead of growing the
/// classifier window. Hits are grouped and returned largest first.
pub fn detect_regions(
    frame: &RgbImage,
    classifier: &dyn WindowClassifier,
    params: &ScanParams,
) -> Result<Vec<Region>> {
    ensure!(
        params.scale_factor > 1.0,
        "scale factor must be greater than 1, got {}",
        params.scale_factor
    );
    let (win_w, win_h) = classifier.window_size();
    ensure!(
        win_w > 0 && win_h > 0,
        "classifier window must be non-empty"
    );

    let gray = imageops::grayscale(frame);
    let (frame_w, frame_h) = gray.dimensions();
    let mut hits = Vec::new();
    let mut factor = 1.0f64;

    loop {
        let scaled_w = (f64::from(frame_w) / factor).round() as u32;
        let scaled_h = (f64::from(frame_h) / factor).round() as u32;
        if scaled_w < win_w || scaled_h < win_h {
            break;
        }
        let span_w = (f64::from(win_w) * factor).round() as u32;
        let span_h = (f64::from(win_h) * factor).round() as u32;
        if let Some((max_w, max_h)) = params.max_size {
            if span_w > max_w || span_h > max_h {
                break;
            }
        }

        if span_w >= params.min_size.0 && span_h >= params.min_size.1 {
            let scaled: Cow<'_, GrayImage> = if scaled_w == frame_w && scaled_h == frame_h {
                Cow::Borrowed(&gray)
            } else {
                Cow::Owned(imageops::resize(
                    &gray,
                    scaled_w,
                    scaled_h,
                    FilterType::Triangle,
                ))
            };
            let step = if factor > 2.0 { 1 } else { 2 };
            let mut origins = Vec::new();
            for y in (0..=scaled_h - win_h).step_by(step) {
                for x in (0..=scaled_w - win_w).step_by(step) {
                    origins.push((x, y));
                }
            }
            let verdicts = classifier.classify_batch(&scaled, &origins)?;
            ensure!(
                verdicts.len() == origins.len(),
                "{} returned {} verdicts for {} windows",
                classifier.name(),
                verdicts.len(),
                origins.len()
            );
            let before = hits.len();
            for (&(x, y), &positive) in origins.iter().zip(&verdicts) {
                if !positive {
                    continue;
                }
                let origin_x = (f64::from(x) * factor).round() as u32;
                let origin_y = (f64::from(y) * factor).round() as u32;
                let span = Region::new(origin_x, origin_y, span_w, span_h);
                if let Some(hit) = span.clamp_to(frame_w, frame_h) {
                    hits.push(hit);
                }
            }
            log::trace!(
                "scale {:.3}: {}x{} window, {} hits",
                factor,
                span_w,
                span_h,
                hits.len() - before
            );
            if hits.len() >= params.max_hits {
                log::warn!(
                    "{}: {} raw hits at scale {:.3}, keeping the first {}",
                    classifier.name(),
                    hits.len(),
                    factor,
                    params.max_hits
                );
                hits.truncate(params.max_hits);
                break;
            }
        }

        factor *= params.scale_factor;
    }

    let mut regions = group_regions(&hits, params.min_neighbors, GROUP_EPS);
    sort_regions(&mut regions);
    log::debug!(
        "{}: {} raw hits grouped into {} regions",
        classifier.name(),
        hits.len(),
        regions.len()
    );
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::IntensityClassifier;
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn frame_with_block(x: u32, y: u32, w: u32, h: u32) -> RgbImage {
        let mut frame = RgbImage::from_pixel(160, 120, Rgb([20, 20, 20]));
        for row in y..y + h {
            for col in x..x + w {
                frame.put_pixel(col, row, Rgb([250, 250, 250]));
            }
        }
        frame
    }

    #[test]
    fn blank_frame_has_no_regions() -> Result<()> {
        let frame = RgbImage::from_pixel(160, 120, Rgb([20, 20, 20]));
        let classifier = IntensityClassifier::new((16, 8), 200);
        let regions = detect_regions(&frame, &classifier, &ScanParams::default())?;
        assert!(regions.is_empty());
        Ok(())
    }

    #[test]
    fn bright_block_is_found() -> Result<()> {
        let frame = frame_with_block(40, 50, 48, 16);
        let classifier = IntensityClassifier::new((16, 8), 200);
        let regions = detect_regions(&frame, &classifier, &ScanParams::default())?;
        assert!(!regions.is_empty());
        let top = regions[0];
        assert!(top.x < 88 && top.right() > 40);
        assert!(top.y < 66 && top.bottom() > 50);
        for pair in regions.windows(2) {
            assert!(pair[0].area() >= pair[1].area());
        }
        Ok(())
    }

    #[test]
    fn scan_is_deterministic() -> Result<()> {
        let frame = frame_with_block(20, 30, 60, 20);
        let classifier = IntensityClassifier::new((16, 8), 200);
        let params = ScanParams::default();
        let first = detect_regions(&frame, &classifier, &params)?;
        let second = detect_regions(&frame, &classifier, &params)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn max_size_limits_windows() -> Result<()> {
        let frame = frame_with_block(40, 50, 48, 16);
        let classifier = IntensityClassifier::new((16, 8), 200);
        let params = ScanParams {
            min_neighbors: 0,
            max_size: Some((20, 8)),
            ..ScanParams::default()
        };
        let regions = detect_regions(&frame, &classifier, &params)?;
        assert!(!regions.is_empty());
        assert!(regions.iter().all(|r| r.width <= 20 && r.height <= 8));
        Ok(())
    }

    #[test]
    fn scale_factor_must_grow() {
        let frame = RgbImage::new(32, 32);
        let classifier = IntensityClassifier::new((8, 8), 200);
        let params = ScanParams {
            scale_factor: 1.0,
            ..ScanParams::default()
        };
        assert!(detect_regions(&frame, &classifier, &params).is_err());
    }

    struct CountingClassifier {
        batches: AtomicUsize,
        windows: AtomicUsize,
    }

    impl WindowClassifier for CountingClassifier {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn window_size(&self) -> (u32, u32) {
            (24, 8)
        }

        fn classify(&self, _image: &GrayImage, _x: u32, _y: u32) -> Result<bool> {
            Ok(false)
        }

        fn classify_batch(&self, _image: &GrayImage, origins: &[(u32, u32)]) -> Result<Vec<bool>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.windows.fetch_add(origins.len(), Ordering::SeqCst);
            Ok(vec![false; origins.len()])
        }
    }

    #[test]
    fn each_scale_is_one_batch() -> Result<()> {
        let frame = RgbImage::new(200, 100);
        let classifier = CountingClassifier {
            batches: AtomicUsize::new(0),
            windows: AtomicUsize::new(0),
        };
        let params = ScanParams {
            scale_factor: 2.0,
            ..ScanParams::default()
        };
        detect_regions(&frame, &classifier, &params)?;
        // Scales 1, 2, 4 and 8 fit the 24x8 window; 16 does not.
        assert_eq!(classifier.batches.load(Ordering::SeqCst), 4);
        let scale_one = (((200 - 24) / 2 + 1) * ((100 - 8) / 2 + 1)) as usize;
        assert!(classifier.windows.load(Ordering::SeqCst) > scale_one);
        Ok(())
    }

    #[test]
    fn saturated_frame_is_capped_and_fast() -> Result<()> {
        let frame = RgbImage::from_pixel(320, 240, Rgb([255, 255, 255]));
        let classifier = IntensityClassifier::new((24, 8), 200);
        let started = Instant::now();
        let regions = detect_regions(&frame, &classifier, &ScanParams::default())?;
        let elapsed = started.elapsed();
        assert!(!regions.is_empty());
        assert!(
            elapsed < Duration::from_secs(20),
            "bright 320x240 frame took {elapsed:?}"
        );
        Ok(())
    }

    #[test]
    fn hit_cap_stops_the_scan() -> Result<()> {
        let frame = RgbImage::from_pixel(160, 120, Rgb([255, 255, 255]));
        let classifier = IntensityClassifier::new((16, 8), 200);
        let params = ScanParams {
            min_neighbors: 0,
            max_hits: 100,
            ..ScanParams::default()
        };
        let regions = detect_regions(&frame, &classifier, &params)?;
        assert_eq!(regions.len(), 100);
        assert!(regions.iter().all(|r| r.width == 16 && r.height == 8));
        Ok(())
    }
}
