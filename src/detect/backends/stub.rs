use anyhow::Result;
use image::GrayImage;

use crate::detect::backend::WindowClassifier;
use crate::error::ModelLoadError;

const DEFAULT_THRESHOLD: u8 = 200;

/// Stub classifier for tests and `stub://` sources.
///
/// A window is positive when its mean intensity reaches `threshold`, which
/// picks out bright blocks such as the synthetic source's rectangle.
/// `stub://name?threshold=N` overrides the default of 200.
#[derive(Clone, Debug)]
pub struct IntensityClassifier {
    window: (u32, u32),
    threshold: u8,
}

impl IntensityClassifier {
    pub fn new(window: (u32, u32), threshold: u8) -> Self {
        Self { window, threshold }
    }

    pub(crate) fn from_uri(uri: &str, window: (u32, u32)) -> Result<Self, ModelLoadError> {
        let mut threshold = DEFAULT_THRESHOLD;
        if let Some((_, query)) = uri.split_once('?') {
            for pair in query.split('&') {
                if let Some(("threshold", value)) = pair.split_once('=') {
                    threshold = value.parse().map_err(|_| {
                        ModelLoadError::new(uri, format!("invalid threshold '{value}'"))
                    })?;
                }
            }
        }
        Ok(Self::new(window, threshold))
    }
}

impl WindowClassifier for IntensityClassifier {
    fn name(&self) -> &'static str {
        "intensity"
    }

    fn window_size(&self) -> (u32, u32) {
        self.window
    }

    fn classify(&self, image: &GrayImage, x: u32, y: u32) -> Result<bool> {
        let (w, h) = self.window;
        let mut sum = 0u64;
        for row in y..y + h {
            for col in x..x + w {
                sum += u64::from(image.get_pixel(col, row).0[0]);
            }
        }
        let mean = sum / u64::from(w * h);
        Ok(mean >= u64::from(self.threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn bright_window_is_positive() -> Result<()> {
        let mut image = GrayImage::from_pixel(8, 8, Luma([10]));
        for y in 0..4 {
            for x in 0..4 {
                image.put_pixel(x, y, Luma([255]));
            }
        }
        let classifier = IntensityClassifier::new((4, 4), 200);
        assert!(classifier.classify(&image, 0, 0)?);
        assert!(!classifier.classify(&image, 4, 4)?);
        Ok(())
    }

    #[test]
    fn threshold_parsed_from_uri() -> Result<()> {
        let classifier = IntensityClassifier::from_uri("stub://x?threshold=90", (2, 2))?;
        assert_eq!(classifier.threshold, 90);
        assert!(IntensityClassifier::from_uri("stub://x?threshold=high", (2, 2)).is_err());
        Ok(())
    }
}
