use std::sync::Arc;

use anyhow::Result;
use image::{GrayImage, RgbImage};

/// Characters accepted by default: upper-case letters and digits.
pub const DEFAULT_WHITELIST: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Text read from a cropped region. Empty means nothing was recognised.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractedText(String);

impl ExtractedText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_option(self) -> Option<String> {
        (!self.0.is_empty()).then_some(self.0)
    }
}

/// Single-block text recogniser restricted to a character whitelist.
pub trait TextRecognizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn recognize(&self, image: &GrayImage, whitelist: &str) -> Result<String>;
}

/// Recogniser used when no OCR engine is compiled in. Never finds text.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRecognizer;

impl TextRecognizer for NoopRecognizer {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn recognize(&self, _image: &GrayImage, _whitelist: &str) -> Result<String> {
        Ok(String::new())
    }
}

#[cfg(feature = "ocr-tesseract")]
pub use tesseract::TesseractRecognizer;

#[cfg(feature = "ocr-tesseract")]
mod tesseract {
    use std::io::Cursor;

    use anyhow::{anyhow, Context, Result};
    use image::{GrayImage, ImageFormat};
    use leptess::{LepTess, Variable};

    use super::TextRecognizer;

    /// Page segmentation mode 6: a single uniform block of text.
    const PAGE_SEG_MODE_SINGLE_BLOCK: &str = "6";

    /// Tesseract through leptess.
    ///
    /// A fresh engine is created per call because the Tesseract handle cannot
    /// be shared across threads.
    #[derive(Clone, Debug)]
    pub struct TesseractRecognizer {
        datapath: Option<String>,
        language: String,
    }

    impl TesseractRecognizer {
        /// Checks that the language data loads before the server starts.
        pub fn new(datapath: Option<String>, language: &str) -> Result<Self> {
            let recognizer = Self {
                datapath,
                language: language.to_string(),
            };
            recognizer.engine()?;
            Ok(recognizer)
        }

        fn engine(&self) -> Result<LepTess> {
            LepTess::new(self.datapath.as_deref(), &self.language)
                .map_err(|err| anyhow!("init tesseract ({}): {}", self.language, err))
        }
    }

    impl TextRecognizer for TesseractRecognizer {
        fn name(&self) -> &'static str {
            "tesseract"
        }

        fn recognize(&self, image: &GrayImage, whitelist: &str) -> Result<String> {
            let mut png = Vec::new();
            image
                .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
                .context("encode region for OCR")?;

            let mut engine = self.engine()?;
            engine
                .set_variable(Variable::TesseditPagesegMode, PAGE_SEG_MODE_SINGLE_BLOCK)
                .map_err(|err| anyhow!("set page segmentation mode: {err}"))?;
            if !whitelist.is_empty() {
                engine
                    .set_variable(Variable::TesseditCharWhitelist, whitelist)
                    .map_err(|err| anyhow!("set character whitelist: {err}"))?;
            }
            engine
                .set_image_from_mem(&png)
                .map_err(|err| anyhow!("load region into tesseract: {err}"))?;
            engine
                .get_utf8_text()
                .map_err(|err| anyhow!("read recognised text: {err}"))
        }
    }
}

/// Pick the recogniser for this build. Without `ocr-tesseract`, or when the
/// engine fails to initialise, OCR degrades to [`NoopRecognizer`].
pub fn build_recognizer(language: &str, datapath: Option<String>) -> Arc<dyn TextRecognizer> {
    #[cfg(feature = "ocr-tesseract")]
    {
        match TesseractRecognizer::new(datapath, language) {
            Ok(recognizer) => {
                log::info!("OCR: tesseract ready (language {})", language);
                return Arc::new(recognizer);
            }
            Err(err) => log::warn!("OCR: {:#}; text extraction disabled", err),
        }
    }
    #[cfg(not(feature = "ocr-tesseract"))]
    {
        let _ = datapath;
        log::warn!(
            "OCR: built without ocr-tesseract; text extraction for '{}' disabled",
            language
        );
    }
    Arc::new(NoopRecognizer)
}

/// Run OCR over `image` as grayscale. Recogniser failures are logged and
/// reported as no text.
pub fn extract_text(
    image: &RgbImage,
    whitelist: &str,
    recognizer: &dyn TextRecognizer,
) -> ExtractedText {
    let gray = image::imageops::grayscale(image);
    match recognizer.recognize(&gray, whitelist) {
        Ok(text) => ExtractedText(text.trim().to_string()),
        Err(err) => {
            log::warn!("OCR: {} failed: {:#}", recognizer.name(), err);
            ExtractedText::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use image::Rgb;
    use std::sync::Mutex;

    struct Fixed(Result<String, String>, Mutex<Option<(u32, u32, String)>>);

    impl TextRecognizer for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn recognize(&self, image: &GrayImage, whitelist: &str) -> Result<String> {
            *self.1.lock().map_err(|_| anyhow!("poisoned"))? =
                Some((image.width(), image.height(), whitelist.to_string()));
            self.0.clone().map_err(|err| anyhow!(err))
        }
    }

    #[test]
    fn text_is_trimmed() {
        let recognizer = Fixed(Ok("  AB12CD \n".into()), Mutex::new(None));
        let image = RgbImage::from_pixel(30, 10, Rgb([200, 200, 200]));
        let text = extract_text(&image, DEFAULT_WHITELIST, &recognizer);
        assert_eq!(text.as_str(), "AB12CD");
        let seen = recognizer.1.lock().unwrap().clone();
        assert_eq!(seen, Some((30, 10, DEFAULT_WHITELIST.to_string())));
    }

    #[test]
    fn failure_is_empty_text() {
        let recognizer = Fixed(Err("engine gone".into()), Mutex::new(None));
        let image = RgbImage::new(4, 4);
        let text = extract_text(&image, DEFAULT_WHITELIST, &recognizer);
        assert!(text.is_empty());
        assert_eq!(text.into_option(), None);
    }

    #[test]
    fn noop_finds_nothing() {
        let image = RgbImage::new(4, 4);
        assert!(extract_text(&image, "", &NoopRecognizer).is_empty());
    }
}
