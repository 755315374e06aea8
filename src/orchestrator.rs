//! Per-request composition of the pipeline over the latest cached frame.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;

use crate::detect::{detect_regions, Region, ScanParams, WindowClassifier};
use crate::error::RequestError;
use crate::frame::FrameCache;
use crate::pipeline::{
    annotate, crop_first, encode_jpeg, extract_text, resize_keeping_aspect, TextRecognizer,
    DEFAULT_WHITELIST,
};

/// Flags of one retrieval request. `crop` and `ocr` only take effect
/// together with `detect`; `ocr` additionally needs `crop`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestParameters {
    pub detect: bool,
    pub crop: bool,
    pub ocr: bool,
}

impl RequestParameters {
    /// Parse a URL query string. Only the literal value `1` enables a flag.
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::default();
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let enabled = value == "1";
            match key {
                "detect" => params.detect = enabled,
                "crop" => params.crop = enabled,
                "ocr" => params.ocr = enabled,
                _ => {}
            }
        }
        params
    }

    fn wants_crop(&self) -> bool {
        self.detect && self.crop
    }

    fn wants_text(&self) -> bool {
        self.wants_crop() && self.ocr
    }
}

/// Pipeline tunables resolved from configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    pub scan: ScanParams,
    /// Bounding box for cropped output, `(width, height)`.
    pub envelope: (u32, u32),
    pub jpeg_quality: u8,
    pub ocr_whitelist: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            scan: ScanParams::default(),
            envelope: (640, 480),
            jpeg_quality: 90,
            ocr_whitelist: DEFAULT_WHITELIST.to_string(),
        }
    }
}

/// Encoded result of one request.
#[derive(Clone, Debug)]
pub struct FrameResponse {
    pub jpeg: Vec<u8>,
    /// Sequence number of the frame the response was built from.
    pub sequence: u64,
    /// Recognised text, when OCR was requested and found any.
    pub text: Option<String>,
    /// Regions detected, zero when detection was not requested.
    pub regions: usize,
}

/// Serves requests from the frame cache. Cheap to clone; one per worker.
#[derive(Clone)]
pub struct Orchestrator {
    cache: FrameCache,
    classifier: Arc<dyn WindowClassifier>,
    recognizer: Arc<dyn TextRecognizer>,
    settings: Arc<PipelineSettings>,
}

impl Orchestrator {
    pub fn new(
        cache: FrameCache,
        classifier: Arc<dyn WindowClassifier>,
        recognizer: Arc<dyn TextRecognizer>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            cache,
            classifier,
            recognizer,
            settings: Arc::new(settings),
        }
    }

    pub fn cache(&self) -> &FrameCache {
        &self.cache
    }

    /// Build the response for `params` from the newest published frame.
    ///
    /// Fails with `NoFrameAvailable` before the first frame and after the
    /// capture supervisor has given up.
    pub fn handle(&self, params: RequestParameters) -> Result<FrameResponse, RequestError> {
        let started = Instant::now();
        let snapshot = self
            .cache
            .read_latest()
            .filter(|_| self.cache.is_live())
            .ok_or(RequestError::NoFrameAvailable)?;
        let frame = &snapshot.image;

        let mut regions = Vec::new();
        let mut text = None;
        let output: Cow<'_, RgbImage> = if params.detect {
            regions = self.detect(frame);
            if params.wants_crop() {
                match crop_first(frame, &regions) {
                    Some(crop) => {
                        if params.wants_text() {
                            text = self.read_text(&crop, snapshot.sequence);
                        }
                        let (width, height) = self.settings.envelope;
                        Cow::Owned(resize_keeping_aspect(&crop, width, height))
                    }
                    None => Cow::Borrowed(frame),
                }
            } else {
                Cow::Owned(annotate(frame, &regions))
            }
        } else {
            Cow::Borrowed(frame)
        };

        let jpeg = encode_jpeg(&output, self.settings.jpeg_quality)?;
        log::debug!(
            "frame {} {:?}: {} regions, {}x{} -> {} bytes in {:?}",
            snapshot.sequence,
            params,
            regions.len(),
            output.width(),
            output.height(),
            jpeg.len(),
            started.elapsed()
        );
        Ok(FrameResponse {
            jpeg,
            sequence: snapshot.sequence,
            text,
            regions: regions.len(),
        })
    }

    /// Detection failures degrade to "no regions".
    fn detect(&self, frame: &RgbImage) -> Vec<Region> {
        let started = Instant::now();
        match detect_regions(frame, self.classifier.as_ref(), &self.settings.scan) {
            Ok(regions) => {
                log::debug!(
                    "detection found {} regions in {:?}",
                    regions.len(),
                    started.elapsed()
                );
                regions
            }
            Err(err) => {
                log::warn!("detection failed: {:#}", err);
                Vec::new()
            }
        }
    }

    fn read_text(&self, crop: &RgbImage, sequence: u64) -> Option<String> {
        let started = Instant::now();
        let text = extract_text(crop, &self.settings.ocr_whitelist, self.recognizer.as_ref());
        log::debug!("OCR took {:?}", started.elapsed());
        if !text.is_empty() {
            log::info!("frame {}: recognised text '{}'", sequence, text.as_str());
        }
        text.into_option()
    }
}
