//! Per-request image stages. Every function here is pure over its inputs and
//! safe to call from any number of request threads at once.

mod encode;
mod ocr;
mod stages;

pub use encode::encode_jpeg;
pub use ocr::{
    build_recognizer, extract_text, ExtractedText, NoopRecognizer, TextRecognizer,
    DEFAULT_WHITELIST,
};
pub use stages::{annotate, crop_first, resize_keeping_aspect, OUTLINE_COLOR};

#[cfg(feature = "ocr-tesseract")]
pub use ocr::TesseractRecognizer;
