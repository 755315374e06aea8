use anyhow::Result;
use image::GrayImage;
use std::sync::Arc;

use super::backends::IntensityClassifier;
use crate::error::ModelLoadError;
use crate::ingest::STUB_SCHEME;

/// Binary classifier evaluated on fixed-size windows of a grayscale image.
///
/// Implementations hold only immutable model state so one instance can be
/// shared by every request thread. `classify` must be deterministic.
pub trait WindowClassifier: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Native window size `(width, height)` in pixels.
    fn window_size(&self) -> (u32, u32);

    /// Returns true when the window with top-left corner `(x, y)` contains the
    /// target. The caller guarantees the window lies inside `image`.
    fn classify(&self, image: &GrayImage, x: u32, y: u32) -> Result<bool>;

    /// Classify every window in `origins`, returning one verdict per origin in
    /// the same order. Backends with per-call overhead should evaluate the
    /// windows together.
    fn classify_batch(&self, image: &GrayImage, origins: &[(u32, u32)]) -> Result<Vec<bool>> {
        origins
            .iter()
            .map(|&(x, y)| self.classify(image, x, y))
            .collect()
    }
}

/// Load the classifier named by `path`.
///
/// `stub://` paths build the built-in intensity classifier; anything else is an
/// ONNX model loaded with tract (`backend-tract` feature), where a window is
/// positive when its score reaches `score_threshold`.
pub fn load_classifier(
    path: &str,
    window: (u32, u32),
    score_threshold: f32,
) -> Result<Arc<dyn WindowClassifier>, ModelLoadError> {
    if window.0 == 0 || window.1 == 0 {
        return Err(ModelLoadError::new(path, "window size must be non-zero"));
    }
    if path.starts_with(STUB_SCHEME) {
        let classifier = IntensityClassifier::from_uri(path, window)?;
        log::info!(
            "loaded stub classifier {} ({}x{} window)",
            path,
            window.0,
            window.1
        );
        return Ok(Arc::new(classifier));
    }
    load_model(path, window, score_threshold)
}

#[cfg(feature = "backend-tract")]
fn load_model(
    path: &str,
    window: (u32, u32),
    score_threshold: f32,
) -> Result<Arc<dyn WindowClassifier>, ModelLoadError> {
    let classifier = super::backends::TractClassifier::new(path, window)
        .map_err(|err| ModelLoadError::new(path, format!("{err:#}")))?
        .with_threshold(score_threshold);
    log::info!(
        "loaded ONNX window classifier {} ({}x{} window, threshold {})",
        path,
        window.0,
        window.1,
        score_threshold
    );
    Ok(Arc::new(classifier))
}

#[cfg(not(feature = "backend-tract"))]
fn load_model(
    path: &str,
    _window: (u32, u32),
    _score_threshold: f32,
) -> Result<Arc<dyn WindowClassifier>, ModelLoadError> {
    Err(ModelLoadError::new(
        path,
        "model files require the backend-tract feature",
    ))
}
