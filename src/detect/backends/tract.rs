#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, ensure, Context, Result};
use image::GrayImage;
use tract_onnx::prelude::*;

use crate::detect::backend::WindowClassifier;

/// Windows evaluated per inference call.
const BATCH_SIZE: usize = 64;

/// Tract-based window classifier.
///
/// Loads a local ONNX model taking a `Nx1xHxW` batch of grayscale windows
/// scaled to `0..1` and producing, per window, either a single score or a
/// `[negative, positive]` pair. The batch axis is fixed to 64 at load time, so
/// the model must not hard-code a batch of one. Short batches are zero-padded.
/// No network I/O and nothing written to disk beyond model loading.
pub struct TractClassifier {
    model: TypedRunnableModel<TypedModel>,
    window: (u32, u32),
    confidence_threshold: f32,
}

impl TractClassifier {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, window: (u32, u32)) -> Result<Self> {
        let model_path = model_path.as_ref();
        let (width, height) = window;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(BATCH_SIZE, 1, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            window,
            confidence_threshold: 0.5,
        })
    }

    /// Score a window must reach to count as a hit. Defaults to 0.5.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_batch(&self, image: &GrayImage, origins: &[(u32, u32)]) -> Tensor {
        let (width, height) = self.window;
        tract_ndarray::Array4::from_shape_fn(
            (BATCH_SIZE, 1, height as usize, width as usize),
            |(n, _, row, col)| match origins.get(n) {
                Some(&(x, y)) => {
                    let pixel = image.get_pixel(x + col as u32, y + row as u32);
                    f32::from(pixel.0[0]) / 255.0
                }
                None => 0.0,
            },
        )
        .into_tensor()
    }

    /// One score per batch slot.
    fn extract_scores(&self, outputs: TVec<TValue>) -> Result<Vec<f32>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let values: Vec<f32> = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .iter()
            .copied()
            .collect();
        ensure!(
            !values.is_empty() && values.len() % BATCH_SIZE == 0,
            "model output of {} values does not split into {} windows",
            values.len(),
            BATCH_SIZE
        );
        let per_window = values.len() / BATCH_SIZE;
        Ok(values
            .chunks(per_window)
            .map(|scores| {
                let score = match scores {
                    [_, positive] => *positive,
                    _ => scores.iter().copied().fold(f32::NEG_INFINITY, f32::max),
                };
                if score.is_finite() {
                    score
                } else {
                    0.0
                }
            })
            .collect())
    }
}

impl WindowClassifier for TractClassifier {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn window_size(&self) -> (u32, u32) {
        self.window
    }

    fn classify(&self, image: &GrayImage, x: u32, y: u32) -> Result<bool> {
        let verdicts = self.classify_batch(image, &[(x, y)])?;
        Ok(verdicts.first().copied().unwrap_or(false))
    }

    fn classify_batch(&self, image: &GrayImage, origins: &[(u32, u32)]) -> Result<Vec<bool>> {
        let mut verdicts = Vec::with_capacity(origins.len());
        for chunk in origins.chunks(BATCH_SIZE) {
            let input = self.build_batch(image, chunk);
            let outputs = self
                .model
                .run(tvec!(input.into()))
                .context("ONNX inference failed")?;
            let scores = self.extract_scores(outputs)?;
            verdicts.extend(
                scores
                    .iter()
                    .take(chunk.len())
                    .map(|score| *score >= self.confidence_threshold),
            );
        }
        Ok(verdicts)
    }
}
