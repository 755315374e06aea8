use image::codecs::jpeg::JpegEncoder;
use image::{ImageResult, RgbImage};

/// Encode `image` as baseline JPEG. Identical input and quality always give
/// identical bytes.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut bytes = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100)).encode_image(image)?;
    Ok(bytes)
}
