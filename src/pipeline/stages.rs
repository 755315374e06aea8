use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;

use crate::detect::Region;

pub const OUTLINE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Outline every region on a copy of `frame`. Returns an unmodified copy when
/// `regions` is empty.
pub fn annotate(frame: &RgbImage, regions: &[Region]) -> RgbImage {
    let mut canvas = frame.clone();
    let (width, height) = canvas.dimensions();
    for region in regions {
        let Some(region) = region.clamp_to(width, height) else {
            continue;
        };
        draw_hollow_rect_mut(&mut canvas, region.to_rect(), OUTLINE_COLOR);
        // Second, inset outline so the box stays visible after downscaling.
        if region.width > 2 && region.height > 2 {
            let inset = Region::new(
                region.x + 1,
                region.y + 1,
                region.width - 2,
                region.height - 2,
            );
            draw_hollow_rect_mut(&mut canvas, inset.to_rect(), OUTLINE_COLOR);
        }
    }
    canvas
}

/// Crop the first region, which detection orders largest first.
pub fn crop_first(frame: &RgbImage, regions: &[Region]) -> Option<RgbImage> {
    let region = regions.first()?.clamp_to(frame.width(), frame.height())?;
    Some(imageops::crop_imm(frame, region.x, region.y, region.width, region.height).to_image())
}

/// Scale uniformly so the image fits inside `target_width` x `target_height`.
///
/// The limiting axis lands exactly on its target; the other axis is rounded
/// down and never drops below one pixel.
pub fn resize_keeping_aspect(image: &RgbImage, target_width: u32, target_height: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 || target_width == 0 || target_height == 0 {
        return image.clone();
    }
    // Compare target_width / width against target_height / height without floats.
    let width_limited =
        u64::from(target_width) * u64::from(height) <= u64::from(target_height) * u64::from(width);
    let (new_width, new_height) = if width_limited {
        let scaled = u64::from(height) * u64::from(target_width) / u64::from(width);
        (target_width, (scaled as u32).max(1))
    } else {
        let scaled = u64::from(width) * u64::from(target_height) / u64::from(height);
        ((scaled as u32).max(1), target_height)
    };
    if (new_width, new_height) == (width, height) {
        return image.clone();
    }
    imageops::resize(image, new_width, new_height, FilterType::Triangle)
}
