use imageproc::rect::Rect;
use serde::Serialize;

/// Axis-aligned rectangle in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// Intersection with a `width` x `height` frame, `None` when nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Region> {
        let x = self.x.min(width);
        let y = self.y.min(height);
        let w = self.right().min(width) - x;
        let h = self.bottom().min(height) - y;
        (w > 0 && h > 0).then_some(Region::new(x, y, w, h))
    }

    pub(crate) fn to_rect(self) -> Rect {
        Rect::at(self.x as i32, self.y as i32).of_size(self.width.max(1), self.height.max(1))
    }
}

/// Deterministic output order: largest area first, then top-to-bottom,
/// then left-to-right.
pub fn sort_regions(regions: &mut [Region]) {
    regions.sort_by(|a, b| {
        b.area()
            .cmp(&a.area())
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
            .then(a.width.cmp(&b.width))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_trims_overhang() {
        let region = Region::new(90, 40, 20, 20);
        assert_eq!(region.clamp_to(100, 50), Some(Region::new(90, 40, 10, 10)));
        assert_eq!(Region::new(100, 0, 5, 5).clamp_to(100, 50), None);
    }

    #[test]
    fn sort_prefers_largest_then_position() {
        let mut regions = vec![
            Region::new(50, 10, 10, 10),
            Region::new(0, 0, 20, 20),
            Region::new(5, 10, 10, 10),
            Region::new(5, 2, 10, 10),
        ];
        sort_regions(&mut regions);
        assert_eq!(
            regions,
            vec![
                Region::new(0, 0, 20, 20),
                Region::new(5, 2, 10, 10),
                Region::new(5, 10, 10, 10),
                Region::new(50, 10, 10, 10),
            ]
        );
    }
}
