//! Resolution-independent coordinates for results sent to controllers
//!
//! x spans [-1000, 1000] left to right. y spans [-750, 750] top to bottom,
//! or [-800, 800] for 16:9 sensors.

use crate::error::{Error, Result};

pub const STD_HALF_WIDTH: f32 = 1000.0;
pub const STD_HALF_HEIGHT: f32 = 750.0;
pub const STD_HALF_HEIGHT_WIDE: f32 = 800.0;

/// Linear map between pixels of a `width`x`height` image and standardized
/// coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StdCoords {
    width: f32,
    height: f32,
    half_h: f32,
}

impl StdCoords {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::format(format!("invalid image size {width}x{height}")));
        }
        let wide = width as u64 * 9 == height as u64 * 16;
        Ok(Self {
            width: width as f32,
            height: height as f32,
            half_h: if wide { STD_HALF_HEIGHT_WIDE } else { STD_HALF_HEIGHT },
        })
    }

    /// Half the standardized height for this aspect ratio
    pub fn half_height(&self) -> f32 {
        self.half_h
    }

    pub fn img_to_std(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x / self.width * 2.0 * STD_HALF_WIDTH - STD_HALF_WIDTH,
            y / self.height * 2.0 * self.half_h - self.half_h,
        )
    }

    pub fn std_to_img(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x + STD_HALF_WIDTH) * self.width / (2.0 * STD_HALF_WIDTH),
            (y + self.half_h) * self.height / (2.0 * self.half_h),
        )
    }

    pub fn img_to_std_size(&self, w: f32, h: f32) -> (f32, f32) {
        (
            w / self.width * 2.0 * STD_HALF_WIDTH,
            h / self.height * 2.0 * self.half_h,
        )
    }

    pub fn std_to_img_size(&self, w: f32, h: f32) -> (f32, f32) {
        (
            w * self.width / (2.0 * STD_HALF_WIDTH),
            h * self.height / (2.0 * self.half_h),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corners_and_center_map_to_bounds() {
        let c = StdCoords::new(640, 480).unwrap();
        assert_eq!(c.img_to_std(0.0, 0.0), (-1000.0, -750.0));
        assert_eq!(c.img_to_std(640.0, 480.0), (1000.0, 750.0));
        assert_eq!(c.img_to_std(320.0, 240.0), (0.0, 0.0));
        assert_eq!(c.img_to_std_size(64.0, 48.0), (200.0, 150.0));
    }

    #[test]
    fn wide_sensors_use_taller_range() {
        let c = StdCoords::new(1920, 1080).unwrap();
        assert_eq!(c.half_height(), 800.0);
        assert_eq!(c.img_to_std(0.0, 1080.0), (-1000.0, 800.0));
    }

    #[test]
    fn inverse_mapping_round_trips() {
        let c = StdCoords::new(1280, 720).unwrap();
        let (sx, sy) = c.img_to_std(123.0, 456.0);
        let (x, y) = c.std_to_img(sx, sy);
        assert!((x - 123.0).abs() < 1e-3 && (y - 456.0).abs() < 1e-3);
        let (w, h) = c.std_to_img_size(200.0, 100.0);
        assert_eq!(c.img_to_std_size(w, h), (200.0, 100.0));
        assert!(StdCoords::new(0, 10).is_err());
    }
}
