//! Packed 8-bit images and the few geometric operations blob extraction needs

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Pixel, Rgb, Rgba};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Integer rectangle in pixel coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn right(&self) -> i32 {
        self.x + self.width
    }

    pub const fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub const fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let r = self.right().min(other.right());
        let b = self.bottom().min(other.bottom());
        if r <= x || b <= y {
            Rect::default()
        } else {
            Rect::new(x, y, r - x, b - y)
        }
    }
}

/// Resize interpolation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interp {
    #[default]
    Nearest,
    Linear,
    Area,
}

/// Interleaved 8-bit image with 1, 3 or 4 channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedImage {
    pub width: u32,
    pub height: u32,
    pub channels: usize,
    pub data: Vec<u8>,
}

impl PackedImage {
    pub fn new(width: u32, height: u32, channels: usize) -> Result<Self> {
        check_channels(channels)?;
        Ok(Self {
            width,
            height,
            channels,
            data: vec![0; width as usize * height as usize * channels],
        })
    }

    pub fn from_vec(width: u32, height: u32, channels: usize, data: Vec<u8>) -> Result<Self> {
        check_channels(channels)?;
        let want = width as usize * height as usize * channels;
        if data.len() != want {
            return Err(Error::ShapeMismatch {
                expected: format!("{want} bytes for {width}x{height}x{channels}"),
                got: format!("{} bytes", data.len()),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let stride = self.width as usize * self.channels;
        let start = y as usize * stride;
        &self.data[start..start + stride]
    }

    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let i = (y as usize * self.width as usize + x as usize) * self.channels;
        &self.data[i..i + self.channels]
    }

    /// Copies out the part of `rect` that lies inside the image.
    pub fn crop(&self, rect: Rect) -> Result<PackedImage> {
        let full = Rect::new(0, 0, self.width as i32, self.height as i32);
        let r = rect.intersect(&full);
        if r != rect || r.area() == 0 {
            return Err(Error::format(format!(
                "crop {rect:?} is not inside {}x{} image",
                self.width, self.height
            )));
        }
        if r == full {
            return Ok(self.clone());
        }
        let c = self.channels;
        let mut out = Vec::with_capacity(r.area() as usize * c);
        for y in r.y..r.bottom() {
            let row = self.row(y as u32);
            out.extend_from_slice(&row[r.x as usize * c..r.right() as usize * c]);
        }
        PackedImage::from_vec(r.width as u32, r.height as u32, c, out)
    }

    /// Resamples to `width`x`height`. Downscaling with [`Interp::Linear`] or
    /// [`Interp::Area`] widens the triangle filter to the scale factor, so
    /// every source pixel contributes.
    pub fn resize(&self, width: u32, height: u32, interp: Interp) -> Result<PackedImage> {
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }
        if width == 0 || height == 0 {
            return Err(Error::format(format!("cannot resize to {width}x{height}")));
        }
        let filter = match interp {
            Interp::Nearest => FilterType::Nearest,
            Interp::Linear | Interp::Area => FilterType::Triangle,
        };
        let data = match self.channels {
            1 => self.resampled::<Luma<u8>>(width, height, filter)?,
            3 => self.resampled::<Rgb<u8>>(width, height, filter)?,
            4 => self.resampled::<Rgba<u8>>(width, height, filter)?,
            n => return Err(Error::UnsupportedChannels(n)),
        };
        PackedImage::from_vec(width, height, self.channels, data)
    }

    fn resampled<P>(&self, width: u32, height: u32, filter: FilterType) -> Result<Vec<u8>>
    where
        P: Pixel<Subpixel = u8> + 'static,
    {
        let src = ImageBuffer::<P, &[u8]>::from_raw(self.width, self.height, &self.data[..])
            .ok_or_else(|| Error::format(format!("{}x{} image has a short buffer", self.width, self.height)))?;
        Ok(imageops::resize(&src, width, height, filter).into_raw())
    }

    /// Swaps the first and third channel in place (RGB <-> BGR).
    pub fn swap_rb(&mut self) {
        if self.channels < 3 {
            return;
        }
        for px in self.data.chunks_exact_mut(self.channels) {
            px.swap(0, 2);
        }
    }
}

fn check_channels(channels: usize) -> Result<()> {
    match channels {
        1 | 3 | 4 => Ok(()),
        n => Err(Error::UnsupportedChannels(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> PackedImage {
        let data = (0..w * h).flat_map(|i| [i as u8, 0, 255]).collect();
        PackedImage::from_vec(w, h, 3, data).unwrap()
    }

    #[test]
    fn rejects_bad_channel_counts() {
        assert!(matches!(
            PackedImage::new(2, 2, 2),
            Err(Error::UnsupportedChannels(2))
        ));
        assert!(PackedImage::from_vec(2, 2, 1, vec![0; 3]).is_err());
    }

    #[test]
    fn crop_extracts_region() {
        let img = gradient(4, 4);
        let c = img.crop(Rect::new(1, 2, 2, 1)).unwrap();
        assert_eq!((c.width, c.height), (2, 1));
        assert_eq!(c.pixel(0, 0)[0], 9);
        assert_eq!(c.pixel(1, 0)[0], 10);
        assert!(img.crop(Rect::new(3, 3, 2, 2)).is_err());
    }

    #[test]
    fn resize_keeps_constant_images_constant() {
        let img = PackedImage::from_vec(6, 4, 1, vec![77; 24]).unwrap();
        for interp in [Interp::Nearest, Interp::Linear, Interp::Area] {
            let r = img.resize(3, 2, interp).unwrap();
            assert_eq!(r.data, vec![77; 6], "{interp:?}");
            let r = img.resize(12, 8, interp).unwrap();
            assert!(r.data.iter().all(|&v| v == 77), "{interp:?}");
        }
    }

    #[test]
    fn area_resize_averages_blocks() {
        let img = PackedImage::from_vec(2, 2, 1, vec![0, 100, 100, 200]).unwrap();
        assert_eq!(img.resize(1, 1, Interp::Area).unwrap().data, vec![100]);
    }

    #[test]
    fn shrinking_sees_every_source_pixel() {
        // A single bright pixel far from the sample centre still shows up
        let img = PackedImage::from_vec(4, 1, 1, vec![0, 0, 0, 255]).unwrap();
        let v = img.resize(1, 1, Interp::Area).unwrap().data[0];
        assert!(v > 0 && v < 128, "got {v}");

        // Nearest never invents values
        let img = PackedImage::from_vec(4, 1, 3, [10u8, 20, 30, 40].iter().flat_map(|&v| [v; 3]).collect()).unwrap();
        let r = img.resize(2, 1, Interp::Nearest).unwrap();
        assert_eq!(r.data.len(), 6);
        assert!(r.data.iter().all(|v| [10, 20, 30, 40].contains(v)));

        assert!(img.resize(0, 4, Interp::Linear).is_err());
    }

    #[test]
    fn swap_rb_swaps_outer_channels() {
        let mut img = PackedImage::from_vec(1, 1, 4, vec![1, 2, 3, 4]).unwrap();
        img.swap_rb();
        assert_eq!(img.data, vec![3, 2, 1, 4]);
    }
}
