use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Pixel formats carried by frames, identified on the wire by their fourcc
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Yuyv,
    Rgb565,
    /// Bayer RGGB, 8 bits per sample
    Srggb8,
    Rgb24,
    Bgr24,
    Grey,
    Rgba32,
    Mjpeg,
}

impl PixelFormat {
    pub const fn fourcc(self) -> [u8; 4] {
        match self {
            Self::Yuyv => *b"YUYV",
            Self::Rgb565 => *b"RGBP",
            Self::Srggb8 => *b"RGGB",
            Self::Rgb24 => *b"RGB3",
            Self::Bgr24 => *b"BGR3",
            Self::Grey => *b"GREY",
            Self::Rgba32 => *b"AB24",
            Self::Mjpeg => *b"MJPG",
        }
    }

    pub fn from_fourcc(code: [u8; 4]) -> Result<Self> {
        Ok(match &code {
            b"YUYV" => Self::Yuyv,
            b"RGBP" => Self::Rgb565,
            b"RGGB" => Self::Srggb8,
            b"RGB3" => Self::Rgb24,
            b"BGR3" => Self::Bgr24,
            b"GREY" => Self::Grey,
            b"AB24" => Self::Rgba32,
            b"MJPG" => Self::Mjpeg,
            _ => {
                return Err(Error::format(format!(
                    "unsupported fourcc {}",
                    String::from_utf8_lossy(&code)
                )))
            }
        })
    }

    /// Bytes per pixel. MJPEG has no fixed pixel size and reports 2, which
    /// is what drivers use to size compressed buffers.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Srggb8 | Self::Grey => 1,
            Self::Yuyv | Self::Rgb565 | Self::Mjpeg => 2,
            Self::Rgb24 | Self::Bgr24 => 3,
            Self::Rgba32 => 4,
        }
    }

    pub const fn image_size(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }

    pub const fn is_compressed(self) -> bool {
        matches!(self, Self::Mjpeg)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cc = self.fourcc();
        write!(f, "{}", String::from_utf8_lossy(&cc))
    }
}
