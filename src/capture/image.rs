use std::sync::Arc;

use super::buffer::{BufRead, BufWrite, VideoBuf};
use super::convert::{self, ColorOrder};
use super::format::PixelFormat;
use crate::error::{Error, Result};
use crate::imgproc::PackedImage;

/// A view over one frame held in a pool buffer. Cloning a `RawImage` shares
/// the buffer; it never copies pixels.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub fmt: PixelFormat,
    pub fps: f32,
    pub buf: Option<Arc<VideoBuf>>,
    pub bufindex: usize,
}

impl RawImage {
    pub fn new(
        width: u32,
        height: u32,
        fmt: PixelFormat,
        fps: f32,
        buf: Arc<VideoBuf>,
        bufindex: usize,
    ) -> Self {
        Self {
            width,
            height,
            fmt,
            fps,
            buf: Some(buf),
            bufindex,
        }
    }

    pub fn valid(&self) -> bool {
        self.buf.is_some()
    }

    pub fn invalidate(&mut self) {
        self.buf = None;
        self.bufindex = 0;
    }

    /// Size in bytes of the pixel data this image describes
    pub fn bytesize(&self) -> usize {
        match &self.buf {
            Some(buf) if self.fmt.is_compressed() => buf.bytes_used(),
            _ => self.fmt.image_size(self.width, self.height),
        }
    }

    pub fn pixels(&self) -> Result<BufRead<'_>> {
        self.buf
            .as_deref()
            .map(VideoBuf::read)
            .ok_or_else(|| Error::format("image has no buffer"))
    }

    pub fn pixels_mut(&self) -> Result<BufWrite<'_>> {
        self.buf
            .as_deref()
            .map(VideoBuf::write)
            .ok_or_else(|| Error::format("image has no buffer"))
    }

    /// Fails unless the image has the given geometry and format.
    pub fn require(&self, what: &str, width: u32, height: u32, fmt: PixelFormat) -> Result<()> {
        if self.width != width || self.height != height || self.fmt != fmt {
            return Err(Error::ShapeMismatch {
                expected: format!("{what} {width}x{height} {fmt}"),
                got: format!("{}x{} {}", self.width, self.height, self.fmt),
            });
        }
        Ok(())
    }

    /// Converts the frame into a packed 8-bit image with the given channel order.
    pub fn to_packed(&self, order: ColorOrder) -> Result<PackedImage> {
        let px = self.pixels()?;
        let len = self.bytesize().min(px.len());
        convert::to_packed(&px[..len], self.width, self.height, self.fmt, order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_follows_buffer() {
        let buf = Arc::new(VideoBuf::heap(PixelFormat::Grey.image_size(4, 2)));
        let mut img = RawImage::new(4, 2, PixelFormat::Grey, 30.0, buf.clone(), 3);
        assert!(img.valid());
        assert_eq!(img.bytesize(), 8);

        let copy = img.clone();
        assert!(Arc::ptr_eq(copy.buf.as_ref().unwrap(), &buf));

        img.invalidate();
        assert!(!img.valid());
        assert!(img.pixels().is_err());
        assert!(copy.valid());
    }

    #[test]
    fn require_checks_format() {
        let buf = Arc::new(VideoBuf::heap(32));
        let img = RawImage::new(4, 4, PixelFormat::Yuyv, 30.0, buf, 0);
        assert!(img.require("input", 4, 4, PixelFormat::Yuyv).is_ok());
        assert!(matches!(
            img.require("input", 4, 4, PixelFormat::Rgb24),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
