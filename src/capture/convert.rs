//! Conversions between fourcc frame layouts and packed 8-bit images

use serde::{Deserialize, Serialize};
use zune_jpeg::JpegDecoder;

use super::format::PixelFormat;
use crate::error::{Error, Result};
use crate::imgproc::PackedImage;

/// Channel order of a packed image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorOrder {
    Rgb,
    Bgr,
    Gray,
    Rgba,
}

impl ColorOrder {
    pub const fn channels(self) -> usize {
        match self {
            Self::Gray => 1,
            Self::Rgb | Self::Bgr => 3,
            Self::Rgba => 4,
        }
    }
}

#[inline]
fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let (y, d, e) = (y as f32, u as f32 - 128.0, v as f32 - 128.0);
    [
        clamp_u8(y + 1.402 * e),
        clamp_u8(y - 0.344_136 * d - 0.714_136 * e),
        clamp_u8(y + 1.772 * d),
    ]
}

#[inline]
fn luma(rgb: [u8; 3]) -> u8 {
    clamp_u8(0.299 * rgb[0] as f32 + 0.587 * rgb[1] as f32 + 0.114 * rgb[2] as f32)
}

/// Decodes frame bytes into RGB triplets.
fn decode_rgb(data: &[u8], width: u32, height: u32, fmt: PixelFormat) -> Result<Vec<u8>> {
    let (w, h) = (width as usize, height as usize);
    let need = fmt.image_size(width, height);
    if !fmt.is_compressed() && data.len() < need {
        return Err(Error::ShapeMismatch {
            expected: format!("{need} bytes for {width}x{height} {fmt}"),
            got: format!("{} bytes", data.len()),
        });
    }

    let mut rgb = Vec::with_capacity(w * h * 3);
    match fmt {
        PixelFormat::Rgb24 => rgb.extend_from_slice(&data[..need]),
        PixelFormat::Bgr24 => {
            for px in data[..need].chunks_exact(3) {
                rgb.extend_from_slice(&[px[2], px[1], px[0]]);
            }
        }
        PixelFormat::Rgba32 => {
            for px in data[..need].chunks_exact(4) {
                rgb.extend_from_slice(&px[..3]);
            }
        }
        PixelFormat::Grey => {
            for &g in &data[..need] {
                rgb.extend_from_slice(&[g, g, g]);
            }
        }
        PixelFormat::Yuyv => {
            for q in data[..need].chunks_exact(4) {
                rgb.extend_from_slice(&yuv_to_rgb(q[0], q[1], q[3]));
                rgb.extend_from_slice(&yuv_to_rgb(q[2], q[1], q[3]));
            }
        }
        PixelFormat::Rgb565 => {
            for px in data[..need].chunks_exact(2) {
                let v = u16::from_le_bytes([px[0], px[1]]);
                let r = ((v >> 11) & 0x1f) as u8;
                let g = ((v >> 5) & 0x3f) as u8;
                let b = (v & 0x1f) as u8;
                rgb.extend_from_slice(&[(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]);
            }
        }
        PixelFormat::Srggb8 => {
            // Each 2x2 RGGB cell yields one color shared by its four pixels
            let at = |x: usize, y: usize| data[y.min(h - 1) * w + x.min(w - 1)];
            for y in 0..h {
                let y0 = y & !1;
                for x in 0..w {
                    let x0 = x & !1;
                    let r = at(x0, y0);
                    let g = ((at(x0 + 1, y0) as u16 + at(x0, y0 + 1) as u16) / 2) as u8;
                    let b = at(x0 + 1, y0 + 1);
                    rgb.extend_from_slice(&[r, g, b]);
                }
            }
        }
        PixelFormat::Mjpeg => {
            let mut decoder = JpegDecoder::new(data);
            let pixels = decoder.decode().map_err(|e| Error::Jpeg(format!("{e:?}")))?;
            let (dw, dh) = decoder
                .dimensions()
                .ok_or_else(|| Error::Jpeg("missing dimensions".into()))?;
            if (dw, dh) != (w, h) {
                return Err(Error::ShapeMismatch {
                    expected: format!("{width}x{height} MJPEG frame"),
                    got: format!("{dw}x{dh}"),
                });
            }
            match pixels.len() / (w * h).max(1) {
                3 => rgb = pixels,
                1 => {
                    for g in pixels {
                        rgb.extend_from_slice(&[g, g, g]);
                    }
                }
                n => return Err(Error::UnsupportedChannels(n)),
            }
        }
    }
    Ok(rgb)
}

/// Decodes a JPEG image of unknown size into packed RGB.
pub fn decode_jpeg(data: &[u8]) -> Result<PackedImage> {
    let mut decoder = JpegDecoder::new(data);
    let pixels = decoder.decode().map_err(|e| Error::Jpeg(format!("{e:?}")))?;
    let (w, h) = decoder
        .dimensions()
        .ok_or_else(|| Error::Jpeg("missing dimensions".into()))?;
    let rgb = match pixels.len() / (w * h).max(1) {
        3 => pixels,
        1 => pixels.iter().flat_map(|&g| [g, g, g]).collect(),
        n => return Err(Error::UnsupportedChannels(n)),
    };
    PackedImage::from_vec(w as u32, h as u32, 3, rgb)
}

/// Converts one frame to a packed image in the requested channel order.
pub fn to_packed(
    data: &[u8],
    width: u32,
    height: u32,
    fmt: PixelFormat,
    order: ColorOrder,
) -> Result<PackedImage> {
    // Fast paths that only need a copy
    let direct = matches!(
        (fmt, order),
        (PixelFormat::Rgb24, ColorOrder::Rgb)
            | (PixelFormat::Bgr24, ColorOrder::Bgr)
            | (PixelFormat::Grey, ColorOrder::Gray)
            | (PixelFormat::Rgba32, ColorOrder::Rgba)
    );
    if direct {
        let need = fmt.image_size(width, height);
        if data.len() < need {
            return Err(Error::ShapeMismatch {
                expected: format!("{need} bytes"),
                got: format!("{} bytes", data.len()),
            });
        }
        return PackedImage::from_vec(width, height, order.channels(), data[..need].to_vec());
    }

    let rgb = decode_rgb(data, width, height, fmt)?;
    let out = match order {
        ColorOrder::Rgb => rgb,
        ColorOrder::Bgr => rgb
            .chunks_exact(3)
            .flat_map(|p| [p[2], p[1], p[0]])
            .collect(),
        ColorOrder::Gray => rgb
            .chunks_exact(3)
            .map(|p| luma([p[0], p[1], p[2]]))
            .collect(),
        ColorOrder::Rgba => rgb
            .chunks_exact(3)
            .flat_map(|p| [p[0], p[1], p[2], 255])
            .collect(),
    };
    PackedImage::from_vec(width, height, order.channels(), out)
}

/// Writes a packed image into a frame buffer of format `fmt`, returning the
/// number of bytes written.
pub fn from_packed(img: &PackedImage, order: ColorOrder, fmt: PixelFormat, dst: &mut [u8]) -> Result<usize> {
    if img.channels != order.channels() {
        return Err(Error::UnsupportedChannels(img.channels));
    }
    let need = fmt.image_size(img.width, img.height);
    if dst.len() < need {
        return Err(Error::ShapeMismatch {
            expected: format!("{need} byte buffer"),
            got: format!("{} bytes", dst.len()),
        });
    }
    let rgb_at = |px: &[u8]| -> [u8; 3] {
        match order {
            ColorOrder::Rgb | ColorOrder::Rgba => [px[0], px[1], px[2]],
            ColorOrder::Bgr => [px[2], px[1], px[0]],
            ColorOrder::Gray => [px[0], px[0], px[0]],
        }
    };
    let pixels = img.data.chunks_exact(img.channels);

    match fmt {
        PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Rgba32 | PixelFormat::Grey => {
            let bpp = fmt.bytes_per_pixel();
            for (out, px) in dst[..need].chunks_exact_mut(bpp).zip(pixels) {
                let c = rgb_at(px);
                match fmt {
                    PixelFormat::Rgb24 => out.copy_from_slice(&c),
                    PixelFormat::Bgr24 => out.copy_from_slice(&[c[2], c[1], c[0]]),
                    PixelFormat::Rgba32 => {
                        let a = if img.channels == 4 { px[3] } else { 255 };
                        out.copy_from_slice(&[c[0], c[1], c[2], a]);
                    }
                    _ => out[0] = luma(c),
                }
            }
        }
        PixelFormat::Yuyv => {
            if img.width % 2 != 0 {
                return Err(Error::format("YUYV needs an even width"));
            }
            let px: Vec<[u8; 3]> = pixels.map(rgb_at).collect();
            for (out, pair) in dst[..need].chunks_exact_mut(4).zip(px.chunks_exact(2)) {
                let (a, b) = (pair[0], pair[1]);
                let (r, g, bl) = (
                    (a[0] as f32 + b[0] as f32) * 0.5,
                    (a[1] as f32 + b[1] as f32) * 0.5,
                    (a[2] as f32 + b[2] as f32) * 0.5,
                );
                out[0] = luma(a);
                out[1] = clamp_u8(-0.168_736 * r - 0.331_264 * g + 0.5 * bl + 128.0);
                out[2] = luma(b);
                out[3] = clamp_u8(0.5 * r - 0.418_688 * g - 0.081_312 * bl + 128.0);
            }
        }
        PixelFormat::Rgb565 => {
            for (out, px) in dst[..need].chunks_exact_mut(2).zip(pixels) {
                let c = rgb_at(px);
                let v = ((c[0] as u16 >> 3) << 11) | ((c[1] as u16 >> 2) << 5) | (c[2] as u16 >> 3);
                out.copy_from_slice(&v.to_le_bytes());
            }
        }
        PixelFormat::Srggb8 | PixelFormat::Mjpeg => {
            return Err(Error::format(format!("cannot encode frames as {fmt}")));
        }
    }
    Ok(need)
}
