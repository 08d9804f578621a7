//! Turns camera frames into network input tensors and maps coordinates back

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::tensor::{each_data, DType, Layout, Quant, Tensor, TensorAttr, TensorData};
use super::utils::{apply_letterbox, quantize};
use crate::capture::convert::ColorOrder;
use crate::capture::{PixelFormat, RawImage};
use crate::error::{Error, Result};
use crate::imgproc::{Interp, PackedImage, Rect};

/// Blob extraction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreProcessorConfig {
    /// Network expects RGB rather than BGR
    pub rgb: bool,
    /// Applied after mean subtraction
    pub scale: f32,
    /// Per channel, in the network's channel order
    pub mean: [f32; 3],
    pub stdev: [f32; 3],
    /// Crop to the tensor aspect ratio instead of stretching
    pub letterbox: bool,
    pub interp: Interp,
    /// Number of blobs to build per frame
    pub numin: usize,
    /// Record a description of every step
    pub details: bool,
}

impl Default for PreProcessorConfig {
    fn default() -> Self {
        Self {
            rgb: true,
            scale: 2.0 / 255.0,
            mean: [127.5; 3],
            stdev: [1.0; 3],
            letterbox: false,
            interp: Interp::Nearest,
            numin: 1,
            details: false,
        }
    }
}

/// Builds tensors from an image whose channel order is already settled
pub trait BlobExtractor: Send {
    /// Extracts one blob per attribute. `swaprb` asks for red and blue to be
    /// exchanged on the way. One crop rectangle per blob is appended to `crops`.
    fn extract(
        &mut self,
        img: &PackedImage,
        swaprb: bool,
        attrs: &[TensorAttr],
        crops: &mut Vec<Rect>,
    ) -> Result<Vec<Tensor>>;

    /// Descriptions of the last extraction
    fn info(&self) -> &[String] {
        &[]
    }
}

/// Frame to tensor conversion plus the inverse coordinate mapping
pub struct PreProcessor {
    rgb: bool,
    extractor: Box<dyn BlobExtractor>,
    attrs: Vec<TensorAttr>,
    blobs: Vec<Tensor>,
    crops: Vec<Rect>,
    image_size: (u32, u32),
    image_fmt: Option<PixelFormat>,
}

impl PreProcessor {
    pub fn new(cfg: PreProcessorConfig) -> Self {
        let rgb = cfg.rgb;
        Self::with_extractor(rgb, Box::new(BlobPreProcessor::new(cfg)))
    }

    pub fn with_extractor(rgb: bool, extractor: Box<dyn BlobExtractor>) -> Self {
        Self {
            rgb,
            extractor,
            attrs: Vec::new(),
            blobs: Vec::new(),
            crops: Vec::new(),
            image_size: (0, 0),
            image_fmt: None,
        }
    }

    /// Converts `img` into blobs for `attrs`. The attributes seen on the
    /// first call are kept for every later frame.
    #[instrument(skip_all, fields(w = img.width, h = img.height))]
    pub fn process(&mut self, img: &RawImage, attrs: &[TensorAttr]) -> Result<&[Tensor]> {
        let start = Instant::now();
        self.image_fmt = Some(img.fmt);

        // Frames already in packed 24-bit color skip conversion; a channel
        // order mismatch is folded into the blob extraction.
        let (packed, swaprb) = match (img.fmt, self.rgb) {
            (PixelFormat::Rgb24, rgb) => (img.to_packed(ColorOrder::Rgb)?, !rgb),
            (PixelFormat::Bgr24, rgb) => (img.to_packed(ColorOrder::Bgr)?, rgb),
            (_, true) => (img.to_packed(ColorOrder::Rgb)?, false),
            (_, false) => (img.to_packed(ColorOrder::Bgr)?, false),
        };
        self.process_packed(&packed, swaprb, attrs)?;

        metrics::histogram!("preprocess_time_us").record(start.elapsed().as_micros() as f64);
        Ok(&self.blobs)
    }

    /// Like [`process`](Self::process) for an image already in packed form.
    pub fn process_packed(
        &mut self,
        img: &PackedImage,
        swaprb: bool,
        attrs: &[TensorAttr],
    ) -> Result<&[Tensor]> {
        self.image_size = (img.width, img.height);
        self.crops.clear();
        self.blobs.clear();

        if self.attrs.is_empty() {
            self.attrs = attrs.to_vec();
        }
        if self.attrs.is_empty() {
            return Err(Error::format("cannot work with no input tensors"));
        }

        self.blobs = self
            .extractor
            .extract(img, swaprb, &self.attrs, &mut self.crops)?;
        debug!("Extracted {} blobs", self.blobs.len());
        Ok(&self.blobs)
    }

    pub fn blobs(&self) -> &[Tensor] {
        &self.blobs
    }

    pub fn image_size(&self) -> (u32, u32) {
        self.image_size
    }

    pub fn image_format(&self) -> Option<PixelFormat> {
        self.image_fmt
    }

    /// Width and height of input tensor `num`
    pub fn blob_size(&self, num: usize) -> Result<(u32, u32)> {
        self.attrs
            .get(num)
            .ok_or_else(|| {
                Error::format(format!(
                    "invalid blob number {num}, only have {} blobs",
                    self.attrs.len()
                ))
            })?
            .size()
    }

    /// Crop rectangle of blob `num` in image coordinates
    pub fn crop(&self, num: usize) -> Result<Rect> {
        self.crops.get(num).copied().ok_or_else(|| {
            Error::format(format!(
                "invalid blob number {num}, only have {} crops",
                self.crops.len()
            ))
        })
    }

    fn letterboxed(&self, num: usize) -> Result<bool> {
        let r = self.crop(num)?;
        Ok(r.x != 0 || r.y != 0)
    }

    /// Maps a point from blob `num` to image coordinates.
    pub fn b2i(&self, x: f32, y: f32, num: usize) -> Result<(f32, f32)> {
        self.b2i_with(x, y, self.blob_size(num)?, self.letterboxed(num)?)
    }

    pub fn b2i_with(&self, x: f32, y: f32, bsiz: (u32, u32), letterboxed: bool) -> Result<(f32, f32)> {
        let (bw, bh) = nonzero(bsiz)?;
        let (iw, ih) = (self.image_size.0 as f32, self.image_size.1 as f32);
        if letterboxed {
            let fac = (iw / bw).min(ih / bh);
            let cropw = fac * bw + 0.4999;
            let croph = fac * bh + 0.4999;
            Ok(((iw - cropw) * 0.5 + x * fac, (ih - croph) * 0.5 + y * fac))
        } else {
            Ok((x * iw / bw, y * ih / bh))
        }
    }

    /// Maps a point from image coordinates into blob `num`.
    pub fn i2b(&self, x: f32, y: f32, num: usize) -> Result<(f32, f32)> {
        self.i2b_with(x, y, self.blob_size(num)?, self.letterboxed(num)?)
    }

    pub fn i2b_with(&self, x: f32, y: f32, bsiz: (u32, u32), letterboxed: bool) -> Result<(f32, f32)> {
        let (bw, bh) = nonzero(bsiz)?;
        let (iw, ih) = (self.image_size.0 as f32, self.image_size.1 as f32);
        if letterboxed {
            let fac = (iw / bw).min(ih / bh);
            let cropw = fac * bw + 0.4999;
            let croph = fac * bh + 0.4999;
            Ok(((x - (iw - cropw) * 0.5) / fac, (y - (ih - croph) * 0.5) / fac))
        } else {
            Ok((x * bw / iw, y * bh / ih))
        }
    }

    /// Scales a size (no offset) from blob `num` to image coordinates.
    pub fn b2is(&self, sx: f32, sy: f32, num: usize) -> Result<(f32, f32)> {
        let (bw, bh) = nonzero(self.blob_size(num)?)?;
        let (iw, ih) = (self.image_size.0 as f32, self.image_size.1 as f32);
        if self.letterboxed(num)? {
            let fac = (iw / bw).min(ih / bh);
            Ok((sx * fac, sy * fac))
        } else {
            Ok((sx * iw / bw, sy * ih / bh))
        }
    }

    pub fn info(&self) -> &[String] {
        self.extractor.info()
    }
}

fn nonzero((w, h): (u32, u32)) -> Result<(f32, f32)> {
    if w == 0 || h == 0 {
        return Err(Error::ZeroBlobSize(w, h));
    }
    Ok((w as f32, h as f32))
}

/// Default extractor: crop, resize, normalize, quantize, lay out
pub struct BlobPreProcessor {
    cfg: PreProcessorConfig,
    info: Vec<String>,
}

impl BlobPreProcessor {
    pub fn new(cfg: PreProcessorConfig) -> Self {
        Self {
            cfg,
            info: Vec::new(),
        }
    }

    fn note(&mut self, prefix: &str, msg: impl FnOnce() -> String) {
        if self.cfg.details {
            self.info.push(format!("{prefix}{}", msg()));
        }
    }

    fn extract_one(
        &mut self,
        img: &PackedImage,
        swaprb: bool,
        attr: &TensorAttr,
        bnum: usize,
    ) -> Result<(Tensor, Rect)> {
        let prefix = if self.cfg.details {
            format!("Blob {bnum}: ")
        } else {
            String::new()
        };
        let (bw, bh) = attr.size()?;
        if [bw, bh].iter().any(|&d| d == 1 || d == 3) {
            return Err(Error::format(format!(
                "incorrect input tensor {attr}; did you swap NHWC vs NCHW in the tensor specification?"
            )));
        }

        let crop = if self.cfg.letterbox {
            let (cw, ch) = apply_letterbox(bw, bh, img.width, img.height);
            let r = Rect::new(
                ((img.width - cw) / 2) as i32,
                ((img.height - ch) / 2) as i32,
                cw as i32,
                ch as i32,
            );
            self.note(&prefix, || format!("Letterbox {cw}x{ch} @ {},{}", r.x, r.y));
            r
        } else {
            Rect::new(0, 0, img.width as i32, img.height as i32)
        };

        let mut blob = img.crop(crop)?.resize(bw, bh, self.cfg.interp)?;
        self.note(&prefix, || format!("Resize to {bw}x{bh}"));

        let nch = blob.channels;
        let layout = attr.effective_layout();
        let mut mean = self.cfg.mean;
        let mut stdev = self.cfg.stdev;

        // Packed outputs get their channels swapped now, planar ones while splitting
        let mut swapped = false;
        if swaprb && layout == Layout::Nhwc && nch >= 3 {
            blob.swap_rb();
            swapped = true;
            self.note(&prefix, || "Swap Red <-> Blue".into());
        }
        if swaprb && !swapped {
            mean.swap(0, 2);
            stdev.swap(0, 2);
        }

        let data = self.convert(&blob, attr, mean, stdev, &prefix)?;

        let (data, dims) = match nch {
            1 => (data, vec![1, 1, bh as usize, bw as usize]),
            3 | 4 => match layout {
                Layout::Nchw => {
                    let hw = bw as usize * bh as usize;
                    let planar = each_data!(data, v => TensorData::from(planarize(&v, nch, hw, swaprb)));
                    self.note(&prefix, || "Split channels (NHWC->NCHW)".into());
                    (planar, vec![1, nch, bh as usize, bw as usize])
                }
                Layout::Nhwc => (data, vec![1, bh as usize, bw as usize, nch]),
                other => {
                    return Err(Error::UnsupportedLayout(format!(
                        "can only handle NCHW or NHWC input tensors, got {other:?}"
                    )))
                }
            },
            n => return Err(Error::UnsupportedChannels(n)),
        };

        // Keep the declared dims when only the rank differs
        let dims = if attr.total() == data.len() {
            attr.dims.clone()
        } else {
            dims
        };
        let out_attr = TensorAttr {
            layout: attr.layout,
            dtype: data.dtype(),
            dims,
            quant: attr.quant,
        };
        self.note(&prefix, || attr.to_string());
        Ok((Tensor::new(out_attr, data)?, crop))
    }

    fn convert(
        &mut self,
        blob: &PackedImage,
        attr: &TensorAttr,
        mean: [f32; 3],
        stdev: [f32; 3],
        prefix: &str,
    ) -> Result<TensorData> {
        let sc = self.cfg.scale;
        let tt = attr.dtype;
        let nch = blob.channels;
        let px = &blob.data;
        let uniform_sd = stdev[0] == stdev[1] && stdev[1] == stdev[2];
        let uniform_mean = mean[0] == mean[1] && mean[1] == mean[2];
        let unit_sd = uniform_sd && stdev[0] > 0.99 && stdev[0] < 1.01;
        // Alpha, if present, is passed through without normalization
        let m = |c: usize| if c < 3 { mean[c] } else { 0.0 };
        let sd = |c: usize| if c < 3 { stdev[c] } else { 1.0 };
        let subtract_mean = mean.iter().any(|&v| v > 1.0);

        if tt == DType::U8 && attr.quant == Quant::None {
            self.note(prefix, || "8U to 8U direct, no quantization (ignoring mean, scale, stdev)".into());
            return Ok(TensorData::U8(px.clone()));
        }

        if let (true, Quant::Dfp { fl }) = (unit_sd, attr.quant) {
            match tt {
                DType::I8 => {
                    if !(0..=7).contains(&fl) {
                        return Err(Error::Quantization(format!(
                            "invalid DFP fl value {fl}: must be in [0..7]"
                        )));
                    }
                    let shift = 8 - fl;
                    self.note(prefix, || format!("8U to 8S DFP:{fl}: bit-shift >> {shift}"));
                    let out = px
                        .iter()
                        .enumerate()
                        .map(|(i, &v)| {
                            let q = (v >> shift) as f32;
                            if subtract_mean {
                                q - m(i % nch)
                            } else {
                                q
                            }
                        });
                    return Ok(TensorData::from_f32(DType::I8, out));
                }
                DType::I16 => {
                    if !(0..=15).contains(&fl) {
                        return Err(Error::Quantization(format!(
                            "invalid DFP fl value {fl}: must be in [0..15]"
                        )));
                    }
                    self.note(prefix, || format!("8U to 16S DFP:{fl}"));
                    let out = px.iter().enumerate().map(|(i, &v)| {
                        let v = v as i32;
                        let q = (if fl > 8 { v << (fl - 8) } else { v >> (8 - fl) }) as f32;
                        if subtract_mean {
                            q - m(i % nch)
                        } else {
                            q
                        }
                    });
                    return Ok(TensorData::from_f32(DType::I16, out));
                }
                _ => {}
            }
        }

        if uniform_sd && uniform_mean {
            let qz = match attr.quant {
                Quant::Affine { scale, zero_point } => Some((scale, zero_point as f32)),
                Quant::Dfp { fl } => Some((1.0 / 2f32.powi(fl), 0.0)),
                Quant::None => None,
            };
            if let Some((qs, zp)) = qz {
                if qs == 0.0 {
                    return Err(Error::Quantization("quantizer scale must not be zero".into()));
                }
                let mut alpha = sc / (stdev[0] * qs);
                let mut beta = zp - mean[0] * alpha;
                if alpha > 0.99 && alpha < 1.01 {
                    alpha = 1.0;
                }
                if beta > -0.51 && beta < 0.51 {
                    beta = 0.0;
                }
                self.note(prefix, || format!("8U to {tt} fast path: out = in*{alpha}{beta:+}"));
                if alpha == 1.0 && beta == 0.0 && tt == DType::U8 {
                    return Ok(TensorData::U8(px.clone()));
                }
                return Ok(TensorData::from_f32(
                    tt,
                    px.iter().map(|&v| v as f32 * alpha + beta),
                ));
            }
        }

        // General path through float
        self.note(prefix, || "Convert to 32F".into());
        let divide = stdev != [1.0; 3];
        let div: Vec<f32> = (0..nch)
            .map(|c| if sc != 1.0 { sd(c) / sc } else { sd(c) })
            .collect();
        let vals: Vec<f32> = px
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let c = i % nch;
                let v = v as f32 - m(c);
                if divide {
                    v / div[c]
                } else {
                    v * sc
                }
            })
            .collect();

        match tt {
            DType::F32 => Ok(TensorData::F32(vals)),
            DType::F64 => Ok(TensorData::F64(vals.into_iter().map(f64::from).collect())),
            _ => {
                self.note(prefix, || format!("Quantize to {attr}"));
                let flat = Tensor::from_f32(vec![vals.len()], vals)?;
                let flat_attr = TensorAttr {
                    dims: vec![flat.len()],
                    ..attr.clone()
                };
                Ok(quantize(&flat, &flat_attr)?.data)
            }
        }
    }
}

impl BlobExtractor for BlobPreProcessor {
    fn extract(
        &mut self,
        img: &PackedImage,
        swaprb: bool,
        attrs: &[TensorAttr],
        crops: &mut Vec<Rect>,
    ) -> Result<Vec<Tensor>> {
        self.info.clear();
        if self.cfg.stdev.iter().any(|&s| s == 0.0) {
            return Err(Error::format("stdev cannot be zero"));
        }
        if self.cfg.scale == 0.0 {
            return Err(Error::format("scale cannot be zero"));
        }

        let mut blobs = Vec::new();
        for (bnum, attr) in attrs.iter().enumerate().take(self.cfg.numin.max(1)) {
            let (blob, crop) = self.extract_one(img, swaprb, attr, bnum)?;
            blobs.push(blob);
            crops.push(crop);
        }
        Ok(blobs)
    }

    fn info(&self) -> &[String] {
        &self.info
    }
}

/// Packed to planar; with `swaprb` the first and third planes trade places.
fn planarize<T: Copy + Default>(v: &[T], nch: usize, hw: usize, swaprb: bool) -> Vec<T> {
    let mut out = vec![T::default(); v.len()];
    for (i, px) in v.chunks_exact(nch).enumerate() {
        for (c, &val) in px.iter().enumerate() {
            let plane = match (swaprb, c) {
                (true, 0) => 2,
                (true, 2) => 0,
                _ => c,
            };
            out[plane * hw + i] = val;
        }
    }
    out
}

macro_rules! impl_from_vec {
    ($($t:ty => $v:ident),*) => {
        $(impl From<Vec<$t>> for TensorData {
            fn from(v: Vec<$t>) -> Self {
                TensorData::$v(v)
            }
        })*
    };
}

impl_from_vec!(u8 => U8, i8 => I8, u16 => U16, i16 => I16, u32 => U32, i32 => I32, f32 => F32, f64 => F64);

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> PackedImage {
        let data = (0..w * h).flat_map(|_| rgb).collect();
        PackedImage::from_vec(w, h, 3, data).unwrap()
    }

    fn nchw(dtype: DType, w: usize, h: usize) -> TensorAttr {
        TensorAttr::new(Layout::Nchw, dtype, vec![1, 3, h, w])
    }

    #[test]
    fn float_blob_is_normalized_and_planar() {
        let mut pp = PreProcessor::new(PreProcessorConfig::default());
        let img = solid(64, 48, [255, 127, 0]);
        let blobs = pp
            .process_packed(&img, false, &[nchw(DType::F32, 32, 24)])
            .unwrap();
        let b = &blobs[0];
        assert_eq!(b.dims(), &[1, 3, 24, 32]);
        let v = b.as_f32().unwrap();
        let plane = 32 * 24;
        assert!((v[0] - 1.0).abs() < 1e-5);
        assert!((v[plane] - (127.0 - 127.5) * 2.0 / 255.0).abs() < 1e-5);
        assert!((v[2 * plane] + 1.0).abs() < 1e-5);
    }

    #[test]
    fn swaprb_swaps_planes() {
        let cfg = PreProcessorConfig {
            scale: 1.0,
            mean: [0.0; 3],
            ..Default::default()
        };
        let mut pp = PreProcessor::new(cfg);
        let img = solid(8, 8, [10, 20, 30]);
        let b = &pp.process_packed(&img, true, &[nchw(DType::F32, 4, 4)]).unwrap()[0];
        let v = b.as_f32().unwrap();
        assert_eq!((v[0], v[16], v[32]), (30.0, 20.0, 10.0));
    }

    #[test]
    fn u8_passthrough_nhwc() {
        let mut pp = PreProcessor::new(PreProcessorConfig::default());
        let img = solid(8, 8, [1, 2, 3]);
        let attr = TensorAttr::new(Layout::Nhwc, DType::U8, vec![1, 4, 4, 3]);
        let b = &pp.process_packed(&img, true, &[attr.clone()]).unwrap()[0];
        assert!(attr.matches(b));
        assert_eq!(&b.data, &TensorData::U8([3, 2, 1].repeat(16)));
    }

    #[test]
    fn affine_fast_path_quantizes() {
        let mut pp = PreProcessor::new(PreProcessorConfig::default());
        let img = solid(8, 8, [255, 0, 128]);
        let attr = nchw(DType::U8, 4, 4).with_quant(Quant::Affine {
            scale: 2.0 / 255.0,
            zero_point: 128,
        });
        let b = &pp.process_packed(&img, false, &[attr]).unwrap()[0];
        let TensorData::U8(v) = &b.data else {
            panic!("expected 8U blob");
        };
        // Normalization and quantization cancel out: alpha snaps to 1, beta to 0
        assert_eq!((v[0], v[16], v[32]), (255, 0, 128));
    }

    #[test]
    fn dfp_int8_shift() {
        let cfg = PreProcessorConfig {
            mean: [0.0; 3],
            ..Default::default()
        };
        let mut pp = PreProcessor::new(cfg);
        let img = solid(8, 8, [255, 128, 0]);
        let attr = nchw(DType::I8, 4, 4).with_quant(Quant::Dfp { fl: 7 });
        let b = &pp.process_packed(&img, false, &[attr]).unwrap()[0];
        let TensorData::I8(v) = &b.data else {
            panic!("expected 8S blob");
        };
        assert_eq!((v[0], v[16], v[32]), (127, 64, 0));
    }

    #[test]
    fn letterbox_crop_and_round_trip() {
        let cfg = PreProcessorConfig {
            letterbox: true,
            ..Default::default()
        };
        let mut pp = PreProcessor::new(cfg);
        let img = solid(640, 480, [0, 0, 0]);
        pp.process_packed(&img, false, &[nchw(DType::F32, 224, 224)])
            .unwrap();
        assert_eq!(pp.crop(0).unwrap(), Rect::new(80, 0, 480, 480));
        let (x, y) = pp.b2i(0.0, 0.0, 0).unwrap();
        assert!((x - 80.0).abs() < 0.5 && y.abs() < 0.5);
        let (bx, by) = pp.i2b(x, y, 0).unwrap();
        assert!(bx.abs() < 1e-3 && by.abs() < 1e-3);
        let (sw, sh) = pp.b2is(224.0, 224.0, 0).unwrap();
        assert!((sw - 480.0).abs() < 1e-3 && (sh - 480.0).abs() < 1e-3);
    }

    #[test]
    fn rejects_swapped_layout_and_missing_inputs() {
        let mut pp = PreProcessor::new(PreProcessorConfig::default());
        let img = solid(8, 8, [0, 0, 0]);
        assert!(pp.process_packed(&img, false, &[]).is_err());
        let wrong = TensorAttr::new(Layout::Nhwc, DType::F32, vec![1, 3, 8, 8]);
        assert!(pp.process_packed(&img, false, &[wrong]).is_err());
    }

    #[test]
    fn zero_blob_size_is_an_error() {
        let pp = PreProcessor::new(PreProcessorConfig::default());
        assert!(matches!(
            pp.b2i_with(1.0, 1.0, (0, 10), false),
            Err(Error::ZeroBlobSize(0, 10))
        ));
    }

    #[test]
    fn bad_normalization_params() {
        let cfg = PreProcessorConfig {
            stdev: [1.0, 0.0, 1.0],
            ..Default::default()
        };
        let mut pp = PreProcessor::new(cfg);
        let img = solid(8, 8, [0, 0, 0]);
        assert!(pp.process_packed(&img, false, &[nchw(DType::F32, 4, 4)]).is_err());
    }
}
