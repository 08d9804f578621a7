//! Numeric and bookkeeping helpers shared by pre-processing, networks and decoders

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use tracing::{info, warn};

use super::tensor::{strshape, DType, Layout, Quant, Tensor, TensorAttr, TensorData};
use crate::error::{Error, Result};
use crate::imgproc::Rect;

/// In-place softmax over `values`, optionally with a temperature `fac`.
/// With `maxonly`, only the largest entry is normalized. Returns the index
/// of the largest entry.
pub fn softmax(values: &mut [f32], fac: f32, maxonly: bool) -> usize {
    let mut largest = f32::MIN;
    let mut largest_idx = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > largest {
            largest = v;
            largest_idx = i;
        }
    }

    let mut sum = 0.0;
    for v in values.iter_mut() {
        let e = if fac == 1.0 {
            (*v - largest).exp()
        } else {
            (*v / fac - largest / fac).exp()
        };
        sum += e;
        *v = e;
    }

    if sum != 0.0 {
        if maxonly {
            values[largest_idx] /= sum;
        } else {
            values.iter_mut().for_each(|v| *v /= sum);
        }
    }
    largest_idx
}

/// The `k` largest scores as `(index, score)`, best first. Among equal
/// scores the lower index wins.
pub fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let k = k.min(scores.len());
    let mut order: Vec<usize> = (0..scores.len()).collect();
    // Stable sort keeps lower indices first among ties
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order.truncate(k);
    order.into_iter().map(|i| (i, scores[i])).collect()
}

fn check_total(t: &Tensor, attr: &TensorAttr) -> Result<()> {
    if t.len() != attr.total() {
        return Err(Error::ShapeMismatch {
            expected: attr.to_string(),
            got: t.shapestr(),
        });
    }
    Ok(())
}

/// Quantizes a 32F tensor to the type and quantization of `attr`. Only the
/// element count has to match since the input may still be a packed image.
pub fn quantize(t: &Tensor, attr: &TensorAttr) -> Result<Tensor> {
    let src = t.require_f32("quantize")?;
    check_total(t, attr)?;

    let data = match (attr.quant, attr.dtype) {
        (Quant::None, dtype) => TensorData::from_f32(dtype, src.iter().copied()),
        (Quant::Dfp { fl }, dtype @ (DType::I8 | DType::I16)) => {
            let max_fl = if dtype == DType::I8 { 7 } else { 15 };
            if !(0..=max_fl).contains(&fl) {
                return Err(Error::Quantization(format!(
                    "invalid DFP fl value {fl}: must be in [0..{max_fl}]"
                )));
            }
            let fac = (1 << fl) as f32;
            TensorData::from_f32(dtype, src.iter().map(|&v| v * fac))
        }
        (Quant::Affine { scale, zero_point }, dtype @ (DType::U8 | DType::I8 | DType::U16 | DType::I16)) => {
            if scale == 0.0 {
                return Err(Error::Quantization(format!(
                    "quantization scale must not be zero in {attr}"
                )));
            }
            let zp = zero_point as f32;
            TensorData::from_f32(dtype, src.iter().map(|&v| v / scale + zp))
        }
        _ => {
            return Err(Error::Quantization(format!(
                "quantization to {attr} not supported"
            )))
        }
    };
    Tensor::new(attr.clone(), data)
}

/// Converts a quantized tensor back to 32F. The tensor must exactly match `attr`.
pub fn dequantize(t: &Tensor, attr: &TensorAttr) -> Result<Tensor> {
    attr.check(t)?;
    let values = t.data.to_f32_vec();
    let values = match attr.quant {
        Quant::None => values,
        Quant::Dfp { fl } => {
            let fac = 1.0 / 2f32.powi(fl);
            values.into_iter().map(|v| v * fac).collect()
        }
        Quant::Affine { scale, zero_point } => {
            let zp = zero_point as f32;
            values.into_iter().map(|v| (v - zp) * scale).collect()
        }
    };
    let out_attr = TensorAttr {
        layout: attr.layout,
        dtype: DType::F32,
        dims: attr.dims.clone(),
        quant: Quant::None,
    };
    Tensor::new(out_attr, TensorData::F32(values))
}

/// Largest `(w, h)` with the aspect ratio of `aspect_w:aspect_h` that fits
/// inside `win_w x win_h`.
pub fn apply_letterbox(aspect_w: u32, aspect_h: u32, win_w: u32, win_h: u32) -> (u32, u32) {
    if aspect_w == 0 || aspect_h == 0 {
        return (win_w, win_h);
    }
    let (aw, ah, ww, wh) = (aspect_w as u64, aspect_h as u64, win_w as u64, win_h as u64);
    if ww * ah > wh * aw {
        // Window is wider than the target aspect
        ((aw * wh / ah) as u32, win_h)
    } else {
        (win_w, (ah * ww / aw) as u32)
    }
}

/// Clamps `r` so both of its corners lie inside a `width x height` image.
pub fn clamp_rect(r: &mut Rect, width: i32, height: i32) {
    let tx = r.x.max(0).min(width - 1);
    let ty = r.y.max(0).min(height - 1);
    let bx = r.right().max(0).min(width - 1);
    let by = r.bottom().max(0).min(height - 1);
    *r = Rect::new(tx, ty, bx - tx, by - ty);
}

/// Class names keyed by id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels(BTreeMap<i32, String>);

impl Labels {
    /// Parses a labels file. Each non-blank, non-`#` line holds a name,
    /// optionally preceded by a numeric id; lines without an id continue
    /// numbering from the previous one.
    pub fn parse(text: &str, origin: &str) -> Self {
        let mut map = BTreeMap::new();
        let mut id = 0i32;
        for (lineno, line) in text.lines().enumerate() {
            let line = line
                .trim_end_matches([' ', '\t', '\r', '\n'])
                .trim_start_matches([' ', '\t']);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let rest = match leading_int(line) {
                Some((value, rest)) => {
                    id = value;
                    rest.trim_start_matches(|c: char| c.is_ascii_digit() || " \t,:".contains(c))
                }
                None => line,
            };

            let mut name = if rest.is_empty() {
                warn!("{origin}:{}: empty class name, using 'unspecified'", lineno + 1);
                "unspecified".to_string()
            } else {
                rest.replace("\"\"", "\"")
            };
            if name.len() > 1 && name.starts_with('"') && name.ends_with('"') {
                name = name[1..name.len() - 1].to_string();
            }

            map.insert(id, name);
            id = id.wrapping_add(1);
        }
        Self(map)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let labels = Self::parse(&text, &path.display().to_string());
        info!("Loaded {} class names from {}", labels.len(), path.display());
        Ok(labels)
    }

    /// Name for `id`, or the id itself when unknown
    pub fn get(&self, id: i32) -> Cow<'_, str> {
        match self.0.get(&id) {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(id.to_string()),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parses an optionally signed integer at the start of `s`.
fn leading_int(s: &str) -> Option<(i32, &str)> {
    let bytes = s.as_bytes();
    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return None;
    }
    s[..end].parse().ok().map(|v| (v, &s[end..]))
}

/// Stable color for a label, packed as `0xAABBGGRR`.
pub fn string_to_rgba(label: &str, alpha: u8) -> u32 {
    let mut col: i32 = 0x8080_8080u32 as i32;
    for &c in label.as_bytes() {
        col = (c as i8 as i32).wrapping_add(col.wrapping_shl(5).wrapping_sub(col));
    }
    (col as u32 & 0x00ff_ffff) | ((alpha as u32) << 24)
}

/// Parses extra network inputs given as `TYPE:NxCxHxW:v1 v2 ... vN`,
/// comma-separated. The value count must equal the element count.
pub fn parse_extra_tensors(spec: &str) -> Result<Vec<Tensor>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            let tok: Vec<&str> = item.split(':').collect();
            if tok.len() != 3 {
                return Err(Error::format(format!(
                    "malformed extra tensor [{item}], need <type>:<shape>:val1 val2 ... valN"
                )));
            }
            let dtype: DType = tok[0].trim().parse()?;
            if dtype == DType::U32 {
                return Err(Error::format(format!(
                    "unsupported extra input tensor type [{}]",
                    tok[0]
                )));
            }
            let attr = TensorAttr::new(Layout::Auto, dtype, strshape(tok[1])?);
            let vals = tok[2]
                .split_whitespace()
                .map(|v| {
                    v.parse::<f64>()
                        .map_err(|_| Error::format(format!("invalid value [{v}] in [{item}]")))
                })
                .collect::<Result<Vec<_>>>()?;
            if vals.len() != attr.total() {
                return Err(Error::format(format!(
                    "extra input tensor needs {} values, but {} given in [{item}]",
                    attr.total(),
                    vals.len()
                )));
            }
            let data = match dtype {
                DType::F64 => TensorData::F64(vals),
                _ => TensorData::from_f32(dtype, vals.into_iter().map(|v| v as f32)),
            };
            Tensor::new(attr, data)
        })
        .collect()
}

/// Parses YOLO anchors: `w1,h1,w2,h2,...; ww1,hh1,...`, one group per scale.
pub fn parse_anchors(spec: &str) -> Result<Vec<Vec<f32>>> {
    spec.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|group| {
            let vals = group
                .split(',')
                .map(|v| {
                    v.trim().parse::<f32>().map_err(|_| {
                        Error::format(format!("invalid anchor value [{v}] in [{group}]"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            if vals.len() % 2 == 1 {
                return Err(Error::format(format!(
                    "odd number of values not allowed in anchor spec [{group}]"
                )));
            }
            Ok(vals)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_normalizes() {
        let mut v = [1.0, 2.0, 3.0];
        assert_eq!(softmax(&mut v, 1.0, false), 2);
        assert!((v.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(v[2] > v[1] && v[1] > v[0]);

        let mut w = [0.0, 10.0];
        softmax(&mut w, 1.0, true);
        assert!(w[1] > 0.99 && w[1] < 1.0);
        assert!((w[0] - (-10f32).exp()).abs() < 1e-6);
    }

    #[test]
    fn top_k_orders_and_breaks_ties_low() {
        let r = top_k(&[0.1, 0.8, 0.3, 0.05, 0.95], 3);
        assert_eq!(r.iter().map(|p| p.0).collect::<Vec<_>>(), vec![4, 1, 2]);
        let tie = top_k(&[0.5, 0.9, 0.9, 0.1], 2);
        assert_eq!(tie.iter().map(|p| p.0).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(top_k(&[1.0], 5).len(), 1);
    }

    #[test]
    fn dfp_round_trip() {
        let attr = TensorAttr::new(Layout::Na, DType::I8, vec![4]).with_quant(Quant::Dfp { fl: 5 });
        let src = Tensor::from_f32(vec![4], vec![-2.0, -0.51, 0.03, 3.9]).unwrap();
        let q = quantize(&src, &attr).unwrap();
        assert_eq!(q.dtype(), DType::I8);
        let d = dequantize(&q, &attr).unwrap();
        let step = 1.0 / 32.0;
        for (a, b) in src.as_f32().unwrap().iter().zip(d.as_f32().unwrap()) {
            assert!((a - b).abs() <= step * 0.5 + 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn affine_round_trip() {
        let attr = TensorAttr::new(Layout::Na, DType::U8, vec![5]).with_quant(Quant::Affine {
            scale: 0.02,
            zero_point: 128,
        });
        let src = Tensor::from_f32(vec![5], vec![-2.5, -0.013, 0.0, 1.11, 2.5]).unwrap();
        let d = dequantize(&quantize(&src, &attr).unwrap(), &attr).unwrap();
        for (a, b) in src.as_f32().unwrap().iter().zip(d.as_f32().unwrap()) {
            assert!((a - b).abs() <= 0.01 + 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn quantize_rejects_bad_params() {
        let src = Tensor::from_f32(vec![2], vec![0.0, 1.0]).unwrap();
        let zero = TensorAttr::new(Layout::Na, DType::U8, vec![2]).with_quant(Quant::Affine {
            scale: 0.0,
            zero_point: 0,
        });
        assert!(matches!(quantize(&src, &zero), Err(Error::Quantization(_))));
        let fl = TensorAttr::new(Layout::Na, DType::I8, vec![2]).with_quant(Quant::Dfp { fl: 9 });
        assert!(quantize(&src, &fl).is_err());
        let size = TensorAttr::new(Layout::Na, DType::U8, vec![3]);
        assert!(matches!(quantize(&src, &size), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn letterbox_fits_inside() {
        assert_eq!(apply_letterbox(1, 1, 640, 480), (480, 480));
        assert_eq!(apply_letterbox(16, 9, 640, 480), (640, 360));
        assert_eq!(apply_letterbox(4, 3, 640, 480), (640, 480));
    }

    #[test]
    fn clamp_to_image() {
        let mut r = Rect::new(-5, 10, 50, 500);
        clamp_rect(&mut r, 40, 100);
        assert_eq!(r, Rect::new(0, 10, 39, 89));
    }

    #[test]
    fn labels_formats() {
        let text = "# comment\n\nperson\nbicycle\n 10: car \n\"quoted\"\n12\n14 \"say \"\"hi\"\"\"\n";
        let l = Labels::parse(text, "test");
        assert_eq!(l.get(0), "person");
        assert_eq!(l.get(1), "bicycle");
        assert_eq!(l.get(10), "car");
        assert_eq!(l.get(11), "quoted");
        assert_eq!(l.get(12), "unspecified");
        assert_eq!(l.get(14), "say \"hi\"");
        assert_eq!(l.get(99), "99");
    }

    #[test]
    fn label_colors_are_stable() {
        let a = string_to_rgba("person", 255);
        assert_eq!(a, string_to_rgba("person", 255));
        assert_ne!(a, string_to_rgba("car", 255));
        assert_eq!(a >> 24, 255);
        assert_eq!(string_to_rgba("", 0x40), (0x8080_8080u32 & 0xffffff) | 0x4000_0000);
    }

    #[test]
    fn extra_tensors() {
        let t = parse_extra_tensors("32F:1x2:0.5 1.5, 8U:3:1 2 3").unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t[0].as_f32().unwrap(), &[0.5, 1.5]);
        assert_eq!(t[1].data, TensorData::U8(vec![1, 2, 3]));
        assert!(parse_extra_tensors("32F:1x2:0.5").is_err());
        assert!(parse_extra_tensors("32F:1x2").is_err());
        assert!(parse_extra_tensors("").unwrap().is_empty());
    }

    #[test]
    fn anchors_parse_per_scale() {
        let a = parse_anchors("10,13, 16,30 ; 30,61,62,45").unwrap();
        assert_eq!(a, vec![vec![10.0, 13.0, 16.0, 30.0], vec![30.0, 61.0, 62.0, 45.0]]);
        assert!(parse_anchors("").unwrap().is_empty());
        assert!(parse_anchors("1,2,3").is_err());
        assert!(parse_anchors("1,x").is_err());
    }
}
