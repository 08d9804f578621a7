//! Typed n-dimensional tensors and the attribute descriptors networks declare

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl DType {
    pub const fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "8U",
            Self::I8 => "8S",
            Self::U16 => "16U",
            Self::I16 => "16S",
            Self::U32 => "32U",
            Self::I32 => "32S",
            Self::F32 => "32F",
            Self::F64 => "64F",
        }
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "8U" => Self::U8,
            "8S" => Self::I8,
            "16U" => Self::U16,
            "16S" => Self::I16,
            "32U" => Self::U32,
            "32S" => Self::I32,
            "32F" => Self::F32,
            "64F" => Self::F64,
            "8B" | "16F" | "16B" | "64U" | "64S" => {
                return Err(Error::format(format!("tensor type {s} is not supported")))
            }
            _ => return Err(Error::format(format!("invalid tensor type [{s}]"))),
        })
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dimension ordering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// Planar: batch, channels, rows, columns
    Nchw,
    /// Packed: batch, rows, columns, channels
    Nhwc,
    /// Not an image
    Na,
    /// Guess from the dims
    #[default]
    Auto,
}

/// Quantization applied to integer tensors
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum Quant {
    #[default]
    None,
    /// Dynamic fixed point: real = q / 2^fl
    Dfp { fl: i32 },
    /// Affine: real = (q - zero_point) * scale
    Affine { scale: f32, zero_point: i32 },
}

/// Declared type, shape and quantization of a network input or output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorAttr {
    pub layout: Layout,
    pub dtype: DType,
    /// Outermost dimension first
    pub dims: Vec<usize>,
    pub quant: Quant,
}

impl TensorAttr {
    pub fn new(layout: Layout, dtype: DType, dims: Vec<usize>) -> Self {
        Self {
            layout,
            dtype,
            dims,
            quant: Quant::None,
        }
    }

    pub fn with_quant(mut self, quant: Quant) -> Self {
        self.quant = quant;
        self
    }

    pub fn total(&self) -> usize {
        self.dims.iter().product()
    }

    /// Image width and height this tensor expects, guessing the layout when
    /// it is [`Layout::Auto`].
    pub fn size(&self) -> Result<(u32, u32)> {
        let d = &self.dims;
        let n = d.len();
        let wh = |w: usize, h: usize| (w as u32, h as u32);
        match self.layout {
            Layout::Nhwc if n >= 3 => Ok(wh(d[n - 2], d[n - 3])),
            Layout::Nchw | Layout::Auto if n == 2 => Ok(wh(d[1], d[0])),
            Layout::Nchw if n >= 2 => Ok(wh(d[n - 1], d[n - 2])),
            // Channels are assumed fewer than rows
            Layout::Auto if n >= 3 => {
                if d[n - 1] > d[n - 3] {
                    Ok(wh(d[n - 1], d[n - 2]))
                } else {
                    Ok(wh(d[n - 2], d[n - 3]))
                }
            }
            _ => Err(Error::UnsupportedLayout(format!(
                "cannot extract width and height from {self}"
            ))),
        }
    }

    /// Resolves [`Layout::Auto`] to a concrete image layout.
    pub fn effective_layout(&self) -> Layout {
        match self.layout {
            Layout::Auto if self.dims.len() == 4 => {
                if self.dims[3] > self.dims[1] {
                    Layout::Nchw
                } else {
                    Layout::Nhwc
                }
            }
            l => l,
        }
    }

    /// True when `t` has exactly this dtype and dims.
    pub fn matches(&self, t: &Tensor) -> bool {
        self.dtype == t.dtype() && self.dims == t.attr.dims
    }

    pub fn check(&self, t: &Tensor) -> Result<()> {
        if self.matches(t) {
            Ok(())
        } else {
            Err(Error::ShapeMismatch {
                expected: self.to_string(),
                got: t.attr.to_string(),
            })
        }
    }
}

impl fmt::Display for TensorAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.layout {
            Layout::Nchw => f.write_str("NCHW:")?,
            Layout::Nhwc => f.write_str("NHWC:")?,
            _ => {}
        }
        write!(f, "{}:{}:", self.dtype, shapestr(&self.dims))?;
        match self.quant {
            Quant::None => f.write_str("NONE"),
            Quant::Dfp { fl } => write!(f, "DFP:{fl}"),
            Quant::Affine { scale, zero_point } => write!(f, "AA:{scale}:{zero_point}"),
        }
    }
}

/// `1x3x224x224`
pub fn shapestr(dims: &[usize]) -> String {
    dims.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("x")
}

/// Parses `NxCxHxW` into dims.
pub fn strshape(s: &str) -> Result<Vec<usize>> {
    s.trim()
        .split('x')
        .map(|t| {
            t.trim()
                .parse::<usize>()
                .map_err(|_| Error::format(format!("invalid shape [{s}]")))
        })
        .collect()
}

const SPEC_SYNTAX: &str = "[NCHW:|NHWC:|NA:|AUTO:]Type:NxCxHxW[:QNT[:fl|:scale:zero]]";

/// Parses a comma-separated list of tensor specs. Each spec is either
/// `[NCHW:|NHWC:|NA:|AUTO:]Type:NxCxHxW[:QNT[:fl|:scale:zero]]` or the short
/// form `NxCxHxW Type`. An empty string yields no tensors.
pub fn parse_tensor_specs(specs: &str) -> Result<Vec<TensorAttr>> {
    specs
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_tensor_spec)
        .collect()
}

fn parse_tensor_spec(spec: &str) -> Result<TensorAttr> {
    if !spec.contains(':') {
        let mut tok = spec.split_whitespace();
        let (Some(a), Some(b), None) = (tok.next(), tok.next(), tok.next()) else {
            return Err(Error::format(format!(
                "malformed tensor spec [{spec}], expected NxCxHxW Type or {SPEC_SYNTAX}"
            )));
        };
        let (dims, dtype) = if a.contains('x') || a.parse::<usize>().is_ok() {
            (a, b)
        } else {
            (b, a)
        };
        return Ok(TensorAttr::new(Layout::Auto, dtype.parse()?, strshape(dims)?));
    }

    let tok: Vec<&str> = spec.split(':').map(str::trim).collect();
    let malformed = || Error::format(format!("malformed tensor spec [{spec}], expected {SPEC_SYNTAX}"));

    let (layout, mut n) = match tok[0] {
        "NCHW" => (Layout::Nchw, 1),
        "NHWC" => (Layout::Nhwc, 1),
        "NA" => (Layout::Na, 1),
        "AUTO" => (Layout::Auto, 1),
        _ => (Layout::Auto, 0),
    };
    if tok.len() < n + 2 {
        return Err(malformed());
    }
    let dtype: DType = tok[n].parse()?;
    let dims = strshape(tok[n + 1])?;
    n += 2;

    let quant = match tok.get(n).copied() {
        None | Some("NONE") if tok.len() <= n + 1 => Quant::None,
        Some("DFP") => {
            if tok.len() != n + 2 {
                return Err(Error::format(format!("in {spec}, DFP quantization needs :fl")));
            }
            let fl = tok[n + 1]
                .parse()
                .map_err(|_| Error::format(format!("invalid DFP fl in {spec}")))?;
            Quant::Dfp { fl }
        }
        Some("AA") | Some("AS") => {
            if tok.len() != n + 3 {
                return Err(Error::format(format!(
                    "in {spec}, AA/AS quantization needs :scale:zero"
                )));
            }
            let scale = tok[n + 1]
                .parse()
                .map_err(|_| Error::format(format!("invalid quantization scale in {spec}")))?;
            let zero_point = tok[n + 2]
                .parse()
                .map_err(|_| Error::format(format!("invalid zero point in {spec}")))?;
            Quant::Affine { scale, zero_point }
        }
        Some("APS") => {
            return Err(Error::format(format!(
                "in {spec}, per-channel symmetric quantization is not supported"
            )))
        }
        _ => return Err(Error::format(format!("invalid quantization type in {spec}"))),
    };

    Ok(TensorAttr {
        layout,
        dtype,
        dims,
        quant,
    })
}

/// Tensor storage, one variant per element type
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! each_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            TensorData::U8($v) => $body,
            TensorData::I8($v) => $body,
            TensorData::U16($v) => $body,
            TensorData::I16($v) => $body,
            TensorData::U32($v) => $body,
            TensorData::I32($v) => $body,
            TensorData::F32($v) => $body,
            TensorData::F64($v) => $body,
        }
    };
}

pub(crate) use each_data;

impl TensorData {
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::U8 => Self::U8(vec![0; len]),
            DType::I8 => Self::I8(vec![0; len]),
            DType::U16 => Self::U16(vec![0; len]),
            DType::I16 => Self::I16(vec![0; len]),
            DType::U32 => Self::U32(vec![0; len]),
            DType::I32 => Self::I32(vec![0; len]),
            DType::F32 => Self::F32(vec![0.0; len]),
            DType::F64 => Self::F64(vec![0.0; len]),
        }
    }

    /// Converts real values to `dtype`, rounding and saturating for integer types.
    pub fn from_f32(dtype: DType, values: impl IntoIterator<Item = f32>) -> Self {
        let it = values.into_iter();
        macro_rules! sat {
            ($t:ty) => {
                it.map(|v| v.round().clamp(<$t>::MIN as f32, <$t>::MAX as f32) as $t)
                    .collect()
            };
        }
        match dtype {
            DType::U8 => Self::U8(sat!(u8)),
            DType::I8 => Self::I8(sat!(i8)),
            DType::U16 => Self::U16(sat!(u16)),
            DType::I16 => Self::I16(sat!(i16)),
            DType::U32 => Self::U32(it.map(|v| v.round().max(0.0) as u32).collect()),
            DType::I32 => Self::I32(it.map(|v| v.round() as i32).collect()),
            DType::F32 => Self::F32(it.collect()),
            DType::F64 => Self::F64(it.map(f64::from).collect()),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::U8(_) => DType::U8,
            Self::I8(_) => DType::I8,
            Self::U16(_) => DType::U16,
            Self::I16(_) => DType::I16,
            Self::U32(_) => DType::U32,
            Self::I32(_) => DType::I32,
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        each_data!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `i` as a float
    #[inline]
    pub fn get_f32(&self, i: usize) -> f32 {
        each_data!(self, v => v[i] as f32)
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Self::F32(v) => v.clone(),
            _ => each_data!(self, v => v.iter().map(|&x| x as f32).collect()),
        }
    }
}

/// A tensor: attributes plus owned data
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub attr: TensorAttr,
    pub data: TensorData,
}

impl Tensor {
    pub fn new(attr: TensorAttr, data: TensorData) -> Result<Self> {
        if attr.dtype != data.dtype() || attr.total() != data.len() {
            return Err(Error::ShapeMismatch {
                expected: attr.to_string(),
                got: format!("{} elements of {}", data.len(), data.dtype()),
            });
        }
        Ok(Self { attr, data })
    }

    pub fn zeros(attr: TensorAttr) -> Self {
        let data = TensorData::zeros(attr.dtype, attr.total());
        Self { attr, data }
    }

    /// Plain float tensor with no layout or quantization
    pub fn from_f32(dims: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        Self::new(
            TensorAttr::new(Layout::Na, DType::F32, dims),
            TensorData::F32(values),
        )
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn dims(&self) -> &[usize] {
        &self.attr.dims
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Float view or a format error naming `who`
    pub fn require_f32(&self, who: &str) -> Result<&[f32]> {
        self.as_f32().ok_or_else(|| {
            Error::format(format!("{who}: need 32F tensor, got {}", self.shapestr()))
        })
    }

    /// Changes the dims keeping the data. The element count must not change.
    pub fn reshape(&mut self, dims: Vec<usize>) -> Result<()> {
        let total: usize = dims.iter().product();
        if total != self.len() {
            return Err(Error::ShapeMismatch {
                expected: format!("{} elements", self.len()),
                got: shapestr(&dims),
            });
        }
        self.attr.dims = dims;
        Ok(())
    }

    /// Dims count ignoring leading 1s
    pub fn effective_dims(&self) -> usize {
        let d = self.dims();
        d.len() - d.iter().take_while(|&&x| x == 1).count()
    }

    /// `1x3x224x224 8U`
    pub fn shapestr(&self) -> String {
        format!("{} {}", shapestr(self.dims()), self.dtype())
    }
}
