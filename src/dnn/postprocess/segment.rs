use super::{Overlay, PostProcessor, PostProcessorConfig, Results, SegType};
use crate::dnn::preprocess::PreProcessor;
use crate::dnn::tensor::{DType, Tensor};
use crate::error::{Error, Result};
use crate::imgproc::PackedImage;

/// Pascal VOC palette: bits of the class id spread over the RGB channels
pub fn voc_colormap() -> [[u8; 3]; 256] {
    let mut map = [[0u8; 3]; 256];
    for (i, c) in map.iter_mut().enumerate() {
        let mut ind = i;
        for shift in (0..8).rev() {
            for (channel, v) in c.iter_mut().enumerate() {
                *v |= (((ind >> channel) & 1) as u8) << shift;
            }
            ind >>= 3;
        }
    }
    map
}

/// Semantic segmentation rendered as a translucent RGBA overlay
pub struct Segment {
    cfg: PostProcessorConfig,
    colors: [[u8; 3]; 256],
    overlay: Option<Overlay>,
}

impl Segment {
    pub fn new(cfg: PostProcessorConfig) -> Self {
        Self {
            cfg,
            colors: voc_colormap(),
            overlay: None,
        }
    }

    fn rgba(&self, class: Option<i64>) -> [u8; 4] {
        match class {
            Some(c) if (0..256).contains(&c) && c != self.cfg.bgid as i64 => {
                let [r, g, b] = self.colors[c as usize];
                [r, g, b, self.cfg.alpha]
            }
            _ => [0; 4],
        }
    }

    /// Renders the class map of `out`.
    pub fn render(&mut self, out: &Tensor) -> Result<PackedImage> {
        // A non-zero background id frees class 0 for drawing
        self.colors[0] = if self.cfg.bgid != 0 { [0, 0, 255] } else { [0; 3] };

        if !matches!(out.dtype(), DType::U8 | DType::U16 | DType::F32 | DType::I32) {
            return Err(Error::format(format!(
                "unsupported data type in tensor {}",
                out.shapestr()
            )));
        }
        let thresh = match out.dtype() {
            DType::F32 => self.cfg.cthresh * 0.01,
            _ => (self.cfg.cthresh * 0.01).trunc(),
        };
        let d = out.dims();
        let v = |i: usize| out.data.get_f32(i);

        // Best class above threshold among `numclass` scores
        let best = |at: &dyn Fn(usize) -> f32, numclass: usize| {
            let mut maxc = None;
            let mut maxval = thresh;
            for c in 0..numclass {
                let s = at(c);
                if s > maxval {
                    maxval = s;
                    maxc = Some(c as i64);
                }
            }
            maxc
        };

        let (h, w, pixels): (usize, usize, Vec<Option<i64>>) = match self.cfg.segtype {
            SegType::ClassesHwc => {
                let &[1, h, w, numclass] = d else {
                    return Err(Error::format("need 1xHxWxC for C classes"));
                };
                let px = (0..h * w)
                    .map(|p| best(&|c: usize| v(p * numclass + c), numclass))
                    .collect();
                (h, w, px)
            }
            SegType::ClassesChw => {
                let &[1, numclass, h, w] = d else {
                    return Err(Error::format("need 1xCxHxW for C classes"));
                };
                let hw = h * w;
                let px = (0..hw).map(|p| best(&|c: usize| v(p + c * hw), numclass)).collect();
                (h, w, px)
            }
            SegType::ArgMax => {
                let (h, w) = match *d {
                    [h, w] | [1, h, w] | [1, h, w, 1] => (h, w),
                    _ => {
                        return Err(Error::format(
                            "need shape HxW, 1xHxW, or 1xHxWx1 with class id in each pixel",
                        ))
                    }
                };
                let px = (0..h * w).map(|p| Some(v(p) as i64)).collect();
                (h, w, px)
            }
        };

        let data = pixels.into_iter().flat_map(|c| self.rgba(c)).collect();
        PackedImage::from_vec(w as u32, h as u32, 4, data)
    }
}

impl PostProcessor for Segment {
    fn process(&mut self, outs: &[Tensor], pre: &PreProcessor) -> Result<()> {
        self.overlay = None;
        if outs.is_empty() {
            return Ok(());
        }
        let image = match outs {
            [out] => self.render(out),
            _ => Err(Error::format("need exactly one output blob")),
        }
        .map_err(|e| {
            let shapes: Vec<String> = outs.iter().map(|t| format!("- {}", t.shapestr())).collect();
            Error::format(format!(
                "segtype is {:?} and network produced:\n{}\n{e}",
                self.cfg.segtype,
                shapes.join("\n")
            ))
        })?;
        self.overlay = Some(Overlay {
            image,
            rect: pre.crop(0)?,
        });
        Ok(())
    }

    fn results(&self) -> Results<'_> {
        Results::Overlay(self.overlay.as_ref())
    }
}
