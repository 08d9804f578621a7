//! Raw YOLO feature map decoding, one scale per output tensor

use tracing::info;

use crate::dnn::tensor::Tensor;
use crate::dnn::utils::parse_anchors;
use crate::error::{Error, Result};
use crate::imgproc::Rect;

/// A decoded box in blob coordinates, before NMS
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub rect: Rect,
    pub class_id: i32,
    pub confidence: f32,
}

/// Thresholds and geometry for one decode call
#[derive(Debug, Clone, Copy)]
pub struct YoloParams {
    /// Classes per anchor; 0 is taken as 1
    pub nclass: usize,
    /// Objectness threshold, 0..1
    pub box_thresh: f32,
    /// Objectness times class probability threshold, 0..1
    pub conf_thresh: f32,
    /// Blob width and height
    pub blob_size: (u32, u32),
    pub class_offset: i32,
    /// Cap on boxes over all scales
    pub maxbox: usize,
}

pub struct YoloDecoder {
    anchors: Vec<Vec<f32>>,
    /// Scale index of each output, by decreasing output size
    yolonum: Vec<usize>,
    sigmoid: bool,
    scale_xy: f32,
}

#[inline]
fn logistic(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl YoloDecoder {
    /// `anchors` uses the `w,h,w,h,...; ...` syntax, finest scale first.
    /// A zero `scale_xy` selects old-style (v2/v3/v4) box equations.
    pub fn new(anchors: &str, sigmoid: bool, scale_xy: f32) -> Result<Self> {
        Ok(Self {
            anchors: parse_anchors(anchors)?,
            yolonum: Vec::new(),
            sigmoid,
            scale_xy,
        })
    }

    pub fn anchors(&self) -> &[Vec<f32>] {
        &self.anchors
    }

    /// Decodes every output concurrently. Boxes are returned in output
    /// order and capped at `maxbox` in total, so repeated calls on the same
    /// tensors give the same list.
    pub fn decode(&mut self, outs: &[Tensor], p: &YoloParams) -> Result<Vec<Candidate>> {
        if outs.is_empty() {
            return Err(Error::format("no output tensors received"));
        }
        if self.anchors.len() != outs.len() {
            return Err(Error::format(format!("need {} sets of anchors", outs.len())));
        }
        if self.yolonum.len() != outs.len() {
            self.assign_scales(outs);
        }

        let p = YoloParams {
            nclass: p.nclass.max(1),
            ..*p
        };
        let this = &*self;
        let results: Vec<Result<Vec<Candidate>>> = crossbeam::scope(|s| {
            let handles: Vec<_> = outs
                .iter()
                .zip(&this.yolonum)
                .map(|(out, &yn)| s.spawn(move |_| this.decode_one(out, yn, &p)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| Err(Error::backend("yolo decode panicked"))))
                .collect()
        })
        .map_err(|_| Error::backend("yolo decode scope panicked"))?;

        let mut boxes = Vec::new();
        let mut errors = Vec::new();
        for r in results {
            match r {
                Ok(b) => boxes.extend(b),
                Err(e) => errors.push(e),
            }
        }
        boxes.truncate(p.maxbox);
        match Error::combine(errors) {
            Some(e) => Err(e),
            None => Ok(boxes),
        }
    }

    fn assign_scales(&mut self, outs: &[Tensor]) {
        let mut order: Vec<usize> = (0..outs.len()).collect();
        order.sort_by(|&a, &b| outs[b].len().cmp(&outs[a].len()));
        self.yolonum = vec![0; outs.len()];
        for (rank, &i) in order.iter().enumerate() {
            self.yolonum[i] = rank;
        }
        for (i, out) in outs.iter().enumerate() {
            let yn = self.yolonum[i];
            let anchors = self.anchors[yn]
                .chunks(2)
                .map(|a| format!("{:.2},{:.2}", a[0], a.get(1).copied().unwrap_or_default()))
                .collect::<Vec<_>>()
                .join(" ");
            info!("Out {i}: {}, scale=1/{}, anchors=[{anchors}]", out.shapestr(), 8u32 << yn);
        }
    }

    fn decode_one(&self, out: &Tensor, yolonum: usize, p: &YoloParams) -> Result<Vec<Candidate>> {
        let data = out.require_f32("yolo")?;
        let d = out.dims();
        if d.len() != 4 || d[0] != 1 {
            return Err(Error::format(format!(
                "incorrect tensor size: need 1xCxHxW or 1xHxWxC, got {}",
                out.shapestr()
            )));
        }

        const COORDS: usize = 4;
        let bbsize = COORDS + 1 + p.nclass;
        let (nchw, w, h, n) = if d[1] % bbsize == 0 {
            (true, d[3], d[2], d[1] / bbsize)
        } else if d[3] % bbsize == 0 {
            (false, d[2], d[1], d[3] / bbsize)
        } else {
            return Err(Error::format(format!(
                "incorrect tensor size: need C = anchors * (4 coords + 1 box score + {} classes), got {}",
                p.nclass,
                out.shapestr()
            )));
        };

        let biases = &self.anchors[yolonum];
        if biases.len() != n * 2 {
            return Err(Error::format(format!(
                "{n} boxes received but {} anchors provided",
                biases.len() / 2
            )));
        }

        let bfac = 1.0 / (8u32 << yolonum) as f32;
        let (bw, bh) = (p.blob_size.0 as f32, p.blob_size.1 as f32);
        let (wf, hf) = (w as f32, h as f32);
        let stride = if nchw { h * w } else { 1 };
        let nextloc = if nchw { 1 } else { n * bbsize };
        let act = |v: f32| if self.sigmoid { logistic(v) } else { v };

        let mut boxes = Vec::new();
        for row in 0..h {
            for col in 0..w {
                let loc = (row * w + col) * nextloc;
                for nn in 0..n {
                    let at = |k: usize| data[loc + nn * bbsize * stride + k * stride];

                    let box_score = act(at(COORDS));
                    if box_score <= p.box_thresh {
                        continue;
                    }

                    let (mut maxidx, mut prob) = (0, at(COORDS + 1));
                    for k in 1..p.nclass {
                        let v = at(COORDS + 1 + k);
                        if v > prob {
                            prob = v;
                            maxidx = k;
                        }
                    }
                    let prob = act(prob) * box_score;
                    if prob <= p.conf_thresh {
                        continue;
                    }

                    let (aw, ah) = (biases[2 * nn], biases[2 * nn + 1]);
                    // Sizes are truncated before centering, as integer boxes
                    let (cx, cy, width, height) = if self.scale_xy != 0.0 {
                        let (bx, by, sw, sh) = (act(at(0)), act(at(1)), act(at(2)), act(at(3)));
                        (
                            (bx * self.scale_xy - 0.5 + col as f32) * bw / wf,
                            (by * self.scale_xy - 0.5 + row as f32) * bh / hf,
                            (sw * sw * 4.0 * aw * bfac * bw / wf + 0.499) as i32,
                            (sh * sh * 4.0 * ah * bfac * bh / hf + 0.499) as i32,
                        )
                    } else {
                        (
                            (col as f32 + logistic(at(0))) * bw / wf,
                            (row as f32 + logistic(at(1))) * bh / hf,
                            (at(2).exp() * aw * bfac * bw / wf + 0.499) as i32,
                            (at(3).exp() * ah * bfac * bh / hf + 0.499) as i32,
                        )
                    };
                    let x = (cx + 0.499 - (width / 2) as f32) as i32;
                    let y = (cy + 0.499 - (height / 2) as f32) as i32;

                    boxes.push(Candidate {
                        rect: Rect::new(x, y, width, height),
                        class_id: maxidx as i32 + p.class_offset,
                        confidence: prob,
                    });
                    // No scale can contribute more than the overall cap
                    if boxes.len() >= p.maxbox {
                        return Ok(boxes);
                    }
                }
            }
        }
        Ok(boxes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> YoloParams {
        YoloParams {
            nclass: 1,
            box_thresh: 0.15,
            conf_thresh: 0.5,
            blob_size: (64, 64),
            class_offset: 0,
            maxbox: 500,
        }
    }

    /// 1x(2*6)xHxW map with one strong cell at (row, col), anchor 0
    fn feature_map(h: usize, w: usize, row: usize, col: usize) -> Tensor {
        let (n, bbsize) = (2, 6);
        let mut v = vec![-10.0f32; n * bbsize * h * w];
        let at = |k: usize| k * h * w + row * w + col;
        v[at(4)] = 5.0;
        v[at(5)] = 5.0;
        v[at(0)] = 0.0;
        v[at(1)] = 0.0;
        v[at(2)] = 0.0;
        v[at(3)] = 0.0;
        Tensor::from_f32(vec![1, n * bbsize, h, w], v).unwrap()
    }

    #[test]
    fn old_style_box_geometry() {
        let mut dec = YoloDecoder::new("16,16, 32,32", true, 0.0).unwrap();
        let out = feature_map(8, 8, 3, 4);
        let boxes = dec.decode(&[out], &params()).unwrap();
        assert_eq!(boxes.len(), 1);
        let b = boxes[0];
        // Anchor 16 at scale 1/8 on an 8x8 grid over 64 pixels is 16 wide
        assert_eq!((b.rect.width, b.rect.height), (16, 16));
        // Cell center (4.5, 3.5) * 8 = (36, 28) minus half the box
        assert_eq!((b.rect.x, b.rect.y), (28, 20));
        assert!(b.confidence > 0.98);
    }

    #[test]
    fn scales_follow_output_size() {
        let mut dec = YoloDecoder::new("16,16, 32,32; 64,64, 128,128", true, 0.0).unwrap();
        let small = feature_map(4, 4, 0, 0);
        let large = feature_map(8, 8, 0, 0);
        let boxes = dec.decode(&[small, large], &params()).unwrap();
        assert_eq!(dec.yolonum, vec![1, 0]);
        // Output order is kept: the 4x4 box uses the second anchor set at 1/16
        assert_eq!(boxes[0].rect.width, 64);
        assert_eq!(boxes[1].rect.width, 16);
    }

    #[test]
    fn cap_spans_all_scales_and_errors_are_combined() {
        let mut dec = YoloDecoder::new("1,1, 1,1; 1,1", true, 0.0).unwrap();
        let bad = Tensor::from_f32(vec![1, 5, 2, 2], vec![0.0; 20]).unwrap();
        let also_bad = Tensor::from_f32(vec![2, 12, 1, 1], vec![0.0; 24]).unwrap();
        let err = dec.decode(&[bad, also_bad], &params()).unwrap_err();
        assert!(matches!(err, Error::Multiple(ref e) if e.len() == 2));

        let mut dec = YoloDecoder::new("1,1, 1,1; 2,2, 2,2", false, 0.0).unwrap();
        let busy = Tensor::from_f32(vec![1, 12, 4, 4], vec![1.0; 192]).unwrap();
        let also_busy = Tensor::from_f32(vec![1, 12, 2, 2], vec![1.0; 48]).unwrap();
        let p = YoloParams {
            box_thresh: 0.0,
            conf_thresh: 0.0,
            maxbox: 5,
            ..params()
        };
        let first = dec.decode(&[busy.clone(), also_busy.clone()], &p).unwrap();
        assert_eq!(first.len(), 5);
        // The large map fills the cap on its own and comes first
        assert!(first.iter().all(|b| b.rect.width == 5));
        for _ in 0..5 {
            assert_eq!(dec.decode(&[busy.clone(), also_busy.clone()], &p).unwrap(), first);
        }

        let p = YoloParams { maxbox: 40, ..p };
        let boxes = dec.decode(&[busy, also_busy], &p).unwrap();
        assert_eq!(boxes.len(), 40);
        assert_eq!(boxes.iter().filter(|b| b.rect.width == 5).count(), 32);
    }

    #[test]
    fn new_style_box_is_anchor_sized_on_the_cell() {
        let mut dec = YoloDecoder::new("16,16, 32,32", true, 2.0).unwrap();
        let boxes = dec.decode(&[feature_map(8, 8, 3, 4)], &params()).unwrap();
        assert_eq!(boxes.len(), 1);
        // Zero logits: (0.5 * 2 - 0.5 + cell) is the cell center, 4 * 0.5^2 the anchor size
        assert_eq!(boxes[0].rect, Rect::new(28, 20, 16, 16));
        assert!(boxes[0].confidence > 0.98);
    }

    #[test]
    fn channels_last_decodes_like_channels_first() {
        let (h, w, c) = (4, 8, 12);
        let nchw = feature_map(h, w, 3, 5);
        let src = nchw.as_f32().unwrap();
        let mut v = vec![0.0f32; c * h * w];
        for ch in 0..c {
            for i in 0..h * w {
                v[i * c + ch] = src[ch * h * w + i];
            }
        }
        let nhwc = Tensor::from_f32(vec![1, h, w, c], v).unwrap();

        let mut dec = YoloDecoder::new("16,16, 32,32", true, 0.0).unwrap();
        let expected = dec.decode(&[nchw], &params()).unwrap();
        let mut dec = YoloDecoder::new("16,16, 32,32", true, 0.0).unwrap();
        let got = dec.decode(&[nhwc], &params()).unwrap();
        assert_eq!(expected.len(), 1);
        assert_eq!(got, expected);
    }

    #[test]
    fn anchor_count_must_match() {
        let mut dec = YoloDecoder::new("1,1", true, 0.0).unwrap();
        assert!(dec.decode(&[feature_map(2, 2, 0, 0)], &params()).is_err());
        assert!(YoloDecoder::new("1,1,1", true, 0.0).is_err());
    }
}
