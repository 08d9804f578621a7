use tracing::debug;

use super::nms::nms_boxes;
use super::yolo::{Candidate, YoloDecoder, YoloParams};
use super::{DetectType, ObjDetect, ObjReco, PostProcessor, PostProcessorConfig, Results};
use crate::dnn::preprocess::PreProcessor;
use crate::dnn::tensor::Tensor;
use crate::dnn::utils::{clamp_rect, Labels};
use crate::error::{Error, Result};
use crate::imgproc::Rect;

/// Object detection for the common box output formats
pub struct Detect {
    cfg: PostProcessorConfig,
    labels: Labels,
    yolo: Option<YoloDecoder>,
    detections: Vec<ObjDetect>,
}

fn corners(left: i32, top: i32, right: i32, bottom: i32) -> Rect {
    Rect::new(left, top, right - left + 1, bottom - top + 1)
}

fn one_output<'a>(outs: &'a [Tensor], what: &str) -> Result<&'a [f32]> {
    match outs {
        [out] => {
            let d = out.dims();
            if d.len() != 4 || d[0] != 1 || d[1] != 1 || d[3] != 7 {
                return Err(Error::format(format!(
                    "{what}: need 1x1xNx7 output, got {}",
                    out.shapestr()
                )));
            }
            out.require_f32(what)
        }
        _ => Err(Error::format(format!(
            "{what}: expected 1 output tensor, got {}",
            outs.len()
        ))),
    }
}

impl Detect {
    pub fn new(cfg: PostProcessorConfig) -> Result<Self> {
        let yolo = match cfg.detecttype {
            DetectType::RawYolo => Some(YoloDecoder::new(&cfg.anchors, cfg.sigmoid, cfg.scalexy)?),
            _ => None,
        };
        Ok(Self {
            labels: cfg.labels()?,
            yolo,
            cfg,
            detections: Vec::new(),
        })
    }

    pub fn set_labels(&mut self, labels: Labels) {
        self.labels = labels;
    }

    /// Boxes in blob coordinates before NMS
    fn decode(&mut self, outs: &[Tensor], bsiz: (u32, u32)) -> Result<Vec<Candidate>> {
        let conf = self.cfg.cthresh * 0.01;
        let fudge = self.cfg.classoffset;
        let (bw, bh) = (bsiz.0 as f32, bsiz.1 as f32);
        let mut boxes = Vec::new();

        match self.cfg.detecttype {
            DetectType::FasterRcnn | DetectType::Ssd => {
                let relative = self.cfg.detecttype == DetectType::Ssd;
                let (sx, sy) = if relative { (bw, bh) } else { (1.0, 1.0) };
                let data = one_output(outs, "detect")?;
                for d in data.chunks_exact(7) {
                    if d[2] > conf {
                        boxes.push(Candidate {
                            rect: corners(
                                (d[3] * sx) as i32,
                                (d[4] * sy) as i32,
                                (d[5] * sx) as i32,
                                (d[6] * sy) as i32,
                            ),
                            class_id: d[1] as i32 + fudge,
                            confidence: d[2],
                        });
                    }
                }
            }

            DetectType::TpuSsd => {
                let [bboxes, ids, scores, count] = outs else {
                    return Err(Error::format(format!(
                        "TPU SSD: expected 4 output tensors, got {}",
                        outs.len()
                    )));
                };
                let (bb, ids, scores) = (
                    bboxes.require_f32("TPU SSD boxes")?,
                    ids.require_f32("TPU SSD ids")?,
                    scores.require_f32("TPU SSD scores")?,
                );
                if bb.len() != 4 * ids.len() || bb.len() != 4 * scores.len() {
                    return Err(Error::format("TPU SSD: box, id and score counts disagree"));
                }
                let count = count.require_f32("TPU SSD count")?;
                let &[num] = count else {
                    return Err(Error::format("TPU SSD: count must hold one value"));
                };
                let num = num as usize;
                if num > ids.len() {
                    return Err(Error::format(format!(
                        "TPU SSD: {num} detections for only {} ids",
                        ids.len()
                    )));
                }
                for i in (0..num).filter(|&i| scores[i] >= conf) {
                    let b = &bb[4 * i..4 * i + 4];
                    boxes.push(Candidate {
                        rect: corners(
                            (b[1] * bw) as i32,
                            (b[0] * bh) as i32,
                            (b[3] * bw) as i32,
                            (b[2] * bh) as i32,
                        ),
                        class_id: ids[i] as i32 + fudge,
                        confidence: scores[i],
                    });
                }
            }

            DetectType::Yolo => {
                for out in outs {
                    let d = out.dims();
                    if d.len() != 2 || d[1] < 6 {
                        return Err(Error::format(format!(
                            "YOLO: need NxC output, got {}",
                            out.shapestr()
                        )));
                    }
                    for row in out.require_f32("YOLO")?.chunks_exact(d[1]) {
                        let (id, score) = row[5..]
                            .iter()
                            .enumerate()
                            .fold((0, f32::MIN), |best, (i, &s)| if s > best.1 { (i, s) } else { best });
                        if score > conf {
                            let (w, h) = ((row[2] * bw) as i32, (row[3] * bh) as i32);
                            let (cx, cy) = ((row[0] * bw) as i32, (row[1] * bh) as i32);
                            boxes.push(Candidate {
                                rect: Rect::new(cx - w / 2, cy - h / 2, w, h),
                                class_id: id as i32,
                                confidence: score,
                            });
                        }
                    }
                }
            }

            DetectType::RawYolo => {
                let params = YoloParams {
                    nclass: self.labels.len(),
                    box_thresh: self.cfg.dthresh * 0.01,
                    conf_thresh: conf,
                    blob_size: bsiz,
                    class_offset: fudge,
                    maxbox: self.cfg.maxnbox,
                };
                let decoder = self
                    .yolo
                    .as_mut()
                    .ok_or_else(|| Error::format("raw YOLO decoding needs anchors"))?;
                boxes = decoder.decode(outs, &params)?;
            }
        }
        Ok(boxes)
    }
}

impl PostProcessor for Detect {
    fn process(&mut self, outs: &[Tensor], pre: &PreProcessor) -> Result<()> {
        self.detections.clear();
        if outs.is_empty() {
            return Ok(());
        }
        let bsiz = pre.blob_size(0)?;
        let mut boxes = self.decode(outs, bsiz)?;

        let rects: Vec<Rect> = boxes.iter().map(|b| b.rect).collect();
        let scores: Vec<f32> = boxes.iter().map(|b| b.confidence).collect();
        let keep = nms_boxes(&rects, &scores, self.cfg.cthresh * 0.01, self.cfg.nms * 0.01);
        debug!("{} boxes, {} after NMS", boxes.len(), keep.len());

        for &i in keep.iter().take(self.cfg.maxnbox) {
            let b = &mut boxes[i];
            clamp_rect(&mut b.rect, bsiz.0 as i32, bsiz.1 as i32);
            let (tlx, tly) = pre.b2i(b.rect.x as f32, b.rect.y as f32, 0)?;
            let (brx, bry) = pre.b2i(b.rect.right() as f32, b.rect.bottom() as f32, 0)?;
            self.detections.push(ObjDetect {
                tlx,
                tly,
                brx,
                bry,
                reco: vec![ObjReco {
                    score: b.confidence * 100.0,
                    category: self.labels.get(b.class_id).into_owned(),
                }],
            });
        }
        Ok(())
    }

    fn results(&self) -> Results<'_> {
        Results::Detections(&self.detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnn::preprocess::PreProcessorConfig;
    use crate::dnn::tensor::{DType, Layout, TensorAttr};
    use crate::imgproc::PackedImage;

    /// Pre-processor that stretched a 128x128 image into a 64x64 blob
    fn preprocessor() -> PreProcessor {
        let mut pre = PreProcessor::new(PreProcessorConfig::default());
        let img = PackedImage::new(128, 128, 3).unwrap();
        let attr = TensorAttr::new(Layout::Nchw, DType::F32, vec![1, 3, 64, 64]);
        pre.process_packed(&img, false, &[attr]).unwrap();
        pre
    }

    fn detect(detecttype: DetectType) -> Detect {
        Detect::new(PostProcessorConfig {
            kind: super::super::PostKind::Detect,
            detecttype,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn ssd_boxes_are_scaled_suppressed_and_mapped() {
        let mut det = detect(DetectType::Ssd);
        det.set_labels(Labels::parse("background\nperson\n", "test"));
        #[rustfmt::skip]
        let rows = vec![
            0.0, 1.0, 0.9, 0.25, 0.25, 0.5, 0.5,
            0.0, 1.0, 0.8, 0.26, 0.26, 0.5, 0.5,
            0.0, 1.0, 0.1, 0.0, 0.0, 1.0, 1.0,
        ];
        let out = Tensor::from_f32(vec![1, 1, 3, 7], rows).unwrap();
        det.process(&[out], &preprocessor()).unwrap();

        let Results::Detections(d) = det.results() else {
            panic!("expected detections");
        };
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].reco[0].category, "person");
        assert!((d[0].reco[0].score - 90.0).abs() < 1e-3);
        // Blob box 16..33 doubles into the 128x128 image
        assert_eq!((d[0].tlx, d[0].tly), (32.0, 32.0));
        assert_eq!((d[0].brx, d[0].bry), (66.0, 66.0));
    }

    #[test]
    fn decoded_yolo_rows() {
        let mut det = detect(DetectType::Yolo);
        #[rustfmt::skip]
        let rows = vec![
            0.5, 0.5, 0.25, 0.25, 0.9, 0.1, 0.7,
            0.1, 0.1, 0.1, 0.1, 0.9, 0.05, 0.1,
        ];
        let out = Tensor::from_f32(vec![2, 7], rows).unwrap();
        det.process(&[out], &preprocessor()).unwrap();
        let Results::Detections(d) = det.results() else {
            panic!("expected detections");
        };
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].reco[0].category, "1");
        assert_eq!((d[0].tlx, d[0].tly), (48.0, 48.0));
    }

    #[test]
    fn malformed_outputs_fail() {
        let mut det = detect(DetectType::FasterRcnn);
        let bad = Tensor::from_f32(vec![1, 1, 2, 6], vec![0.0; 12]).unwrap();
        assert!(det.process(&[bad], &preprocessor()).is_err());

        let mut det = detect(DetectType::TpuSsd);
        let t = Tensor::from_f32(vec![1], vec![0.0]).unwrap();
        assert!(det.process(&[t], &preprocessor()).is_err());

        assert!(Detect::new(PostProcessorConfig {
            detecttype: DetectType::RawYolo,
            anchors: "1,2,3".into(),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn tpu_ssd_honors_count() {
        let mut det = detect(DetectType::TpuSsd);
        let boxes = Tensor::from_f32(vec![2, 4], vec![0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 1.0, 1.0]).unwrap();
        let ids = Tensor::from_f32(vec![2], vec![3.0, 4.0]).unwrap();
        let scores = Tensor::from_f32(vec![2], vec![0.9, 0.9]).unwrap();
        let count = Tensor::from_f32(vec![1], vec![1.0]).unwrap();
        det.process(&[boxes, ids, scores, count], &preprocessor()).unwrap();
        let Results::Detections(d) = det.results() else {
            panic!("expected detections");
        };
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].reco[0].category, "3");
    }
}
