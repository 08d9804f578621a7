//! Decoders turning raw network outputs into recognitions, boxes or masks

mod classify;
mod detect;
mod nms;
mod segment;
mod yolo;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use classify::Classify;
pub use detect::Detect;
pub use nms::{iou, nms_boxes};
pub use segment::{voc_colormap, Segment};
pub use yolo::{Candidate, YoloDecoder, YoloParams};

use super::preprocess::PreProcessor;
use super::tensor::Tensor;
use super::utils::Labels;
use crate::error::Result;
use crate::imgproc::{PackedImage, Rect};

/// One recognized category with its score in percent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjReco {
    pub score: f32,
    pub category: String,
}

/// A detected box in image coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjDetect {
    pub tlx: f32,
    pub tly: f32,
    pub brx: f32,
    pub bry: f32,
    /// Best category first
    pub reco: Vec<ObjReco>,
}

/// RGBA class overlay and where it sits in the source image
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub image: PackedImage,
    pub rect: Rect,
}

/// Latest results of a post-processor
#[derive(Debug, Clone, Copy)]
pub enum Results<'a> {
    Recognitions(&'a [ObjReco]),
    Detections(&'a [ObjDetect]),
    Overlay(Option<&'a Overlay>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostKind {
    #[default]
    Classify,
    Detect,
    Segment,
}

/// Output format handled by [`Detect`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectType {
    /// 1x1xNx7 with absolute box coordinates
    FasterRcnn,
    /// NxC rows of center, size, objectness and class scores
    #[default]
    Yolo,
    /// 1x1xNx7 with box coordinates relative to the blob
    Ssd,
    /// boxes, ids, scores and count tensors
    TpuSsd,
    /// Raw YOLO feature maps decoded with anchors
    RawYolo,
}

/// Segmentation output layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegType {
    /// 1xHxWxC class scores
    #[default]
    ClassesHwc,
    /// 1xCxHxW class scores
    ClassesChw,
    /// HxW, 1xHxW or 1xHxWx1 class ids
    ArgMax,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessorConfig {
    pub kind: PostKind,
    /// Labels file
    pub classes: Option<PathBuf>,
    /// Added to model class ids before the label lookup
    pub classoffset: i32,
    pub top: usize,
    /// Cap on boxes; raw YOLO applies it to the total over all scales
    pub maxnbox: usize,
    /// Classification threshold, percent
    pub cthresh: f32,
    /// Box threshold, percent
    pub dthresh: f32,
    pub softmax: bool,
    pub scorescale: f32,
    pub detecttype: DetectType,
    /// NMS IoU threshold, percent
    pub nms: f32,
    pub anchors: String,
    pub alpha: u8,
    pub bgid: u8,
    pub segtype: SegType,
    /// 0 for old-style YOLO boxes, else the new-style xy scale
    pub scalexy: f32,
    pub sigmoid: bool,
}

impl Default for PostProcessorConfig {
    fn default() -> Self {
        Self {
            kind: PostKind::Classify,
            classes: None,
            classoffset: 0,
            top: 5,
            maxnbox: 500,
            cthresh: 20.0,
            dthresh: 15.0,
            softmax: false,
            scorescale: 1.0,
            detecttype: DetectType::Yolo,
            nms: 45.0,
            anchors: String::new(),
            alpha: 64,
            bgid: 0,
            segtype: SegType::ClassesHwc,
            scalexy: 0.0,
            sigmoid: true,
        }
    }
}

impl PostProcessorConfig {
    pub(crate) fn labels(&self) -> Result<Labels> {
        match &self.classes {
            Some(path) => Labels::load(path),
            None => Ok(Labels::default()),
        }
    }
}

/// Last stage of the network pipeline
pub trait PostProcessor: Send {
    /// Decodes `outs`. `pre` is the pre-processor that built this frame's
    /// blobs and maps blob coordinates back to the image.
    fn process(&mut self, outs: &[Tensor], pre: &PreProcessor) -> Result<()>;

    fn results(&self) -> Results<'_>;
}

/// Builds the post-processor selected by `cfg.kind`.
pub fn create(cfg: &PostProcessorConfig) -> Result<Box<dyn PostProcessor>> {
    Ok(match cfg.kind {
        PostKind::Classify => Box::new(Classify::new(cfg.clone())?),
        PostKind::Detect => Box::new(Detect::new(cfg.clone())?),
        PostKind::Segment => Box::new(Segment::new(cfg.clone())),
    })
}
