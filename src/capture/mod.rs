pub mod buffer;
pub mod buffers;
pub mod camera;
pub mod convert;
pub mod format;
pub mod frame;
pub mod image;
pub mod input;
pub mod movie;
pub mod output;
pub mod source;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

pub use buffers::VideoBuffers;
pub use camera::{Camera, CameraOptions};
pub use convert::ColorOrder;
pub use format::PixelFormat;
pub use frame::{InputFrame, OutputFrame};
pub use image::RawImage;
pub use input::VideoInput;
pub use movie::MovieSource;
pub use output::{ChannelOutput, MovieOutput, SentFrame, VideoOutput};
pub use source::{FrameSource, PatternSource};

use crate::error::{Error, Result};

/// Where frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Synthetic test pattern
    #[default]
    Pattern,
    V4l2,
    Gstreamer,
    Movie,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    /// Camera device node
    pub device: String,
    /// Image file, image directory or MJPEG file for [`SourceKind::Movie`]
    pub movie: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub format: PixelFormat,
    /// Pool size; 0 sizes the pool from the frame size
    pub nbufs: usize,
    pub ready_depth: usize,
    pub shared_buffers: bool,
    /// Size of the secondary RGB24 stream
    pub scaled: Option<(u32, u32)>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Pattern,
            device: "/dev/video0".into(),
            movie: None,
            width: 640,
            height: 480,
            fps: 30.0,
            format: PixelFormat::Yuyv,
            nbufs: 0,
            ready_depth: 1,
            shared_buffers: false,
            scaled: None,
        }
    }
}

fn source(cfg: &CaptureConfig) -> Result<Box<dyn FrameSource>> {
    Ok(match cfg.source {
        SourceKind::Pattern => Box::new(PatternSource::new(cfg.width, cfg.height, cfg.format, cfg.fps)?),
        SourceKind::Movie => {
            let path = cfg
                .movie
                .as_ref()
                .ok_or_else(|| Error::format("movie source needs capture.movie"))?;
            Box::new(MovieSource::open(path, cfg.width, cfg.height, cfg.format, cfg.fps)?)
        }
        #[cfg(feature = "v4l2")]
        SourceKind::V4l2 => Box::new(source::V4l2Source::open(
            &cfg.device,
            cfg.width,
            cfg.height,
            cfg.format,
            cfg.fps,
        )?),
        #[cfg(feature = "gstreamer-pipeline")]
        SourceKind::Gstreamer => Box::new(source::GstSource::open(
            &cfg.device,
            cfg.width,
            cfg.height,
            cfg.format,
            cfg.fps,
        )?),
        #[allow(unreachable_patterns)]
        other => {
            return Err(Error::format(format!(
                "capture source {other:?} is not compiled in"
            )))
        }
    })
}

/// Where processed frames go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    None,
    /// Numbered image files
    Movie,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub kind: OutputKind,
    pub dir: PathBuf,
    pub prefix: String,
    pub jpeg: bool,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            kind: OutputKind::None,
            dir: PathBuf::from("iris-output"),
            prefix: "frame".into(),
            jpeg: false,
            width: 640,
            height: 480,
            format: PixelFormat::Rgb24,
        }
    }
}

/// Opens the configured video output, if any.
pub fn open_output(cfg: &OutputConfig) -> Result<Option<Box<dyn VideoOutput>>> {
    Ok(match cfg.kind {
        OutputKind::None => None,
        OutputKind::Movie => {
            info!("Writing frames to {}", cfg.dir.display());
            Some(Box::new(MovieOutput::new(
                &cfg.dir,
                &cfg.prefix,
                cfg.jpeg,
                cfg.width,
                cfg.height,
                cfg.format,
            )?))
        }
    })
}

/// Opens the configured video input.
pub fn open(cfg: &CaptureConfig) -> Result<Box<dyn VideoInput>> {
    info!("Opening {:?} capture", cfg.source);
    let camera = Camera::with_options(
        source(cfg)?,
        CameraOptions {
            nbufs: cfg.nbufs,
            scaled: cfg.scaled,
            ready_depth: cfg.ready_depth,
            shared: cfg.shared_buffers,
        },
    )?;
    Ok(Box::new(camera))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_input_opens_by_default() {
        let cfg = CaptureConfig {
            width: 32,
            height: 24,
            fps: 0.0,
            nbufs: 3,
            ..Default::default()
        };
        let input = open(&cfg).unwrap();
        assert_eq!(input.format(), (32, 24, PixelFormat::Yuyv, 0.0));
        input.stream_on().unwrap();
        let mut frame = InputFrame::new(input.as_ref());
        assert_eq!(frame.get().unwrap().bytesize(), 32 * 24 * 2);
    }

    #[test]
    fn no_output_by_default() {
        assert!(open_output(&OutputConfig::default()).unwrap().is_none());
    }

    #[test]
    fn movie_without_path_fails() {
        let cfg = CaptureConfig {
            source: SourceKind::Movie,
            ..Default::default()
        };
        assert!(open(&cfg).is_err());
    }
}
