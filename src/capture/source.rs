//! Sensor drivers feeding a [`Camera`](super::camera::Camera)

use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::convert::{self, ColorOrder};
use super::format::PixelFormat;
use crate::error::{Error, Result};
use crate::imgproc::PackedImage;

/// Something that produces raw frames into caller-provided memory.
///
/// `grab` is called from the camera's capture thread only and blocks until
/// a frame is ready, pacing the stream.
pub trait FrameSource: Send + 'static {
    /// Width, height and pixel format of every grabbed frame
    fn format(&self) -> (u32, u32, PixelFormat);

    fn fps(&self) -> f32;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Writes the next frame into `dst` and returns the bytes used.
    fn grab(&mut self, dst: &mut [u8]) -> Result<usize>;
}

/// Synthetic sensor: moving color bars with a frame counter stripe,
/// delivered at a fixed rate. Runs anywhere, which makes it the default
/// source for tests and bring-up.
pub struct PatternSource {
    width: u32,
    height: u32,
    fmt: PixelFormat,
    fps: f32,
    frame: u64,
    pacer: Pacer,
    scratch: PackedImage,
}

const BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [0, 0, 0],
];

impl PatternSource {
    pub fn new(width: u32, height: u32, fmt: PixelFormat, fps: f32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::format(format!("invalid pattern size {width}x{height}")));
        }
        if matches!(fmt, PixelFormat::Mjpeg | PixelFormat::Srggb8) {
            return Err(Error::format(format!("pattern source cannot produce {fmt}")));
        }
        if fmt == PixelFormat::Yuyv && width % 2 != 0 {
            return Err(Error::format("YUYV needs an even width"));
        }
        Ok(Self {
            width,
            height,
            fmt,
            fps,
            frame: 0,
            pacer: Pacer::new(fps),
            scratch: PackedImage::new(width, height, 3)?,
        })
    }

    /// Frames produced since creation
    pub fn frames(&self) -> u64 {
        self.frame
    }

    fn paint(&mut self) {
        let (w, h) = (self.width as usize, self.height as usize);
        let shift = self.frame as usize;
        let stripe = h / 16;
        for y in 0..h {
            for x in 0..w {
                let color = if y < stripe {
                    // Frame counter as a binary stripe, one bit per 1/16th of the width
                    let bit = x * 16 / w;
                    if (self.frame >> bit) & 1 == 1 {
                        [255; 3]
                    } else {
                        [0; 3]
                    }
                } else {
                    BARS[((x + shift) * BARS.len() / w) % BARS.len()]
                };
                let i = (y * w + x) * 3;
                self.scratch.data[i..i + 3].copy_from_slice(&color);
            }
        }
    }
}

/// Sleeps so that successive frames are one period apart. A rate of 0
/// disables pacing.
pub(crate) struct Pacer {
    period: Option<Duration>,
    next: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(fps: f32) -> Self {
        Self {
            period: (fps > 0.0).then(|| Duration::from_secs_f32(1.0 / fps)),
            next: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.next = None;
    }

    pub(crate) fn wait(&mut self) {
        let Some(period) = self.period else {
            return;
        };
        let now = Instant::now();
        let due = self.next.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        // Do not try to catch up after a stall
        self.next = Some(due.max(now) + period);
    }
}

impl FrameSource for PatternSource {
    fn format(&self) -> (u32, u32, PixelFormat) {
        (self.width, self.height, self.fmt)
    }

    fn fps(&self) -> f32 {
        self.fps
    }

    fn start(&mut self) -> Result<()> {
        debug!("pattern source {}x{} {} @ {} fps", self.width, self.height, self.fmt, self.fps);
        self.pacer.reset();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn grab(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.pacer.wait();
        self.paint();
        self.frame += 1;
        convert::from_packed(&self.scratch, ColorOrder::Rgb, self.fmt, dst)
    }
}

#[cfg(feature = "v4l2")]
pub use self::v4l2::V4l2Source;

#[cfg(feature = "v4l2")]
mod v4l2 {
    use v4l::buffer::Type;
    use v4l::capability::Flags as CapFlags;
    use v4l::io::traits::CaptureStream;
    use v4l::prelude::MmapStream;
    use v4l::video::capture::Parameters;
    use v4l::video::Capture;
    use v4l::{Device, FourCC};
    use tracing::{info, warn};

    use super::FrameSource;
    use crate::capture::format::PixelFormat;
    use crate::error::{Error, Result};

    /// Kernel camera driven through memory-mapped V4L2 buffers. Each frame is
    /// copied once, from the driver's mapping into the pool buffer.
    pub struct V4l2Source {
        device: Device,
        stream: Option<MmapStream<'static>>,
        width: u32,
        height: u32,
        fmt: PixelFormat,
        fps: f32,
        nbufs: u32,
    }

    impl V4l2Source {
        pub fn open(path: &str, width: u32, height: u32, fmt: PixelFormat, fps: f32) -> Result<Self> {
            info!("Opening V4L2 device {path}");
            let device = Device::with_path(path)?;

            let caps = device.query_caps()?;
            info!("Device: {} ({})", caps.card, caps.driver);
            if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                return Err(Error::format(format!("{path} does not support video capture")));
            }

            let mut format = device.format()?;
            format.width = width;
            format.height = height;
            format.fourcc = FourCC::new(&fmt.fourcc());
            let format = device.set_format(&format)?;
            let got = PixelFormat::from_fourcc(format.fourcc.repr)?;
            if got != fmt || format.width != width || format.height != height {
                return Err(Error::format(format!(
                    "{path}: requested {width}x{height} {fmt}, driver chose {}x{} {got}",
                    format.width, format.height
                )));
            }

            // Frame rate is a hint: many drivers only support a fixed list
            if fps > 0.0 {
                if let Err(e) = device.set_params(&Parameters::with_fps(fps.round() as u32)) {
                    warn!("{path}: could not set {fps} fps: {e}");
                }
            }

            Ok(Self {
                device,
                stream: None,
                width,
                height,
                fmt,
                fps,
                nbufs: 4,
            })
        }
    }

    impl FrameSource for V4l2Source {
        fn format(&self) -> (u32, u32, PixelFormat) {
            (self.width, self.height, self.fmt)
        }

        fn fps(&self) -> f32 {
            self.fps
        }

        fn start(&mut self) -> Result<()> {
            let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, self.nbufs)?;
            self.stream = Some(stream);
            info!("V4L2 stream started with {} driver buffers", self.nbufs);
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            // Dropping the stream issues STREAMOFF and unmaps the driver buffers
            self.stream = None;
            Ok(())
        }

        fn grab(&mut self, dst: &mut [u8]) -> Result<usize> {
            let stream = self.stream.as_mut().ok_or(Error::NotStreaming)?;
            let (buf, meta) = stream.next()?;
            let used = (meta.bytesused as usize).min(buf.len());
            if used > dst.len() {
                return Err(Error::ShapeMismatch {
                    expected: format!("at most {} bytes", dst.len()),
                    got: format!("{used} byte frame"),
                });
            }
            dst[..used].copy_from_slice(&buf[..used]);
            Ok(used)
        }
    }
}

#[cfg(feature = "gstreamer-pipeline")]
pub use self::gst::GstSource;

#[cfg(feature = "gstreamer-pipeline")]
mod gst {
    use gstreamer as gst;
    use gstreamer::prelude::*;
    use gstreamer_app as gst_app;
    use gstreamer_video as gst_video;
    use tracing::{debug, info, warn};

    use super::FrameSource;
    use crate::capture::format::PixelFormat;
    use crate::error::{Error, Result};

    /// Camera read through a GStreamer pipeline ending in an appsink, with
    /// decoding and color conversion to RGB24 done by GStreamer.
    pub struct GstSource {
        pipeline: gst::Pipeline,
        appsink: gst_app::AppSink,
        width: u32,
        height: u32,
        fps: f32,
    }

    impl GstSource {
        pub fn open(device: &str, width: u32, height: u32, fmt: PixelFormat, fps: f32) -> Result<Self> {
            gst::init().map_err(|e| Error::backend(format!("GStreamer init failed: {e}")))?;

            let desc = pipeline_string(device, width, height, fmt, fps)?;
            info!("Pipeline: {desc}");
            let pipeline = gst::parse::launch(&desc)
                .map_err(|e| Error::backend(format!("bad pipeline: {e}")))?
                .downcast::<gst::Pipeline>()
                .map_err(|_| Error::backend("launch string did not produce a pipeline"))?;
            let appsink = pipeline
                .by_name("appsink")
                .ok_or_else(|| Error::backend("pipeline has no appsink"))?
                .downcast::<gst_app::AppSink>()
                .map_err(|_| Error::backend("appsink element is not an AppSink"))?;

            appsink.set_property("emit-signals", false);
            appsink.set_property("max-buffers", 2u32);
            appsink.set_property("drop", true);
            appsink.set_property("sync", false);

            Ok(Self {
                pipeline,
                appsink,
                width,
                height,
                fps,
            })
        }
    }

    fn pipeline_string(device: &str, width: u32, height: u32, fmt: PixelFormat, fps: f32) -> Result<String> {
        let rate = fps.round().max(1.0) as u32;
        let caps = match fmt {
            PixelFormat::Mjpeg => {
                let dec = jpeg_decoder();
                info!("Using JPEG decoder: {dec}");
                format!("image/jpeg,width={width},height={height},framerate={rate}/1 ! {dec}")
            }
            PixelFormat::Yuyv => format!("video/x-raw,format=YUY2,width={width},height={height},framerate={rate}/1"),
            PixelFormat::Rgb24 => format!("video/x-raw,format=RGB,width={width},height={height},framerate={rate}/1"),
            other => return Err(Error::format(format!("GStreamer source cannot read {other}"))),
        };
        Ok(format!(
            "v4l2src device={device} ! {caps} ! \
             queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 ! \
             videoconvert ! video/x-raw,format=RGB ! appsink name=appsink"
        ))
    }

    /// Hardware JPEG decoder if one is installed, else the software one
    fn jpeg_decoder() -> &'static str {
        for dec in ["nvjpegdec", "vaapijpegdec", "v4l2jpegdec"] {
            if gst::ElementFactory::find(dec).is_some() {
                debug!("Found decoder: {dec}");
                return dec;
            }
        }
        warn!("No hardware JPEG decoder found, using jpegdec");
        "jpegdec"
    }

    impl FrameSource for GstSource {
        fn format(&self) -> (u32, u32, PixelFormat) {
            (self.width, self.height, PixelFormat::Rgb24)
        }

        fn fps(&self) -> f32 {
            self.fps
        }

        fn start(&mut self) -> Result<()> {
            self.pipeline
                .set_state(gst::State::Playing)
                .map_err(|e| Error::backend(format!("cannot start pipeline: {e:?}")))?;
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.pipeline
                .set_state(gst::State::Null)
                .map_err(|e| Error::backend(format!("cannot stop pipeline: {e:?}")))?;
            Ok(())
        }

        fn grab(&mut self, dst: &mut [u8]) -> Result<usize> {
            let sample = self
                .appsink
                .pull_sample()
                .map_err(|_| Error::backend("pipeline ended"))?;
            let caps = sample.caps().ok_or_else(|| Error::backend("sample has no caps"))?;
            let info = gst_video::VideoInfo::from_caps(caps)
                .map_err(|_| Error::backend("cannot parse video caps"))?;
            if info.width() != self.width || info.height() != self.height {
                return Err(Error::ShapeMismatch {
                    expected: format!("{}x{}", self.width, self.height),
                    got: format!("{}x{}", info.width(), info.height()),
                });
            }
            let buffer = sample.buffer().ok_or_else(|| Error::backend("sample has no buffer"))?;
            let map = buffer
                .map_readable()
                .map_err(|_| Error::backend("cannot map buffer"))?;
            let data = map.as_slice();
            if data.len() > dst.len() {
                return Err(Error::ShapeMismatch {
                    expected: format!("at most {} bytes", dst.len()),
                    got: format!("{} bytes", data.len()),
                });
            }
            dst[..data.len()].copy_from_slice(data);
            Ok(data.len())
        }
    }

    impl Drop for GstSource {
        fn drop(&mut self) {
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}

/// Logs what a source will deliver.
pub(crate) fn describe(source: &dyn FrameSource) {
    let (w, h, fmt) = source.format();
    info!("Capture source: {w}x{h} {fmt} @ {} fps", source.fps());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_fills_frames_in_requested_format() {
        let mut src = PatternSource::new(32, 16, PixelFormat::Yuyv, 0.0).unwrap();
        let mut buf = vec![0u8; PixelFormat::Yuyv.image_size(32, 16)];
        let used = src.grab(&mut buf).unwrap();
        assert_eq!(used, 32 * 16 * 2);
        src.grab(&mut buf).unwrap();
        assert_eq!(src.frames(), 2);

        let mut small = vec![0u8; 10];
        assert!(src.grab(&mut small).is_err());
    }

    #[test]
    fn pattern_rejects_compressed_output() {
        assert!(PatternSource::new(8, 8, PixelFormat::Mjpeg, 30.0).is_err());
        assert!(PatternSource::new(7, 8, PixelFormat::Yuyv, 30.0).is_err());
        assert!(PatternSource::new(0, 8, PixelFormat::Rgb24, 30.0).is_err());
    }

    #[test]
    fn pattern_paces_at_frame_rate() {
        let mut src = PatternSource::new(8, 8, PixelFormat::Rgb24, 100.0).unwrap();
        let mut buf = vec![0u8; 8 * 8 * 3];
        src.start().unwrap();
        let t0 = Instant::now();
        for _ in 0..4 {
            src.grab(&mut buf).unwrap();
        }
        // First frame is immediate, the next three wait 10 ms each
        assert!(t0.elapsed() >= Duration::from_millis(25));
    }
}
