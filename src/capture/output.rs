//! Frame sinks: hand-off to a consumer thread, or numbered image files

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use image::{ImageFormat, RgbImage};
use tracing::{info, warn};

use super::buffers::VideoBuffers;
use super::convert::ColorOrder;
use super::format::PixelFormat;
use super::image::RawImage;
use crate::error::{Error, Result};

/// A sink of frames with the same Off/Streaming protocol as
/// [`VideoInput`](super::VideoInput): `get` checks out an empty buffer to
/// draw into and `send` gives it back, filled.
pub trait VideoOutput: Send + Sync {
    fn stream_on(&self) -> Result<()>;

    fn stream_off(&self) -> Result<()>;

    fn abort_stream(&self);

    /// Blocks until a buffer is free to draw into.
    fn get(&self) -> Result<RawImage>;

    /// Publishes a buffer obtained from [`get`](Self::get) and invalidates it.
    fn send(&self, img: &mut RawImage) -> Result<()>;
}

/// Buffers cycle App -> (send) queued -> taken by the sink -> completed ->
/// (get) App. Never-used buffers are handed out first.
struct OutputPool {
    bufs: Arc<VideoBuffers>,
    fresh: Mutex<Vec<usize>>,
    width: u32,
    height: u32,
    fmt: PixelFormat,
}

impl OutputPool {
    fn new(name: &str, nbufs: usize, width: u32, height: u32, fmt: PixelFormat) -> Result<Self> {
        let bufs = VideoBuffers::new(name, nbufs, fmt.image_size(width, height), false)?;
        Ok(Self {
            fresh: Mutex::new((0..bufs.size()).rev().collect()),
            bufs: Arc::new(bufs),
            width,
            height,
            fmt,
        })
    }

    fn fresh(&self) -> MutexGuard<'_, Vec<usize>> {
        self.fresh.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self) -> Result<RawImage> {
        if self.bufs.is_aborted() {
            return Err(Error::Aborted);
        }
        let fresh = self.fresh().pop();
        let index = match fresh {
            Some(index) => index,
            None => self.bufs.dqbuf()?,
        };
        Ok(RawImage::new(
            self.width,
            self.height,
            self.fmt,
            0.0,
            self.bufs.get(index)?,
            index,
        ))
    }

    /// Moves a filled buffer to the sink side and returns its index.
    fn submit(&self, img: &mut RawImage) -> Result<usize> {
        if !img.valid() {
            return Err(Error::format("send() on an invalid image"));
        }
        img.require("output", self.width, self.height, self.fmt)?;
        let index = img.bufindex;
        // Held across queue and take so concurrent senders cannot swap buffers
        let _order = self.fresh();
        self.bufs.qbuf(index)?;
        img.invalidate();
        match self.bufs.take_queued() {
            Some(taken) if taken == index => Ok(index),
            _ => Err(Error::format(format!("{}: output queue out of order", self.bufs.name()))),
        }
    }

    /// Collects every buffer the sink has finished with. Buffers the sink
    /// still holds come back through `get` once released.
    fn stop(&self) {
        let mut fresh = self.fresh();
        while let Ok(Some(index)) = self.bufs.dqbuf_timeout(Duration::ZERO) {
            fresh.push(index);
        }
    }
}

/// A frame handed to the consumer of a [`ChannelOutput`]. Dropping it
/// returns the buffer to the producer.
pub struct SentFrame {
    image: RawImage,
    bufs: Arc<VideoBuffers>,
}

impl SentFrame {
    pub fn image(&self) -> &RawImage {
        &self.image
    }
}

impl Drop for SentFrame {
    fn drop(&mut self) {
        let used = self.image.bytesize();
        if let Err(e) = self.bufs.complete(self.image.bufindex, used) {
            warn!("Returning output buffer failed: {e}");
        }
    }
}

/// Zero-copy output: filled buffers travel over a channel to a consumer
/// thread (display, encoder, network) and are recycled when it drops them.
pub struct ChannelOutput {
    pool: OutputPool,
    tx: flume::Sender<SentFrame>,
}

impl ChannelOutput {
    pub fn new(nbufs: usize, width: u32, height: u32, fmt: PixelFormat) -> Result<(Self, flume::Receiver<SentFrame>)> {
        let pool = OutputPool::new("output", nbufs, width, height, fmt)?;
        let (tx, rx) = flume::bounded(pool.bufs.size());
        Ok((Self { pool, tx }, rx))
    }
}

impl VideoOutput for ChannelOutput {
    fn stream_on(&self) -> Result<()> {
        self.pool.bufs.resume();
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        self.pool.stop();
        Ok(())
    }

    fn abort_stream(&self) {
        self.pool.bufs.abort();
    }

    fn get(&self) -> Result<RawImage> {
        self.pool.get()
    }

    fn send(&self, img: &mut RawImage) -> Result<()> {
        let image = img.clone();
        let index = self.pool.submit(img)?;
        debug_assert_eq!(image.bufindex, index);
        let frame = SentFrame {
            image,
            bufs: self.pool.bufs.clone(),
        };
        // The channel holds at most one frame per buffer, so this never blocks
        self.tx
            .try_send(frame)
            .map_err(|_| Error::backend("output consumer is gone"))
    }
}

/// Writes every sent frame to `<dir>/<prefix><number>.<png|jpg>`.
pub struct MovieOutput {
    pool: OutputPool,
    dir: PathBuf,
    prefix: String,
    format: ImageFormat,
    count: Mutex<u64>,
}

impl MovieOutput {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str, jpeg: bool, width: u32, height: u32, fmt: PixelFormat) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        info!("Writing frames to {}", dir.display());
        Ok(Self {
            pool: OutputPool::new("movie-output", 2, width, height, fmt)?,
            dir,
            prefix: prefix.to_string(),
            format: if jpeg { ImageFormat::Jpeg } else { ImageFormat::Png },
            count: Mutex::new(0),
        })
    }

    /// Frames written so far
    pub fn written(&self) -> u64 {
        *self.count.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, img: &RawImage) -> Result<()> {
        let packed = img.to_packed(ColorOrder::Rgb)?;
        let rgb = RgbImage::from_raw(packed.width, packed.height, packed.data)
            .ok_or_else(|| Error::format("frame does not fill an RGB image"))?;
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        let ext = if self.format == ImageFormat::Jpeg { "jpg" } else { "png" };
        let path = self.dir.join(format!("{}{:06}.{ext}", self.prefix, *count));
        rgb.save_with_format(&path, self.format)?;
        *count += 1;
        Ok(())
    }
}

impl VideoOutput for MovieOutput {
    fn stream_on(&self) -> Result<()> {
        self.pool.bufs.resume();
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        self.pool.stop();
        Ok(())
    }

    fn abort_stream(&self) {
        self.pool.bufs.abort();
    }

    fn get(&self) -> Result<RawImage> {
        self.pool.get()
    }

    fn send(&self, img: &mut RawImage) -> Result<()> {
        let image = img.clone();
        let index = self.pool.submit(img)?;
        let written = self.write(&image);
        self.pool.bufs.complete(index, image.bytesize())?;
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::convert;
    use crate::imgproc::PackedImage;

    #[test]
    fn channel_output_recycles_dropped_frames() {
        let (out, rx) = ChannelOutput::new(2, 4, 2, PixelFormat::Rgb24).unwrap();
        out.stream_on().unwrap();

        let mut a = out.get().unwrap();
        a.pixels_mut().unwrap()[0] = 9;
        let mut b = out.get().unwrap();
        out.send(&mut a).unwrap();
        assert!(!a.valid());
        out.send(&mut b).unwrap();

        let first = rx.recv().unwrap();
        assert_eq!(first.image().pixels().unwrap()[0], 9);
        drop(first);
        // The only free buffer is the one the consumer released
        let c = out.get().unwrap();
        assert_eq!(c.bufindex, 0);
    }

    #[test]
    fn sending_twice_fails() {
        let (out, _rx) = ChannelOutput::new(2, 4, 2, PixelFormat::Rgb24).unwrap();
        let mut a = out.get().unwrap();
        let mut again = a.clone();
        out.send(&mut a).unwrap();
        assert!(out.send(&mut again).is_err());
    }

    #[test]
    fn abort_unblocks_get() {
        let (out, _rx) = ChannelOutput::new(1, 2, 2, PixelFormat::Grey).unwrap();
        let _held = out.get().unwrap();
        out.abort_stream();
        assert!(matches!(out.get(), Err(Error::Aborted)));
    }

    #[test]
    fn movie_output_writes_numbered_files() {
        let dir = std::env::temp_dir().join(format!("iris-out-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let out = MovieOutput::new(&dir, "frame", false, 4, 2, PixelFormat::Rgb24).unwrap();
        out.stream_on().unwrap();
        for v in [10u8, 20, 30] {
            let mut img = out.get().unwrap();
            let src = PackedImage::from_vec(4, 2, 3, vec![v; 24]).unwrap();
            convert::from_packed(&src, ColorOrder::Rgb, PixelFormat::Rgb24, &mut img.pixels_mut().unwrap()).unwrap();
            out.send(&mut img).unwrap();
        }
        assert_eq!(out.written(), 3);
        let last = image::open(dir.join("frame000002.png")).unwrap().to_rgb8();
        assert_eq!(last.get_pixel(0, 0).0, [30, 30, 30]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
