//! Camera input: a dedicated capture thread filling a buffer pool

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use super::buffers::{PoolStats, VideoBuffers};
use super::convert::{self, ColorOrder};
use super::format::PixelFormat;
use super::image::RawImage;
use super::input::VideoInput;
use super::source::{self, FrameSource};
use crate::error::{Error, Result};
use crate::imgproc::Interp;
use crate::pipeline::ringbuf::ReadyRing;

/// Pool sizing target when the buffer count is left to the camera
const AUTO_POOL_BYTES: usize = 4 << 20;
const MIN_BUFS: usize = 3;
const MAX_BUFS: usize = 63;
const GRAB_RETRY: Duration = Duration::from_millis(10);

/// Tuning for [`Camera::with_options`]
#[derive(Debug, Clone, Copy)]
pub struct CameraOptions {
    /// Pool size; 0 picks one from the frame size
    pub nbufs: usize,
    /// Size of the secondary RGB24 stream, if any
    pub scaled: Option<(u32, u32)>,
    /// Frames kept ready for the consumer before the oldest is dropped
    pub ready_depth: usize,
    /// Back buffers with shareable memory exporting a file descriptor
    pub shared: bool,
}

impl Default for CameraOptions {
    fn default() -> Self {
        Self {
            nbufs: 0,
            scaled: None,
            ready_depth: 1,
            shared: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Ready {
    index: usize,
    scaled: Option<usize>,
}

struct State {
    streaming: bool,
    aborted: bool,
    ready: ReadyRing<Ready>,
    /// Buffers checked out through `get`, per pool
    held: Vec<bool>,
    held2: Vec<bool>,
    /// Scaled companion of the frame last handed out, not yet taken by `get2`
    pending2: Option<usize>,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    running: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Scaled {
    bufs: Arc<VideoBuffers>,
    width: u32,
    height: u32,
}

enum Worker {
    Idle(Box<dyn FrameSource>),
    Running(JoinHandle<Box<dyn FrameSource>>),
    /// The capture thread panicked and took the source with it
    Lost,
}

/// A [`VideoInput`] fed by a [`FrameSource`] on its own thread.
///
/// The thread never blocks on the consumer: when every buffer is checked
/// out the frame is grabbed into scratch memory and dropped, and when the
/// ready ring is full the oldest ready frame is recycled.
pub struct Camera {
    width: u32,
    height: u32,
    fmt: PixelFormat,
    fps: f32,
    bufs: Arc<VideoBuffers>,
    scaled: Option<Scaled>,
    shared: Arc<Shared>,
    worker: Mutex<Worker>,
}

fn pool_size(nbufs: usize, frame_bytes: usize) -> usize {
    let n = if nbufs == 0 {
        AUTO_POOL_BYTES / frame_bytes.max(1)
    } else {
        nbufs
    };
    n.clamp(MIN_BUFS, MAX_BUFS)
}

impl Camera {
    pub fn new(source: Box<dyn FrameSource>, nbufs: usize, scaled: Option<(u32, u32)>) -> Result<Self> {
        Self::with_options(
            source,
            CameraOptions {
                nbufs,
                scaled,
                ..Default::default()
            },
        )
    }

    pub fn with_options(source: Box<dyn FrameSource>, opts: CameraOptions) -> Result<Self> {
        let (width, height, fmt) = source.format();
        let fps = source.fps();
        source::describe(source.as_ref());

        let frame_bytes = fmt.image_size(width, height);
        let n = pool_size(opts.nbufs, frame_bytes);
        if opts.nbufs != 0 && opts.nbufs != n {
            warn!("Buffer count {} clamped to {n}", opts.nbufs);
        }
        let bufs = Arc::new(VideoBuffers::new("camera", n, frame_bytes, opts.shared)?);

        let scaled = match opts.scaled {
            Some((w, h)) if w == 0 || h == 0 => {
                return Err(Error::format(format!("invalid scaled size {w}x{h}")));
            }
            Some((w, h)) => {
                let len = PixelFormat::Rgb24.image_size(w, h);
                let pool = VideoBuffers::new("camera-scaled", n, len, opts.shared)?;
                info!("Scaled stream {w}x{h} RGB3");
                Some(Scaled {
                    bufs: Arc::new(pool),
                    width: w,
                    height: h,
                })
            }
            None => None,
        };

        let state = State {
            streaming: false,
            aborted: false,
            ready: ReadyRing::new(opts.ready_depth),
            held: vec![false; n],
            held2: vec![false; n],
            pending2: None,
        };

        Ok(Self {
            width,
            height,
            fmt,
            fps,
            bufs,
            scaled,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                cond: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(Worker::Idle(source)),
        })
    }

    /// Number of buffers in the pool
    pub fn nbufs(&self) -> usize {
        self.bufs.size()
    }

    pub fn stats(&self) -> PoolStats {
        self.bufs.stats()
    }

    /// Frames that were dropped because the ready ring overflowed
    pub fn evicted(&self) -> usize {
        self.shared.lock().ready.stats().evicted
    }

    fn worker(&self) -> MutexGuard<'_, Worker> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn image(&self, index: usize) -> Result<RawImage> {
        Ok(RawImage::new(
            self.width,
            self.height,
            self.fmt,
            self.fps,
            self.bufs.get(index)?,
            index,
        ))
    }
}

/// Everything the capture thread needs
struct Producer {
    source: Box<dyn FrameSource>,
    bufs: Arc<VideoBuffers>,
    scaled: Option<(Arc<VideoBuffers>, u32, u32)>,
    shared: Arc<Shared>,
    width: u32,
    height: u32,
    fmt: PixelFormat,
    scratch: Vec<u8>,
}

impl Producer {
    fn run(mut self) -> Box<dyn FrameSource> {
        debug!("capture thread started");
        let mut failures = 0u64;
        while self.shared.running.load(Ordering::Acquire) {
            match self.step() {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    // One line per burst of failures, then every 100th
                    if failures == 1 || failures % 100 == 0 {
                        error!("Capture failed ({failures} in a row): {e}");
                    }
                    std::thread::sleep(GRAB_RETRY);
                }
            }
        }
        debug!("capture thread stopped");
        self.source
    }

    fn step(&mut self) -> Result<()> {
        let source = &mut self.source;
        let filled = self.bufs.fill_next(|buf| source.grab(&mut buf.write()))?;
        if filled.is_none() {
            // Every buffer is checked out: keep the sensor paced and drop the frame
            self.scratch.resize(self.bufs.get(0)?.len(), 0);
            self.source.grab(&mut self.scratch)?;
            return Ok(());
        }
        let Some(index) = self.bufs.dqbuf_timeout(Duration::ZERO)? else {
            return Ok(());
        };
        metrics::counter!("frames_captured").increment(1);

        let scaled = match self.fill_scaled(index) {
            Ok(s) => s,
            Err(e) => {
                self.bufs.qbuf(index)?;
                return Err(e);
            }
        };

        let evicted = {
            let mut st = self.shared.lock();
            st.ready.push(Ready { index, scaled })
        };
        if let Some(old) = evicted {
            self.recycle(old)?;
        }
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Downscales frame `index` to RGB24 into the secondary pool.
    fn fill_scaled(&self, index: usize) -> Result<Option<usize>> {
        let Some((pool, w, h)) = &self.scaled else {
            return Ok(None);
        };
        let src = self.bufs.get(index)?;
        let filled = pool.fill_next(|dst| {
            let data = src.read();
            let used = if self.fmt.is_compressed() { src.bytes_used() } else { data.len() };
            let img = convert::to_packed(&data[..used], self.width, self.height, self.fmt, ColorOrder::Rgb)?;
            let small = img.resize(*w, *h, Interp::Area)?;
            convert::from_packed(&small, ColorOrder::Rgb, PixelFormat::Rgb24, &mut dst.write())
        })?;
        match filled {
            Some(_) => pool.dqbuf_timeout(Duration::ZERO),
            None => Ok(None),
        }
    }

    fn recycle(&self, r: Ready) -> Result<()> {
        self.bufs.qbuf(r.index)?;
        if let (Some(i), Some((pool, _, _))) = (r.scaled, &self.scaled) {
            pool.qbuf(i)?;
        }
        Ok(())
    }
}

impl VideoInput for Camera {
    fn format(&self) -> (u32, u32, PixelFormat, f32) {
        (self.width, self.height, self.fmt, self.fps)
    }

    #[instrument(skip(self))]
    fn stream_on(&self) -> Result<()> {
        let mut worker = self.worker();
        let mut source = match std::mem::replace(&mut *worker, Worker::Lost) {
            Worker::Idle(source) => source,
            running @ Worker::Running(_) => {
                *worker = running;
                return Ok(());
            }
            Worker::Lost => return Err(Error::backend("capture source was lost in a crashed thread")),
        };

        {
            let mut st = self.shared.lock();
            st.aborted = false;
            st.streaming = true;
            for i in (0..self.bufs.size()).filter(|&i| !st.held[i]) {
                self.bufs.qbuf(i)?;
            }
            if let Some(s) = &self.scaled {
                for i in (0..s.bufs.size()).filter(|&i| !st.held2[i]) {
                    s.bufs.qbuf(i)?;
                }
            }
        }

        if let Err(e) = source.start() {
            self.shared.lock().streaming = false;
            self.bufs.dqbufall();
            if let Some(s) = &self.scaled {
                s.bufs.dqbufall();
            }
            *worker = Worker::Idle(source);
            return Err(e);
        }

        self.shared.running.store(true, Ordering::Release);
        let producer = Producer {
            source,
            bufs: self.bufs.clone(),
            scaled: self.scaled.as_ref().map(|s| (s.bufs.clone(), s.width, s.height)),
            shared: self.shared.clone(),
            width: self.width,
            height: self.height,
            fmt: self.fmt,
            scratch: Vec::new(),
        };
        let handle = std::thread::Builder::new()
            .name("iris-capture".into())
            .spawn(move || producer.run())?;
        *worker = Worker::Running(handle);
        info!("Streaming {}x{} {}", self.width, self.height, self.fmt);
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        let mut worker = self.worker();
        let handle = match std::mem::replace(&mut *worker, Worker::Lost) {
            Worker::Running(handle) => handle,
            other => {
                *worker = other;
                return Ok(());
            }
        };
        self.shared.running.store(false, Ordering::Release);
        let mut source = handle
            .join()
            .map_err(|_| Error::backend("capture thread panicked"))?;
        let stopped = source.stop();
        *worker = Worker::Idle(source);

        {
            let mut st = self.shared.lock();
            st.streaming = false;
            // Ready frames and the untaken scaled companion go back to the pool
            st.ready.drain();
            if let Some(i) = st.pending2.take() {
                st.held2[i] = false;
            }
        }
        self.bufs.dqbufall();
        if let Some(s) = &self.scaled {
            s.bufs.dqbufall();
        }
        self.shared.cond.notify_all();
        info!("Stream off, {:?}", self.bufs.stats());
        stopped
    }

    fn abort_stream(&self) {
        self.shared.lock().aborted = true;
        self.shared.cond.notify_all();
    }

    fn get(&self) -> Result<RawImage> {
        let t0 = Instant::now();
        let mut st = self.shared.lock();
        let ready = loop {
            if st.aborted {
                return Err(Error::Aborted);
            }
            if !st.streaming {
                return Err(Error::NotStreaming);
            }
            if let Some(r) = st.ready.pop() {
                break r;
            }
            st = self.shared.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        };
        st.held[ready.index] = true;
        let stale = std::mem::replace(&mut st.pending2, ready.scaled);
        if let Some(i) = ready.scaled {
            st.held2[i] = true;
        }
        if let Some(i) = stale {
            st.held2[i] = false;
        }
        drop(st);

        if let (Some(i), Some(s)) = (stale, &self.scaled) {
            s.bufs.qbuf(i)?;
        }
        metrics::histogram!("frame_get_wait_us").record(t0.elapsed().as_micros() as f64);
        self.image(ready.index)
    }

    fn done(&self, img: &mut RawImage) -> Result<()> {
        if !img.valid() {
            return Err(Error::format("done() on an invalid image"));
        }
        let index = img.bufindex;
        let (streaming, pending2) = {
            let mut st = self.shared.lock();
            if !st.held.get(index).copied().unwrap_or(false) {
                return Err(Error::format(format!("buffer {index} is not checked out")));
            }
            st.held[index] = false;
            let pending2 = st.pending2.take();
            if let Some(i) = pending2 {
                st.held2[i] = false;
            }
            (st.streaming, pending2)
        };
        img.invalidate();
        if streaming {
            self.bufs.qbuf(index)?;
            if let (Some(i), Some(s)) = (pending2, &self.scaled) {
                s.bufs.qbuf(i)?;
            }
        }
        Ok(())
    }

    fn has_scaled_image(&self) -> bool {
        self.scaled.is_some()
    }

    fn get2(&self) -> Result<RawImage> {
        let s = self
            .scaled
            .as_ref()
            .ok_or_else(|| Error::format("no scaled image stream"))?;
        let index = {
            let mut st = self.shared.lock();
            if st.aborted {
                return Err(Error::Aborted);
            }
            st.pending2
                .take()
                .ok_or_else(|| Error::format("no scaled image for the current frame"))?
        };
        Ok(RawImage::new(
            s.width,
            s.height,
            PixelFormat::Rgb24,
            self.fps,
            s.bufs.get(index)?,
            index,
        ))
    }

    fn done2(&self, img: &mut RawImage) -> Result<()> {
        let s = self
            .scaled
            .as_ref()
            .ok_or_else(|| Error::format("no scaled image stream"))?;
        if !img.valid() {
            return Err(Error::format("done2() on an invalid image"));
        }
        let index = img.bufindex;
        let streaming = {
            let mut st = self.shared.lock();
            if !st.held2.get(index).copied().unwrap_or(false) {
                return Err(Error::format(format!("scaled buffer {index} is not checked out")));
            }
            st.held2[index] = false;
            st.streaming
        };
        img.invalidate();
        if streaming {
            s.bufs.qbuf(index)?;
        }
        Ok(())
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if let Err(e) = self.stream_off() {
            warn!("Stream off on drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::PatternSource;

    fn camera(nbufs: usize, scaled: Option<(u32, u32)>) -> Camera {
        let src = PatternSource::new(16, 8, PixelFormat::Yuyv, 200.0).unwrap();
        Camera::new(Box::new(src), nbufs, scaled).unwrap()
    }

    #[test]
    fn get_before_stream_on_fails() {
        let cam = camera(3, None);
        assert!(matches!(cam.get(), Err(Error::NotStreaming)));
    }

    #[test]
    fn frames_cycle_through_the_pool() {
        let cam = camera(3, None);
        cam.stream_on().unwrap();
        for _ in 0..10 {
            let mut img = cam.get().unwrap();
            assert_eq!((img.width, img.height, img.fmt), (16, 8, PixelFormat::Yuyv));
            assert_eq!(img.bytesize(), 16 * 8 * 2);
            cam.done(&mut img).unwrap();
            assert!(!img.valid());
        }
        cam.stream_off().unwrap();
        assert!(matches!(cam.get(), Err(Error::NotStreaming)));
        assert!(cam.stats().filled >= 10);
    }

    #[test]
    fn done_twice_is_rejected() {
        let cam = camera(3, None);
        cam.stream_on().unwrap();
        let mut img = cam.get().unwrap();
        let mut copy = img.clone();
        cam.done(&mut img).unwrap();
        assert!(cam.done(&mut copy).is_err());
    }

    #[test]
    fn buffer_count_is_clamped() {
        assert_eq!(pool_size(1, 100), MIN_BUFS);
        assert_eq!(pool_size(100, 100), MAX_BUFS);
        assert_eq!(pool_size(0, 1 << 20), 4);
        assert_eq!(camera(0, None).nbufs(), MAX_BUFS);
    }

    #[test]
    fn scaled_companion_follows_each_frame() {
        let cam = camera(3, Some((8, 4)));
        assert!(cam.has_scaled_image());
        cam.stream_on().unwrap();
        for _ in 0..4 {
            let mut img = cam.get().unwrap();
            let mut small = cam.get2().unwrap();
            assert_eq!((small.width, small.height, small.fmt), (8, 4, PixelFormat::Rgb24));
            assert!(cam.get2().is_err());
            cam.done2(&mut small).unwrap();
            cam.done(&mut img).unwrap();
        }
        // Skipping get2 still returns the scaled buffer with the frame
        for _ in 0..6 {
            let mut img = cam.get().unwrap();
            cam.done(&mut img).unwrap();
        }
        cam.stream_off().unwrap();
    }

    #[test]
    fn stream_can_restart_while_frames_are_held() {
        let cam = camera(3, None);
        cam.stream_on().unwrap();
        let mut held = cam.get().unwrap();
        cam.stream_off().unwrap();
        cam.stream_on().unwrap();
        let mut img = cam.get().unwrap();
        assert_ne!(img.bufindex, held.bufindex);
        cam.done(&mut img).unwrap();
        cam.done(&mut held).unwrap();
        cam.stream_off().unwrap();
    }
}
