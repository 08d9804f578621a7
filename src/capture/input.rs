//! The capture contract shared by cameras and file playback

use super::format::PixelFormat;
use super::image::RawImage;
use crate::error::{Error, Result};

/// A source of frames with an Off/Streaming state machine.
///
/// Every image returned by [`get`](Self::get) must be handed back exactly
/// once through [`done`](Self::done), otherwise the buffer pool runs dry and
/// `get` eventually blocks forever. `InputFrame` makes that automatic.
///
/// All methods take `&self` so a consumer thread can block in `get` while
/// another thread calls [`abort_stream`](Self::abort_stream).
pub trait VideoInput: Send + Sync {
    /// Geometry, format and frame rate of the primary stream
    fn format(&self) -> (u32, u32, PixelFormat, f32);

    fn stream_on(&self) -> Result<()>;

    /// Stops streaming and reclaims every buffer still held by the producer.
    fn stream_off(&self) -> Result<()>;

    /// Makes pending and future `get` calls fail with
    /// [`Error::Aborted`] without tearing the stream down.
    fn abort_stream(&self);

    /// Blocks until the next frame is available.
    fn get(&self) -> Result<RawImage>;

    /// Returns a frame obtained from [`get`](Self::get) and invalidates it.
    fn done(&self, img: &mut RawImage) -> Result<()>;

    /// True when a second, downscaled image accompanies each frame
    fn has_scaled_image(&self) -> bool {
        false
    }

    /// Scaled companion of the frame last returned by [`get`](Self::get)
    fn get2(&self) -> Result<RawImage> {
        Err(Error::format("no scaled image stream"))
    }

    fn done2(&self, _img: &mut RawImage) -> Result<()> {
        Err(Error::format("no scaled image stream"))
    }
}
