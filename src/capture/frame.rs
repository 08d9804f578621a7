//! Scoped frame handles that always give their buffer back

use std::os::fd::RawFd;

use tracing::warn;

use super::convert::{self, ColorOrder};
use super::image::RawImage;
use super::input::VideoInput;
use super::output::VideoOutput;
use crate::error::{Error, Result};
use crate::imgproc::PackedImage;

/// One frame of a [`VideoInput`].
///
/// Wraps at most one `get` and one `done`. Whatever the holder skipped is
/// done on drop: a frame never fetched is fetched and returned, a fetched
/// frame is returned, and so is its scaled companion. Errors on drop are
/// logged at most and otherwise ignored.
pub struct InputFrame<'a> {
    input: &'a dyn VideoInput,
    image: Option<RawImage>,
    image2: Option<RawImage>,
    got: bool,
    done: bool,
    done2: bool,
}

impl<'a> InputFrame<'a> {
    pub fn new(input: &'a dyn VideoInput) -> Self {
        Self {
            input,
            image: None,
            image2: None,
            got: false,
            done: false,
            done2: false,
        }
    }

    /// Fetches the frame on first call, blocking until one is ready.
    pub fn get(&mut self) -> Result<&RawImage> {
        if self.done {
            return Err(Error::format("frame already returned"));
        }
        if self.image.is_none() {
            self.got = true;
            self.image = Some(self.input.get()?);
        }
        self.image
            .as_ref()
            .ok_or_else(|| Error::format("frame unavailable"))
    }

    /// Returns the frame to the input. Fetches it first if needed.
    pub fn done(&mut self) -> Result<()> {
        if self.done {
            return Err(Error::format("frame already returned"));
        }
        self.get()?;
        self.done = true;
        match self.image.as_mut() {
            Some(img) => self.input.done(img),
            None => Ok(()),
        }
    }

    pub fn has_scaled_image(&self) -> bool {
        self.input.has_scaled_image()
    }

    /// Scaled companion of this frame
    pub fn get2(&mut self) -> Result<&RawImage> {
        if self.done2 {
            return Err(Error::format("scaled frame already returned"));
        }
        if self.image2.is_none() {
            self.get()?;
            self.image2 = Some(self.input.get2()?);
        }
        self.image2
            .as_ref()
            .ok_or_else(|| Error::format("scaled frame unavailable"))
    }

    pub fn done2(&mut self) -> Result<()> {
        if self.done2 {
            return Err(Error::format("scaled frame already returned"));
        }
        self.get2()?;
        self.done2 = true;
        match self.image2.as_mut() {
            Some(img) => self.input.done2(img),
            None => Ok(()),
        }
    }

    /// The frame converted to packed RGB
    pub fn getp(&mut self) -> Result<PackedImage> {
        self.get_packed(ColorOrder::Rgb)
    }

    pub fn get_packed(&mut self, order: ColorOrder) -> Result<PackedImage> {
        self.get()?.to_packed(order)
    }

    /// File descriptor of the frame's buffer, for buffers that export one
    pub fn dma_fd(&mut self) -> Result<Option<RawFd>> {
        Ok(self.get()?.buf.as_ref().and_then(|b| b.dma_fd()))
    }
}

impl Drop for InputFrame<'_> {
    fn drop(&mut self) {
        if !self.got {
            self.got = true;
            match self.input.get() {
                Ok(img) => self.image = Some(img),
                Err(_) => return,
            }
        }
        if let (Some(img), false) = (self.image2.as_mut(), self.done2) {
            if let Err(e) = self.input.done2(img) {
                warn!("Returning scaled frame on drop failed: {e}");
            }
        }
        if let (Some(img), false) = (self.image.as_mut(), self.done) {
            if let Err(e) = self.input.done(img) {
                warn!("Returning frame on drop failed: {e}");
            }
        }
    }
}

/// One frame of a [`VideoOutput`]: a buffer to draw into, sent on drop if
/// the holder did not send it.
pub struct OutputFrame<'a> {
    output: &'a dyn VideoOutput,
    image: Option<RawImage>,
    got: bool,
    sent: bool,
}

impl<'a> OutputFrame<'a> {
    pub fn new(output: &'a dyn VideoOutput) -> Self {
        Self {
            output,
            image: None,
            got: false,
            sent: false,
        }
    }

    pub fn get(&mut self) -> Result<&RawImage> {
        if self.sent {
            return Err(Error::format("frame already sent"));
        }
        if self.image.is_none() {
            self.got = true;
            self.image = Some(self.output.get()?);
        }
        self.image
            .as_ref()
            .ok_or_else(|| Error::format("frame unavailable"))
    }

    pub fn send(&mut self) -> Result<()> {
        if self.sent {
            return Err(Error::format("frame already sent"));
        }
        self.get()?;
        self.sent = true;
        match self.image.as_mut() {
            Some(img) => self.output.send(img),
            None => Ok(()),
        }
    }

    /// Converts `img` into the frame's format and sends it.
    pub fn send_packed(&mut self, img: &PackedImage, order: ColorOrder) -> Result<()> {
        let frame = self.get()?;
        if (img.width, img.height) != (frame.width, frame.height) {
            return Err(Error::ShapeMismatch {
                expected: format!("{}x{}", frame.width, frame.height),
                got: format!("{}x{}", img.width, img.height),
            });
        }
        convert::from_packed(img, order, frame.fmt, &mut frame.pixels_mut()?)?;
        self.send()
    }
}

impl Drop for OutputFrame<'_> {
    fn drop(&mut self) {
        if self.sent {
            return;
        }
        if !self.got {
            self.got = true;
            match self.output.get() {
                Ok(img) => self.image = Some(img),
                Err(_) => return,
            }
        }
        if let Some(img) = self.image.as_mut() {
            if let Err(e) = self.output.send(img) {
                warn!("Sending frame on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::camera::Camera;
    use crate::capture::format::PixelFormat;
    use crate::capture::output::ChannelOutput;
    use crate::capture::source::PatternSource;

    fn camera() -> Camera {
        let src = PatternSource::new(8, 4, PixelFormat::Rgb24, 500.0).unwrap();
        Camera::new(Box::new(src), 3, Some((4, 2))).unwrap()
    }

    #[test]
    fn dropped_frames_return_their_buffers() {
        let cam = camera();
        cam.stream_on().unwrap();
        for i in 0..20 {
            let mut frame = InputFrame::new(&cam);
            match i % 4 {
                0 => {}
                1 => {
                    frame.get().unwrap();
                }
                2 => {
                    frame.get2().unwrap();
                }
                _ => {
                    let img = frame.getp().unwrap();
                    assert_eq!((img.width, img.height, img.channels), (8, 4, 3));
                    frame.done().unwrap();
                    assert!(frame.done().is_err());
                }
            }
        }
        cam.stream_off().unwrap();
        assert_eq!(cam.stats().queued, 0);
    }

    #[test]
    fn frame_of_stopped_input_drops_quietly() {
        let cam = camera();
        let mut frame = InputFrame::new(&cam);
        assert!(matches!(frame.get(), Err(Error::NotStreaming)));
    }

    #[test]
    fn output_frame_sends_on_drop() {
        let (out, rx) = ChannelOutput::new(2, 2, 2, PixelFormat::Rgb24).unwrap();
        out.stream_on().unwrap();
        {
            let mut frame = OutputFrame::new(&out);
            let img = PackedImage::from_vec(2, 2, 3, vec![5; 12]).unwrap();
            frame.send_packed(&img, ColorOrder::Rgb).unwrap();
        }
        {
            let _untouched = OutputFrame::new(&out);
        }
        let first = rx.recv().unwrap();
        assert_eq!(first.image().pixels().unwrap()[0], 5);
        assert!(rx.recv().is_ok());
    }
}
