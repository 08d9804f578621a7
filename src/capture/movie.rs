//! Offline playback: still images, image sequences and MJPEG files

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, info};

use super::convert::{self, ColorOrder};
use super::format::PixelFormat;
use super::source::{FrameSource, Pacer};
use crate::error::{Error, Result};
use crate::imgproc::{Interp, PackedImage};

const IMAGE_EXTS: [&str; 3] = ["png", "jpg", "jpeg"];
const MJPEG_EXTS: [&str; 2] = ["mjpg", "mjpeg"];

enum Media {
    Still(PackedImage),
    Sequence(Vec<PathBuf>),
    /// Frames of one MJPEG file, each a slice of the same allocation
    Mjpeg(Vec<Bytes>),
}

impl Media {
    fn len(&self) -> usize {
        match self {
            Self::Still(_) => 1,
            Self::Sequence(files) => files.len(),
            Self::Mjpeg(frames) => frames.len(),
        }
    }
}

/// Replays a file or directory forever, rewinding at the end. Wrap it in a
/// [`Camera`](super::camera::Camera) to get a [`VideoInput`](super::VideoInput).
pub struct MovieSource {
    path: PathBuf,
    media: Media,
    pos: usize,
    width: u32,
    height: u32,
    fmt: PixelFormat,
    fps: f32,
    pacer: Pacer,
}

fn has_ext(path: &Path, exts: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| exts.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

fn load_image(path: &Path) -> Result<PackedImage> {
    let rgb = image::open(path)?.to_rgb8();
    let (w, h) = rgb.dimensions();
    PackedImage::from_vec(w, h, 3, rgb.into_raw())
}

/// Cuts an MJPEG stream into JPEG images on SOI/EOI markers.
pub fn split_mjpeg(data: &Bytes) -> Vec<Bytes> {
    let mut frames = Vec::new();
    let mut i = 0;
    while i + 1 < data.len() {
        if data[i] == 0xff && data[i + 1] == 0xd8 {
            let mut j = i + 2;
            while j + 1 < data.len() && !(data[j] == 0xff && data[j + 1] == 0xd9) {
                j += 1;
            }
            if j + 1 >= data.len() {
                break;
            }
            frames.push(data.slice(i..j + 2));
            i = j + 2;
        } else {
            i += 1;
        }
    }
    frames
}

impl MovieSource {
    /// Opens `path`, delivering frames of `width`x`height` in `fmt`. A size of
    /// 0x0 keeps the size of the first frame.
    pub fn open(path: impl AsRef<Path>, width: u32, height: u32, fmt: PixelFormat, fps: f32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if matches!(fmt, PixelFormat::Mjpeg | PixelFormat::Srggb8) {
            return Err(Error::format(format!("movie playback cannot produce {fmt}")));
        }

        let media = if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(&path)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| has_ext(p, &IMAGE_EXTS))
                .collect();
            files.sort();
            Media::Sequence(files)
        } else if has_ext(&path, &MJPEG_EXTS) {
            let data = Bytes::from(std::fs::read(&path)?);
            Media::Mjpeg(split_mjpeg(&data))
        } else if has_ext(&path, &IMAGE_EXTS) {
            Media::Still(load_image(&path)?)
        } else {
            return Err(Error::format(format!("{}: unsupported movie file", path.display())));
        };
        if media.len() == 0 {
            return Err(Error::format(format!("{}: no frames found", path.display())));
        }
        info!("Movie {}: {} frames", path.display(), media.len());

        let mut this = Self {
            path,
            media,
            pos: 0,
            width,
            height,
            fmt,
            fps,
            pacer: Pacer::new(fps),
        };
        if width == 0 || height == 0 {
            let first = this.frame(0)?;
            this.width = first.width;
            this.height = first.height;
        }
        if fmt == PixelFormat::Yuyv && this.width % 2 != 0 {
            return Err(Error::format("YUYV needs an even width"));
        }
        Ok(this)
    }

    pub fn frames(&self) -> usize {
        self.media.len()
    }

    fn frame(&self, pos: usize) -> Result<PackedImage> {
        match &self.media {
            Media::Still(img) => Ok(img.clone()),
            Media::Sequence(files) => load_image(&files[pos]),
            Media::Mjpeg(frames) => convert::decode_jpeg(&frames[pos]),
        }
    }
}

impl FrameSource for MovieSource {
    fn format(&self) -> (u32, u32, PixelFormat) {
        (self.width, self.height, self.fmt)
    }

    fn fps(&self) -> f32 {
        self.fps
    }

    fn start(&mut self) -> Result<()> {
        self.pacer.reset();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn grab(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.pacer.wait();
        if self.pos >= self.media.len() {
            if self.media.len() > 1 {
                info!("End of input - Rewinding");
            }
            self.pos = 0;
        }
        let pos = self.pos;
        self.pos += 1;

        let img = self.frame(pos)?;
        let img = if (img.width, img.height) != (self.width, self.height) {
            debug!("{}: frame {pos} is {}x{}, resizing", self.path.display(), img.width, img.height);
            img.resize(self.width, self.height, Interp::Linear)?
        } else {
            img
        };
        convert::from_packed(&img, ColorOrder::Rgb, self.fmt, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("iris-movie-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_png(path: &Path, w: u32, h: u32, value: u8) {
        image::RgbImage::from_pixel(w, h, image::Rgb([value, value, value]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn mjpeg_stream_is_split_on_markers() {
        let data = Bytes::from_static(&[
            0x00, 0xff, 0xd8, 0x01, 0xff, 0xd9, 0xff, 0xd8, 0x02, 0x03, 0xff, 0xd9, 0xff, 0xd8, 0x04,
        ]);
        let frames = split_mjpeg(&data);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &[0xff, 0xd8, 0x01, 0xff, 0xd9]);
        assert_eq!(&frames[1][..], &[0xff, 0xd8, 0x02, 0x03, 0xff, 0xd9]);
    }

    #[test]
    fn sequence_rewinds_at_end() {
        let dir = temp_dir("seq");
        write_png(&dir.join("a.png"), 4, 2, 10);
        write_png(&dir.join("b.png"), 4, 2, 200);
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let mut movie = MovieSource::open(&dir, 0, 0, PixelFormat::Grey, 0.0).unwrap();
        assert_eq!(movie.frames(), 2);
        assert_eq!(movie.format(), (4, 2, PixelFormat::Grey));

        let mut buf = vec![0u8; 8];
        let seen: Vec<u8> = (0..5)
            .map(|_| {
                movie.grab(&mut buf).unwrap();
                buf[0]
            })
            .collect();
        assert_eq!(seen, vec![10, 200, 10, 200, 10]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn still_is_resized_to_requested_size() {
        let dir = temp_dir("still");
        let file = dir.join("still.png");
        write_png(&file, 8, 8, 77);
        let mut movie = MovieSource::open(&file, 4, 4, PixelFormat::Rgb24, 0.0).unwrap();
        let mut buf = vec![0u8; 4 * 4 * 3];
        assert_eq!(movie.grab(&mut buf).unwrap(), 48);
        assert!(buf.iter().all(|&v| v == 77));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_or_unknown_inputs_fail() {
        let dir = temp_dir("empty");
        assert!(MovieSource::open(&dir, 0, 0, PixelFormat::Rgb24, 0.0).is_err());
        assert!(MovieSource::open(dir.join("x.avi"), 4, 4, PixelFormat::Rgb24, 0.0).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
