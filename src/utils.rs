use std::path::Path;

use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::PixelFormat;
use crate::error::{Error, Result};

/// Formats a detected camera may offer, most preferred first
const PREFERRED: [PixelFormat; 4] = [PixelFormat::Yuyv, PixelFormat::Mjpeg, PixelFormat::Rgb24, PixelFormat::Grey];

/// Finds the first capture device offering one of the formats we decode,
/// returning its node and the best format it offers.
pub fn auto_detect_device() -> Result<(String, PixelFormat)> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            debug!("{path} ({}) cannot capture", caps.card);
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };
        let offered: Vec<PixelFormat> = formats
            .iter()
            .filter_map(|f| PixelFormat::from_fourcc(f.fourcc.repr).ok())
            .collect();
        if let Some(fmt) = PREFERRED.into_iter().find(|p| offered.contains(p)) {
            info!("Found {fmt} device: {path} - {}", caps.card);
            return Ok((path, fmt));
        }
    }

    Err(Error::format("no suitable capture device found"))
}
