//! JPEG encoding and decoding.
//!
//! The encoder never fails outward: on any encode error it returns the
//! 4-byte minimal JPEG (SOI + EOI) so multipart streams never emit an empty
//! part. Encoder selection is process-global and decided once at startup.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat};
use std::io::Cursor;
use std::sync::OnceLock;

use crate::frame::Frame;

/// SOI + EOI: the smallest byte sequence clients accept as a JPEG part.
pub const MINIMAL_JPEG: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xD9];

static ENCODER_INIT: OnceLock<()> = OnceLock::new();

/// Select the JPEG encoder for the process. Only the portable image-crate
/// path is built in; the hook exists so an accelerated encoder can slot in
/// without touching call sites.
pub fn init_jpeg_encoder() {
    ENCODER_INIT.get_or_init(|| {
        log::info!("JPEG encoding via portable image-crate path");
    });
}

/// Encode a BGR frame to JPEG at the given quality (clamped to [1, 100]).
pub fn encode_jpeg_bgr(frame: &Frame, quality: u8) -> Vec<u8> {
    let quality = quality.clamp(1, 100);

    let mut rgb = Vec::with_capacity(frame.data.len());
    for px in frame.data.chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }

    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(Cursor::new(&mut out), quality);
    match encoder.encode(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8) {
        Ok(()) => out,
        Err(err) => {
            log::warn!("jpeg encode failed ({}x{}): {}", frame.width, frame.height, err);
            MINIMAL_JPEG.to_vec()
        }
    }
}

/// Decode a JPEG into a BGR frame. Used by the MJPEG capture path.
pub fn decode_jpeg_bgr(bytes: &[u8]) -> Result<Frame> {
    let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
        .context("decode jpeg frame")?;
    let rgb = image.into_rgb8();
    let (width, height) = rgb.dimensions();
    let raw = rgb.into_raw();
    let mut bgr = Vec::with_capacity(raw.len());
    for px in raw.chunks_exact(3) {
        bgr.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    Ok(Frame::new(bgr, width, height))
}
