//! Camera capture source.
//!
//! One capture thread owns the device and keeps only the most recent decoded
//! frame; `get_frame` hands out defensive copies under a short-lived lock.
//!
//! Device acquisition walks four tiers in order: the explicit configured
//! path, the path for the requested index, every enumerated `/dev/video*`
//! node, then integer indices 0-5. Each candidate is tried with two format
//! preferences (MJPEG when enabled, then the device's native format), gets
//! resolution/FPS/buffer hints, and must survive 6 warm-up reads plus one
//! decoded frame to win. The capture loop never exits on I/O error: 30
//! consecutive read failures close and reacquire the device, and a device
//! that cannot be opened at all is retried every 200 ms.
//!
//! A synthetic placeholder backend (`OPENSENTRY_PLACEHOLDER=1` or a
//! `stub://` device path) serves headless deployments and tests.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::VideoSettings;
use crate::frame::Frame;

const MAX_CONSECUTIVE_READ_FAILURES: u32 = 30;
const REACQUIRE_SLEEP: Duration = Duration::from_millis(200);
#[cfg(feature = "camera-v4l2")]
const WARMUP_READS: u32 = 6;
#[cfg(any(test, feature = "camera-v4l2"))]
const MAX_PROBE_INDEX: u32 = 5;

#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub device: String,
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub mjpeg: bool,
    pub placeholder: bool,
}

impl CameraConfig {
    /// Build from the video settings section; the placeholder flag comes
    /// from the environment, read once here.
    pub fn from_settings(video: &VideoSettings) -> Self {
        let placeholder = std::env::var("OPENSENTRY_PLACEHOLDER")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE"))
            .unwrap_or(false)
            || video.device.starts_with("stub://");
        Self {
            device: video.device.clone(),
            index: video.index,
            width: video.width,
            height: video.height,
            fps: video.fps.max(1),
            mjpeg: video.mjpeg,
            placeholder,
        }
    }

    pub fn placeholder(width: u32, height: u32, fps: u32) -> Self {
        Self {
            device: "stub://placeholder".to_string(),
            index: 0,
            width,
            height,
            fps: fps.max(1),
            mjpeg: false,
            placeholder: true,
        }
    }
}

struct CamShared {
    frame: Mutex<Option<Frame>>,
    running: AtomicBool,
}

/// Threaded camera capture with a single latest-frame slot.
pub struct CameraStream {
    config: CameraConfig,
    shared: Arc<CamShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CameraStream {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            shared: Arc::new(CamShared {
                frame: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Launch the capture loop. Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        let config = self.config.clone();
        let handle = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || capture_loop(&config, &shared))
            .expect("spawn capture thread");
        *lock_thread(&self.thread) = Some(handle);
    }

    /// Defensive copy of the most recent frame, or `None` before first decode.
    pub fn get_frame(&self) -> Option<Frame> {
        match self.shared.frame.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn has_frame(&self) -> bool {
        match self.shared.frame.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Stop the loop and release the device. Idempotent.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock_thread(&self.thread).take() {
            if handle.join().is_err() {
                log::error!("camera capture thread panicked");
            }
        }
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_thread(slot: &Mutex<Option<JoinHandle<()>>>) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn capture_loop(config: &CameraConfig, shared: &CamShared) {
    let mut reported_acquire_failure = false;
    while shared.running.load(Ordering::SeqCst) {
        let mut source = match acquire(config) {
            Ok(source) => {
                reported_acquire_failure = false;
                source
            }
            Err(err) => {
                if !reported_acquire_failure {
                    log::warn!("camera acquisition failed: {err}; retrying");
                    reported_acquire_failure = true;
                }
                std::thread::sleep(REACQUIRE_SLEEP);
                continue;
            }
        };
        log::info!("camera opened: {}", source.describe());

        let mut failures = 0u32;
        while shared.running.load(Ordering::SeqCst) {
            match source.read_frame() {
                Ok(frame) => {
                    failures = 0;
                    match shared.frame.lock() {
                        Ok(mut guard) => *guard = Some(frame),
                        Err(poisoned) => *poisoned.into_inner() = Some(frame),
                    }
                }
                Err(err) => {
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_READ_FAILURES {
                        log::warn!(
                            "camera read failed {failures} times ({err}); reopening device"
                        );
                        break;
                    }
                }
            }
        }
        // Dropping the source releases the device before reacquisition.
    }
}

// ----------------------------------------------------------------------------
// Sources
// ----------------------------------------------------------------------------

enum CameraSource {
    Placeholder(PlaceholderSource),
    #[cfg(feature = "camera-v4l2")]
    V4l2(v4l2::V4l2Camera),
}

impl CameraSource {
    fn read_frame(&mut self) -> Result<Frame> {
        match self {
            Self::Placeholder(source) => source.read_frame(),
            #[cfg(feature = "camera-v4l2")]
            Self::V4l2(camera) => camera.read_frame(),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Placeholder(source) => {
                format!("placeholder {}x{}", source.width, source.height)
            }
            #[cfg(feature = "camera-v4l2")]
            Self::V4l2(camera) => camera.describe(),
        }
    }
}

fn acquire(config: &CameraConfig) -> Result<CameraSource> {
    if config.placeholder {
        return Ok(CameraSource::Placeholder(PlaceholderSource::new(config)));
    }

    #[cfg(feature = "camera-v4l2")]
    {
        for path in candidate_paths(config) {
            for prefer_mjpeg in format_preferences(config.mjpeg) {
                match v4l2::open_camera(&path, prefer_mjpeg, config) {
                    Ok(camera) => return Ok(CameraSource::V4l2(camera)),
                    Err(err) => {
                        log::debug!(
                            "camera candidate {path} (mjpeg={prefer_mjpeg}) rejected: {err}"
                        );
                    }
                }
            }
        }
        Err(anyhow!("no usable camera device found"))
    }
    #[cfg(not(feature = "camera-v4l2"))]
    {
        Err(anyhow!(
            "built without camera-v4l2; set OPENSENTRY_PLACEHOLDER=1 for synthetic frames"
        ))
    }
}

/// Four-tier candidate order; duplicates removed while preserving order.
#[cfg(any(test, feature = "camera-v4l2"))]
fn candidate_paths(config: &CameraConfig) -> Vec<String> {
    let mut candidates = Vec::new();
    if !config.device.trim().is_empty() {
        candidates.push(config.device.clone());
    }
    candidates.push(format!("/dev/video{}", config.index));
    candidates.extend(enumerate_video_devices());
    for index in 0..=MAX_PROBE_INDEX {
        candidates.push(format!("/dev/video{index}"));
    }

    let mut seen = std::collections::HashSet::new();
    candidates.retain(|path| seen.insert(path.clone()));
    candidates
}

#[cfg(any(test, feature = "camera-v4l2"))]
fn enumerate_video_devices() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/dev") else {
        return Vec::new();
    };
    let mut devices: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| {
            name.len() > 5
                && name.starts_with("video")
                && name[5..].chars().all(|c| c.is_ascii_digit())
        })
        .map(|name| format!("/dev/{name}"))
        .collect();
    devices.sort();
    devices
}

#[cfg(any(test, feature = "camera-v4l2"))]
fn format_preferences(mjpeg: bool) -> Vec<bool> {
    if mjpeg {
        vec![true, false]
    } else {
        vec![false]
    }
}

// ----------------------------------------------------------------------------
// Placeholder source
// ----------------------------------------------------------------------------

/// Synthetic frames for headless runs: a static gradient with a bright
/// square that jumps to a new position every 50 frames, so motion analysis
/// has something real to chew on between long static stretches.
struct PlaceholderSource {
    width: u32,
    height: u32,
    frame_interval: Duration,
    frame_count: u64,
    scene_state: u8,
}

impl PlaceholderSource {
    fn new(config: &CameraConfig) -> Self {
        Self {
            width: config.width.max(16),
            height: config.height.max(16),
            frame_interval: Duration::from_millis((1000 / config.fps.max(1)).max(1) as u64),
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        std::thread::sleep(self.frame_interval);
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        self.frame_count += 1;

        let (w, h) = (self.width, self.height);
        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                let g = ((x * 255 / w) as u8) / 2;
                let b = ((y * 255 / h) as u8) / 2;
                data.extend_from_slice(&[b, g, 40]);
            }
        }
        let mut frame = Frame::new(data, w, h);

        let size = (w.min(h) / 6).max(8);
        let sx = (self.scene_state as u32 * 37) % w.saturating_sub(size).max(1);
        let sy = (self.scene_state as u32 * 23) % h.saturating_sub(size).max(1);
        for y in sy..(sy + size).min(h) {
            for x in sx..(sx + size).min(w) {
                frame.put_pixel(x, y, [235, 235, 235]);
            }
        }
        Ok(frame)
    }
}

// ----------------------------------------------------------------------------
// V4L2 source
// ----------------------------------------------------------------------------

#[cfg(feature = "camera-v4l2")]
mod v4l2 {
    use super::*;
    use anyhow::Context;
    use ouroboros::self_referencing;
    use v4l::buffer::Type;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;

    const BUFFER_COUNT: u32 = 4;

    #[self_referencing]
    struct V4l2State {
        device: v4l::Device,
        #[borrows(mut device)]
        #[covariant]
        stream: v4l::prelude::MmapStream<'this, v4l::Device>,
    }

    pub(super) struct V4l2Camera {
        state: V4l2State,
        path: String,
        fourcc: [u8; 4],
        width: u32,
        height: u32,
    }

    impl V4l2Camera {
        pub(super) fn read_frame(&mut self) -> Result<Frame> {
            let (buf, _meta) = self
                .state
                .with_stream_mut(|stream| stream.next())
                .context("capture v4l2 frame")?;
            decode_buffer(buf, self.fourcc, self.width, self.height)
        }

        pub(super) fn describe(&self) -> String {
            format!(
                "{} {}x{} {}",
                self.path,
                self.width,
                self.height,
                String::from_utf8_lossy(&self.fourcc)
            )
        }
    }

    pub(super) fn open_camera(
        path: &str,
        prefer_mjpeg: bool,
        config: &CameraConfig,
    ) -> Result<V4l2Camera> {
        let device =
            v4l::Device::with_path(path).with_context(|| format!("open v4l2 device {path}"))?;

        let mut format = device.format().context("read v4l2 format")?;
        format.width = config.width;
        format.height = config.height;
        if prefer_mjpeg {
            format.fourcc = v4l::FourCC::new(b"MJPG");
        }
        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::debug!("set format on {path} failed: {err}");
                device.format().context("read v4l2 format after set failure")?
            }
        };
        let fourcc = format.fourcc.repr;
        if !matches!(&fourcc, b"MJPG" | b"RGB3" | b"YUYV") {
            return Err(anyhow!(
                "unsupported pixel format {}",
                String::from_utf8_lossy(&fourcc)
            ));
        }

        if config.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.fps);
            if let Err(err) = device.set_params(&params) {
                log::debug!("set fps on {path} failed: {err}");
            }
        }

        let (width, height) = (format.width, format.height);
        let mut camera = V4l2Camera {
            state: V4l2StateBuilder {
                device,
                stream_builder: |device| {
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
                        .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
                },
            }
            .try_build()?,
            path: path.to_string(),
            fourcc,
            width,
            height,
        };

        // Warm-up reads let auto-exposure settle; errors here are not fatal.
        for _ in 0..WARMUP_READS {
            let _ = camera.state.with_stream_mut(|stream| stream.next());
        }
        // The candidate only wins with one successfully decoded frame.
        camera.read_frame().context("decode first frame")?;
        Ok(camera)
    }

    fn decode_buffer(buf: &[u8], fourcc: [u8; 4], width: u32, height: u32) -> Result<Frame> {
        match &fourcc {
            b"MJPG" => crate::encode::decode_jpeg_bgr(buf),
            b"RGB3" => {
                let expected = (width * height * 3) as usize;
                if buf.len() < expected {
                    return Err(anyhow!("short RGB3 buffer: {} < {expected}", buf.len()));
                }
                let mut bgr = Vec::with_capacity(expected);
                for px in buf[..expected].chunks_exact(3) {
                    bgr.extend_from_slice(&[px[2], px[1], px[0]]);
                }
                Ok(Frame::new(bgr, width, height))
            }
            b"YUYV" => yuyv_to_bgr(buf, width, height),
            other => Err(anyhow!(
                "unsupported pixel format {}",
                String::from_utf8_lossy(other)
            )),
        }
    }

    fn yuyv_to_bgr(buf: &[u8], width: u32, height: u32) -> Result<Frame> {
        let expected = (width * height * 2) as usize;
        if buf.len() < expected {
            return Err(anyhow!("short YUYV buffer: {} < {expected}", buf.len()));
        }
        let mut bgr = Vec::with_capacity((width * height * 3) as usize);
        for chunk in buf[..expected].chunks_exact(4) {
            let (y0, u, y1, v) = (
                chunk[0] as f32,
                chunk[1] as f32 - 128.0,
                chunk[2] as f32,
                chunk[3] as f32 - 128.0,
            );
            for y in [y0, y1] {
                let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
                let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
                let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
                bgr.extend_from_slice(&[b, g, r]);
            }
        }
        Ok(Frame::new(bgr, width, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_stream_produces_frames() {
        let camera = CameraStream::new(CameraConfig::placeholder(160, 120, 60));
        camera.start();
        camera.start(); // idempotent

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !camera.has_frame() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let frame = camera.get_frame().expect("placeholder frame");
        assert_eq!(frame.width, 160);
        assert_eq!(frame.height, 120);
        assert_eq!(frame.data.len(), 160 * 120 * 3);

        camera.stop();
        camera.stop(); // idempotent
        assert!(!camera.is_running());
    }

    #[test]
    fn get_frame_returns_copies() {
        let camera = CameraStream::new(CameraConfig::placeholder(64, 48, 60));
        camera.start();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !camera.has_frame() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let mut a = camera.get_frame().expect("frame");
        let b = camera.get_frame().expect("frame");
        a.data[0] = a.data[0].wrapping_add(1);
        // Mutating one copy must not affect the other.
        assert_ne!(a.data[0], b.data[0]);
        camera.stop();
    }

    #[test]
    fn candidate_order_starts_with_explicit_path() {
        let config = CameraConfig {
            device: "/dev/video9".to_string(),
            index: 2,
            width: 640,
            height: 480,
            fps: 30,
            mjpeg: true,
            placeholder: false,
        };
        let candidates = candidate_paths(&config);
        assert_eq!(candidates[0], "/dev/video9");
        assert_eq!(candidates[1], "/dev/video2");
        // Probe indices 0-5 appear after enumeration, deduplicated.
        assert!(candidates.contains(&"/dev/video0".to_string()));
        assert!(candidates.contains(&"/dev/video5".to_string()));
        let unique: std::collections::HashSet<_> = candidates.iter().collect();
        assert_eq!(unique.len(), candidates.len());
    }

    #[test]
    fn mjpeg_preference_tries_both_formats() {
        assert_eq!(format_preferences(true), vec![true, false]);
        assert_eq!(format_preferences(false), vec![false]);
    }
}
