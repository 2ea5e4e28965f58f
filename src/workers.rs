//! Per-stream workers feeding the broadcast hubs.
//!
//! The raw worker scales and encodes the newest camera frame; the motion
//! worker runs the analyzer, draws the overlay, and additionally exposes its
//! most recent encoded frame for the single-still snapshot API. Both honor
//! the stream FPS from settings, re-read at every iteration.

use std::sync::{Arc, Mutex};

use crate::capture::CameraStream;
use crate::config::SettingsStore;
use crate::encode::encode_jpeg_bgr;
use crate::hub::Broadcaster;
use crate::motion::{Algorithm, MotionAnalyzer, MotionParams};
use crate::overlay::Overlay;
use crate::snapshot::SnapshotWorker;

/// The two named streams plus the motion worker's latest-frame slot.
pub struct StreamWorkers {
    pub raw: Arc<Broadcaster>,
    pub motion: Arc<Broadcaster>,
    motion_latest: Arc<Mutex<Option<Arc<Vec<u8>>>>>,
}

impl StreamWorkers {
    pub fn start(
        camera: Arc<CameraStream>,
        settings: Arc<SettingsStore>,
        overlay: Arc<Overlay>,
        snapshots: Arc<SnapshotWorker>,
    ) -> Self {
        let raw = Arc::new(Broadcaster::new("raw"));
        let motion = Arc::new(Broadcaster::new("motion"));
        let motion_latest = Arc::new(Mutex::new(None));

        {
            let camera = camera.clone();
            let settings = settings.clone();
            let fps_settings = settings.clone();
            raw.start(
                move || {
                    let frame = camera.get_frame()?;
                    let stream = settings.stream();
                    let frame = frame.scaled_to_width(stream.max_width);
                    Some(encode_jpeg_bgr(&frame, stream.quality))
                },
                move || fps_settings.stream().fps,
            );
        }

        {
            let latest = motion_latest.clone();
            let fps_settings = settings.clone();
            let mut analyzer: Option<MotionAnalyzer> = None;
            motion.start(
                move || {
                    let mut frame = camera.get_frame()?;
                    let motion_cfg = settings.motion();
                    let algorithm = Algorithm::parse(&motion_cfg.algorithm);

                    // Settings may switch the algorithm at runtime; the
                    // analyzer is rebuilt, not mutated, when that happens.
                    let analyzer = match &mut analyzer {
                        Some(existing) if existing.algorithm() == algorithm => existing,
                        slot => slot.insert(MotionAnalyzer::new(algorithm)),
                    };

                    let params = MotionParams::from(&motion_cfg);
                    let result = analyzer.analyze(&frame, &params);
                    overlay.draw_motion(&mut frame, result.motion, result.bbox.as_ref());

                    let stream = settings.stream();
                    let out = frame.scaled_to_width(stream.max_width);
                    let jpeg = encode_jpeg_bgr(&out, stream.quality);

                    let snaps = settings.snapshots();
                    if result.motion && result.total_area_px >= snaps.motion_threshold {
                        if let Err(err) = snapshots.save_event_snapshot(&jpeg, result.total_area_px)
                        {
                            log::warn!("event snapshot failed: {err}");
                        }
                    }

                    match latest.lock() {
                        Ok(mut slot) => *slot = Some(Arc::new(jpeg.clone())),
                        Err(poisoned) => *poisoned.into_inner() = Some(Arc::new(jpeg.clone())),
                    }
                    Some(jpeg)
                },
                move || fps_settings.stream().fps,
            );
        }

        Self {
            raw,
            motion,
            motion_latest,
        }
    }

    /// Most recent motion-overlay frame; used by `/api/snapshot`-style
    /// single-still requests without subscribing to the stream.
    pub fn motion_latest(&self) -> Option<Arc<Vec<u8>>> {
        match self.motion_latest.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn stop(&self) {
        self.raw.stop();
        self.motion.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CameraConfig;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn start_test_workers() -> (StreamWorkers, tempfile::TempDir) {
        let dir = tempdir().expect("temp dir");
        let config_path = dir.path().join("config.json");
        let snap_dir = dir.path().join("snaps");
        std::fs::write(
            &config_path,
            format!(
                r#"{{"snapshots": {{"directory": {:?}}}, "stream": {{"fps": 60}}}}"#,
                snap_dir.to_string_lossy()
            ),
        )
        .expect("write config");

        let settings = Arc::new(SettingsStore::open(&config_path).expect("settings"));
        let camera = Arc::new(CameraStream::new(CameraConfig::placeholder(160, 120, 60)));
        camera.start();
        let overlay = Arc::new(Overlay::without_font());
        let snapshots = Arc::new(SnapshotWorker::new(
            settings.clone(),
            camera.clone(),
            overlay.clone(),
        ));
        let workers = StreamWorkers::start(camera, settings, overlay, snapshots);
        (workers, dir)
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn raw_worker_publishes_jpeg_parts() {
        let (workers, _dir) = start_test_workers();
        let mut sub = workers.raw.subscribe();
        let part = sub.next().expect("raw part");
        let payload_start = part
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("header")
            + 4;
        assert_eq!(&part[payload_start..payload_start + 2], &[0xFF, 0xD8]);
        workers.stop();
    }

    #[test]
    fn motion_worker_fills_the_latest_slot() {
        let (workers, _dir) = start_test_workers();
        assert!(wait_until(Duration::from_secs(3), || workers
            .motion_latest()
            .is_some()));
        let jpeg = workers.motion_latest().expect("latest");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        workers.stop();
    }
}
