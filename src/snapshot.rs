//! Interval snapshot worker and retention engine.
//!
//! Independent of the HTTP streams: every `interval` seconds the worker
//! reads a frame, optionally runs lightweight frame differencing against the
//! previous capture, annotates and timestamps it, keeps the encoded bytes in
//! an in-memory latest slot for the gallery APIs, and writes the file to the
//! snapshot directory. Every 10 captures the directory is pruned by count
//! and age. The worker also accepts event-driven saves from the motion
//! stream, deduplicated against its own saves within one cooldown window.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::capture::CameraStream;
use crate::config::{SettingsStore, SnapshotSettings};
use crate::encode::encode_jpeg_bgr;
use crate::motion::{Algorithm, MotionAnalyzer, MotionParams};
use crate::overlay::Overlay;

const PRUNE_EVERY_CAPTURES: u32 = 10;
const IDLE_TICK: Duration = Duration::from_millis(500);
const NO_FRAME_SLEEP: Duration = Duration::from_secs(1);

/// One on-disk snapshot, described entirely by its file. There is no
/// separate index.
#[derive(Clone, Debug, Serialize)]
pub struct SnapshotEntry {
    pub filename: String,
    pub timestamp: f64,
    pub size: u64,
    pub motion_detected: bool,
    pub motion_area: u64,
    pub url: String,
}

struct SnapState {
    running: AtomicBool,
    latest: Mutex<Option<Arc<Vec<u8>>>>,
    last_saved: Mutex<Option<Instant>>,
}

/// Interval-based snapshot capture worker.
pub struct SnapshotWorker {
    settings: Arc<SettingsStore>,
    camera: Arc<CameraStream>,
    overlay: Arc<Overlay>,
    shared: Arc<SnapState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotWorker {
    pub fn new(
        settings: Arc<SettingsStore>,
        camera: Arc<CameraStream>,
        overlay: Arc<Overlay>,
    ) -> Self {
        Self {
            settings,
            camera,
            overlay,
            shared: Arc::new(SnapState {
                running: AtomicBool::new(false),
                latest: Mutex::new(None),
                last_saved: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Launch the capture loop. Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let settings = self.settings.clone();
        let camera = self.camera.clone();
        let overlay = self.overlay.clone();
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("snapshot-worker".to_string())
            .spawn(move || run(&settings, &camera, &overlay, &shared))
            .expect("spawn snapshot worker");
        *lock_thread(&self.thread) = Some(handle);
        log::info!("snapshot worker started (interval capture mode)");
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock_thread(&self.thread).take() {
            if handle.join().is_err() {
                log::error!("snapshot worker thread panicked");
            }
        }
    }

    /// Most recent encoded snapshot, for the gallery APIs.
    pub fn get_latest(&self) -> Option<Arc<Vec<u8>>> {
        lock(&self.shared.latest).clone()
    }

    /// Resolved snapshot directory; created on demand.
    pub fn snapshots_dir(&self) -> Result<PathBuf> {
        resolve_dir(&self.settings.snapshots())
    }

    /// Event-driven save from the motion stream. Refused inside one cooldown
    /// window of any previous save (interval or event) so near-simultaneous
    /// triggers produce a single file.
    pub fn save_event_snapshot(&self, jpeg: &[u8], area: u64) -> Result<bool> {
        let snaps = self.settings.snapshots();
        {
            let mut last = lock(&self.shared.last_saved);
            if let Some(at) = *last {
                if at.elapsed() < Duration::from_secs(snaps.cooldown) {
                    return Ok(false);
                }
            }
            *last = Some(Instant::now());
        }
        let dir = resolve_dir(&snaps)?;
        let filename = snapshot_filename(Local::now(), true, area);
        std::fs::write(dir.join(&filename), jpeg)
            .with_context(|| format!("write snapshot {filename}"))?;
        *lock(&self.shared.latest) = Some(Arc::new(jpeg.to_vec()));
        log::info!("motion snapshot saved: {filename}");
        Ok(true)
    }
}

impl Drop for SnapshotWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_thread(slot: &Mutex<Option<JoinHandle<()>>>) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    lock(slot)
}

fn run(
    settings: &SettingsStore,
    camera: &CameraStream,
    overlay: &Overlay,
    shared: &SnapState,
) {
    // The sampler always uses the lightweight differencing variant,
    // regardless of the stream analyzer's configured algorithm.
    let mut analyzer = MotionAnalyzer::new(Algorithm::FrameDiff);
    let mut last_capture: Option<Instant> = None;
    let mut captures_since_prune = 0u32;

    while shared.running.load(Ordering::SeqCst) {
        let snaps = settings.snapshots();
        let interval = Duration::from_secs(SnapshotSettings::clamp_interval(snaps.interval));
        if let Some(at) = last_capture {
            if at.elapsed() < interval {
                std::thread::sleep(IDLE_TICK);
                continue;
            }
        }

        let Some(mut frame) = camera.get_frame() else {
            std::thread::sleep(NO_FRAME_SLEEP);
            continue;
        };

        let mut motion = false;
        let mut area = 0u64;
        if snaps.motion_detection {
            let params = MotionParams::from(&settings.motion());
            let result = analyzer.analyze(&frame, &params);
            motion = result.motion;
            area = result.total_area_px;
            overlay.draw_motion(&mut frame, motion, result.bbox.as_ref());
        }
        overlay.stamp_timestamp(&mut frame);

        let jpeg = encode_jpeg_bgr(&frame, settings.stream().quality);
        *lock(&shared.latest) = Some(Arc::new(jpeg.clone()));

        match resolve_dir(&snaps) {
            Ok(dir) => {
                let filename = snapshot_filename(Local::now(), motion, area);
                match std::fs::write(dir.join(&filename), &jpeg) {
                    Ok(()) => {
                        log::info!("snapshot saved: {filename}");
                        *lock(&shared.last_saved) = Some(Instant::now());
                    }
                    Err(err) => log::error!("failed to save snapshot {filename}: {err}"),
                }
                captures_since_prune += 1;
                if captures_since_prune >= PRUNE_EVERY_CAPTURES {
                    captures_since_prune = 0;
                    if let Err(err) =
                        prune_snapshots(&dir, snaps.retention_count, snaps.retention_days)
                    {
                        log::error!("snapshot pruning failed: {err}");
                    }
                }
            }
            Err(err) => log::error!("snapshot directory unavailable: {err}"),
        }
        last_capture = Some(Instant::now());
    }
}

fn resolve_dir(snaps: &SnapshotSettings) -> Result<PathBuf> {
    let dir = PathBuf::from(&snaps.directory);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create snapshot directory {}", dir.display()))?;
    Ok(dir)
}

pub fn snapshot_filename(now: DateTime<Local>, motion: bool, area: u64) -> String {
    let stamp = now.format("%Y-%m-%d_%H-%M-%S");
    if motion {
        format!("{stamp}_motion_{area}px.jpg")
    } else {
        format!("{stamp}_snapshot.jpg")
    }
}

fn is_jpeg_name(name: &str) -> bool {
    name.ends_with(".jpg") || name.ends_with(".jpeg")
}

/// Parse the motion flag and area back out of a snapshot filename.
fn parse_motion_area(filename: &str) -> (bool, u64) {
    match filename.split_once("_motion_") {
        Some((_, rest)) => {
            let area = rest
                .trim_end_matches(".jpeg")
                .trim_end_matches(".jpg")
                .trim_end_matches("px")
                .parse()
                .unwrap_or(0);
            (true, area)
        }
        None => (false, 0),
    }
}

/// All snapshots in the directory, newest first.
pub fn list_snapshots(dir: &Path) -> Result<Vec<SnapshotEntry>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("read snapshot directory {}", dir.display()))?
    {
        let entry = entry?;
        let Ok(filename) = entry.file_name().into_string() else {
            continue;
        };
        if !is_jpeg_name(&filename) {
            continue;
        }
        let meta = entry.metadata()?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let (motion_detected, motion_area) = parse_motion_area(&filename);
        entries.push(SnapshotEntry {
            url: format!("/api/snapshots/image/{filename}"),
            filename,
            timestamp: mtime,
            size: meta.len(),
            motion_detected,
            motion_area,
        });
    }
    entries.sort_by(|a, b| b.timestamp.total_cmp(&a.timestamp));
    Ok(entries)
}

/// Apply both retention bounds: keep the newest `retention_count` files, and
/// within that kept set drop anything older than `retention_days`. Failures
/// on individual files are logged and do not abort the pass.
pub fn prune_snapshots(dir: &Path, retention_count: usize, retention_days: u64) -> Result<()> {
    let mut files: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("read snapshot directory {}", dir.display()))?
    {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !is_jpeg_name(&name) {
            continue;
        }
        let mtime = entry.metadata()?.modified()?;
        files.push((entry.path(), mtime));
    }
    files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in files.iter().skip(retention_count) {
        match std::fs::remove_file(path) {
            Ok(()) => log::debug!("removed old snapshot (count limit): {}", path.display()),
            Err(err) => log::error!("failed to remove snapshot {}: {err}", path.display()),
        }
    }

    let now = SystemTime::now();
    let max_age = Duration::from_secs(retention_days * 86_400);
    for (path, mtime) in files.iter().take(retention_count) {
        let age = now.duration_since(*mtime).unwrap_or_default();
        if age > max_age {
            match std::fs::remove_file(path) {
                Ok(()) => log::debug!("removed old snapshot (age limit): {}", path.display()),
                Err(err) => log::error!("failed to remove snapshot {}: {err}", path.display()),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs::{File, FileTimes};
    use tempfile::tempdir;

    fn touch_with_age(dir: &Path, name: &str, age: Duration) {
        let path = dir.join(name);
        std::fs::write(&path, b"\xFF\xD8\xFF\xD9").expect("write file");
        let mtime = SystemTime::now() - age;
        File::options()
            .write(true)
            .open(&path)
            .expect("open file")
            .set_times(FileTimes::new().set_modified(mtime))
            .expect("set mtime");
    }

    #[test]
    fn filenames_encode_motion_state() {
        let at = Local.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        assert_eq!(
            snapshot_filename(at, true, 4210),
            "2026-03-14_15-09-26_motion_4210px.jpg"
        );
        assert_eq!(
            snapshot_filename(at, false, 0),
            "2026-03-14_15-09-26_snapshot.jpg"
        );
    }

    #[test]
    fn motion_area_round_trips_through_the_filename() {
        let (motion, area) = parse_motion_area("2026-03-14_15-09-26_motion_4210px.jpg");
        assert!(motion);
        assert_eq!(area, 4210);
        let (motion, area) = parse_motion_area("2026-03-14_15-09-26_snapshot.jpg");
        assert!(!motion);
        assert_eq!(area, 0);
    }

    #[test]
    fn prune_enforces_count_then_age() -> Result<()> {
        let dir = tempdir()?;
        // Five files: two fresh, two a day old, one ancient.
        touch_with_age(dir.path(), "a.jpg", Duration::from_secs(10));
        touch_with_age(dir.path(), "b.jpg", Duration::from_secs(20));
        touch_with_age(dir.path(), "c.jpg", Duration::from_secs(86_400));
        touch_with_age(dir.path(), "d.jpg", Duration::from_secs(86_500));
        touch_with_age(dir.path(), "e.jpg", Duration::from_secs(40 * 86_400));

        prune_snapshots(dir.path(), 3, 7)?;

        let mut left: Vec<String> = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        left.sort();
        // Count bound keeps the newest three; the ancient file was already
        // beyond the count bound.
        assert_eq!(left, vec!["a.jpg", "b.jpg", "c.jpg"]);

        // Age bound applies inside the kept set too.
        prune_snapshots(dir.path(), 10, 1)?;
        let mut left: Vec<String> = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        left.sort();
        assert_eq!(left, vec!["a.jpg", "b.jpg", "c.jpg"]);

        prune_snapshots(dir.path(), 10, 0)?;
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn list_is_sorted_newest_first_and_skips_non_jpegs() -> Result<()> {
        let dir = tempdir()?;
        touch_with_age(dir.path(), "old_snapshot.jpg", Duration::from_secs(100));
        touch_with_age(dir.path(), "new_motion_42px.jpg", Duration::from_secs(1));
        std::fs::write(dir.path().join("notes.txt"), b"not a jpeg")?;

        let entries = list_snapshots(dir.path())?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].filename, "new_motion_42px.jpg");
        assert!(entries[0].motion_detected);
        assert_eq!(entries[0].motion_area, 42);
        assert_eq!(entries[0].url, "/api/snapshots/image/new_motion_42px.jpg");
        assert!(!entries[1].motion_detected);
        Ok(())
    }

    #[test]
    fn event_saves_honor_the_cooldown_window() -> Result<()> {
        let dir = tempdir()?;
        let config_path = dir.path().join("config.json");
        let snap_dir = dir.path().join("snaps");
        std::fs::write(
            &config_path,
            format!(
                r#"{{"snapshots": {{"directory": {:?}, "cooldown": 30}}}}"#,
                snap_dir.to_string_lossy()
            ),
        )?;
        let settings = Arc::new(SettingsStore::open(&config_path)?);
        let camera = Arc::new(CameraStream::new(crate::capture::CameraConfig::placeholder(
            64, 48, 30,
        )));
        let worker = SnapshotWorker::new(settings, camera, Arc::new(Overlay::without_font()));

        assert!(worker.save_event_snapshot(&[0xFF, 0xD8, 0xFF, 0xD9], 2000)?);
        // Second trigger inside the window is deduplicated.
        assert!(!worker.save_event_snapshot(&[0xFF, 0xD8, 0xFF, 0xD9], 2100)?);
        assert_eq!(list_snapshots(&snap_dir)?.len(), 1);
        assert!(worker.get_latest().is_some());
        Ok(())
    }
}
