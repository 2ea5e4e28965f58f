//! Persisted configuration and the thread-safe settings store.
//!
//! One JSON file holds the whole tree: `device_id` plus the
//! `motion_detection`, `snapshots`, `video`, `stream`, and `auth` sections.
//! Unknown keys at every level are captured and written back unchanged, so
//! a config edited by a newer build survives round-trips through this one.
//! Workers re-read settings at iteration boundaries; there is no change
//! notification beyond the next `snapshot()` call.

use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const DEFAULT_MIN_AREA: u32 = 500;
const DEFAULT_PAD: u32 = 10;
const DEFAULT_VAR_THRESHOLD: f64 = 16.0;
const DEFAULT_HISTORY: u32 = 500;
const DEFAULT_ALGORITHM: &str = "mog2";

const DEFAULT_SNAPSHOT_INTERVAL: u64 = 10;
const DEFAULT_RETENTION_COUNT: usize = 100;
const DEFAULT_RETENTION_DAYS: u64 = 7;
const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";
const DEFAULT_MOTION_THRESHOLD: u64 = 1500;
const DEFAULT_COOLDOWN_SECS: u64 = 30;

const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CAMERA_FPS: u32 = 30;

const DEFAULT_STREAM_MAX_WIDTH: u32 = 960;
const DEFAULT_JPEG_QUALITY: u8 = 75;
const DEFAULT_STREAM_FPS: u32 = 15;

const DEFAULT_OAUTH2_SCOPE: &str = "openid profile email offline_access";

fn default_min_area() -> u32 {
    DEFAULT_MIN_AREA
}
fn default_pad() -> u32 {
    DEFAULT_PAD
}
fn default_var_threshold() -> f64 {
    DEFAULT_VAR_THRESHOLD
}
fn default_history() -> u32 {
    DEFAULT_HISTORY
}
fn default_algorithm() -> String {
    DEFAULT_ALGORITHM.to_string()
}

/// Sensitivity parameters for the motion analyzer. `var_threshold` and
/// `history` only apply to the background-subtraction path; changing either
/// rebuilds the model on the analyzer's next iteration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MotionSettings {
    #[serde(default = "default_min_area")]
    pub min_area: u32,
    #[serde(default = "default_pad")]
    pub pad: u32,
    #[serde(default = "default_var_threshold")]
    pub var_threshold: f64,
    #[serde(default = "default_history")]
    pub history: u32,
    /// "mog2" or "frame_diff".
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            min_area: DEFAULT_MIN_AREA,
            pad: DEFAULT_PAD,
            var_threshold: DEFAULT_VAR_THRESHOLD,
            history: DEFAULT_HISTORY,
            algorithm: DEFAULT_ALGORITHM.to_string(),
            extra: Map::new(),
        }
    }
}

fn default_interval() -> u64 {
    DEFAULT_SNAPSHOT_INTERVAL
}
fn default_true() -> bool {
    true
}
fn default_retention_count() -> usize {
    DEFAULT_RETENTION_COUNT
}
fn default_retention_days() -> u64 {
    DEFAULT_RETENTION_DAYS
}
fn default_snapshot_dir() -> String {
    DEFAULT_SNAPSHOT_DIR.to_string()
}
fn default_motion_threshold() -> u64 {
    DEFAULT_MOTION_THRESHOLD
}
fn default_cooldown() -> u64 {
    DEFAULT_COOLDOWN_SECS
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SnapshotSettings {
    /// Seconds between interval captures, clamped to [5, 60].
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default = "default_true")]
    pub motion_detection: bool,
    #[serde(default = "default_retention_count")]
    pub retention_count: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// Directory for saved JPEGs, relative to the working directory unless absolute.
    #[serde(default = "default_snapshot_dir")]
    pub directory: String,
    /// Motion area (px) at which the motion worker saves an event snapshot.
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold: u64,
    /// Minimum seconds between saved snapshots, shared by the interval and
    /// event-driven paths.
    #[serde(default = "default_cooldown")]
    pub cooldown: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SNAPSHOT_INTERVAL,
            motion_detection: true,
            retention_count: DEFAULT_RETENTION_COUNT,
            retention_days: DEFAULT_RETENTION_DAYS,
            directory: DEFAULT_SNAPSHOT_DIR.to_string(),
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN_SECS,
            extra: Map::new(),
        }
    }
}

impl SnapshotSettings {
    pub fn clamp_interval(value: u64) -> u64 {
        value.clamp(5, 60)
    }

    pub fn clamp_retention_count(value: usize) -> usize {
        value.clamp(10, 1000)
    }

    pub fn clamp_retention_days(value: u64) -> u64 {
        value.clamp(1, 30)
    }
}

fn default_camera_width() -> u32 {
    DEFAULT_CAMERA_WIDTH
}
fn default_camera_height() -> u32 {
    DEFAULT_CAMERA_HEIGHT
}
fn default_camera_fps() -> u32 {
    DEFAULT_CAMERA_FPS
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VideoSettings {
    /// Explicit device path, e.g. "/dev/video0". Empty means discover.
    #[serde(default)]
    pub device: String,
    /// Preferred device index when no explicit path is set.
    #[serde(default)]
    pub index: u32,
    #[serde(default = "default_camera_width")]
    pub width: u32,
    #[serde(default = "default_camera_height")]
    pub height: u32,
    #[serde(default = "default_camera_fps")]
    pub fps: u32,
    /// Prefer the MJPEG pixel format when opening the device.
    #[serde(default = "default_true")]
    pub mjpeg: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            device: String::new(),
            index: 0,
            width: DEFAULT_CAMERA_WIDTH,
            height: DEFAULT_CAMERA_HEIGHT,
            fps: DEFAULT_CAMERA_FPS,
            mjpeg: true,
            extra: Map::new(),
        }
    }
}

fn default_stream_max_width() -> u32 {
    DEFAULT_STREAM_MAX_WIDTH
}
fn default_jpeg_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}
fn default_stream_fps() -> u32 {
    DEFAULT_STREAM_FPS
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StreamSettings {
    /// Frames wider than this are downscaled before encoding.
    #[serde(default = "default_stream_max_width")]
    pub max_width: u32,
    #[serde(default = "default_jpeg_quality")]
    pub quality: u8,
    #[serde(default = "default_stream_fps")]
    pub fps: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_STREAM_MAX_WIDTH,
            quality: DEFAULT_JPEG_QUALITY,
            fps: DEFAULT_STREAM_FPS,
            extra: Map::new(),
        }
    }
}

fn default_auth_mode() -> String {
    "local".to_string()
}
fn default_oauth2_scope() -> String {
    DEFAULT_OAUTH2_SCOPE.to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuthSettings {
    /// "local" or "oauth2".
    #[serde(default = "default_auth_mode")]
    pub auth_mode: String,
    #[serde(default)]
    pub oauth2_base_url: String,
    #[serde(default)]
    pub oauth2_client_id: String,
    #[serde(default)]
    pub oauth2_client_secret: String,
    #[serde(default = "default_oauth2_scope")]
    pub oauth2_scope: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            auth_mode: "local".to_string(),
            oauth2_base_url: String::new(),
            oauth2_client_id: String::new(),
            oauth2_client_secret: String::new(),
            oauth2_scope: DEFAULT_OAUTH2_SCOPE.to_string(),
            extra: Map::new(),
        }
    }
}

impl AuthSettings {
    /// OAuth2 is effective only when selected AND minimally configured, so a
    /// half-filled form never locks the operator out of local login.
    pub fn oauth2_effective(&self) -> bool {
        self.auth_mode.trim().eq_ignore_ascii_case("oauth2")
            && !self.oauth2_base_url.trim().is_empty()
            && !self.oauth2_client_id.trim().is_empty()
    }

    /// Blank the OAuth2 fields, as switching back to local mode does.
    pub fn clear_oauth2(&mut self) {
        self.oauth2_base_url.clear();
        self.oauth2_client_id.clear();
        self.oauth2_client_secret.clear();
        self.oauth2_scope = DEFAULT_OAUTH2_SCOPE.to_string();
    }
}

/// The persisted configuration tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Generated once on first save and never changed afterwards.
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub motion_detection: MotionSettings,
    #[serde(default)]
    pub snapshots: SnapshotSettings,
    #[serde(default)]
    pub video: VideoSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Config {
    /// Apply `OPENSENTRY_*` overrides. Called exactly once at startup; the
    /// values live in memory only and are not written back to disk unless a
    /// later settings submission persists them.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("OPENSENTRY_CAMERA_DEVICE") {
            if !device.trim().is_empty() {
                self.video.device = device;
            }
        }
        if let Ok(index) = std::env::var("OPENSENTRY_CAMERA_INDEX") {
            if !index.trim().is_empty() {
                self.video.index = index
                    .parse()
                    .map_err(|_| anyhow!("OPENSENTRY_CAMERA_INDEX must be an integer"))?;
            }
        }
        if let Ok(width) = std::env::var("OPENSENTRY_CAMERA_WIDTH") {
            if !width.trim().is_empty() {
                self.video.width = width
                    .parse()
                    .map_err(|_| anyhow!("OPENSENTRY_CAMERA_WIDTH must be an integer"))?;
            }
        }
        if let Ok(height) = std::env::var("OPENSENTRY_CAMERA_HEIGHT") {
            if !height.trim().is_empty() {
                self.video.height = height
                    .parse()
                    .map_err(|_| anyhow!("OPENSENTRY_CAMERA_HEIGHT must be an integer"))?;
            }
        }
        if let Ok(fps) = std::env::var("OPENSENTRY_CAMERA_FPS") {
            if !fps.trim().is_empty() {
                self.video.fps = fps
                    .parse()
                    .map_err(|_| anyhow!("OPENSENTRY_CAMERA_FPS must be an integer"))?;
            }
        }
        if let Ok(mjpeg) = std::env::var("OPENSENTRY_CAMERA_MJPEG") {
            if !mjpeg.trim().is_empty() {
                self.video.mjpeg = matches!(mjpeg.trim(), "1" | "true" | "TRUE");
            }
        }
        if let Ok(max_width) = std::env::var("OPENSENTRY_STREAM_MAX_WIDTH") {
            if !max_width.trim().is_empty() {
                self.stream.max_width = max_width
                    .parse()
                    .map_err(|_| anyhow!("OPENSENTRY_STREAM_MAX_WIDTH must be an integer"))?;
            }
        }
        if let Ok(quality) = std::env::var("OPENSENTRY_JPEG_QUALITY") {
            if !quality.trim().is_empty() {
                self.stream.quality = quality
                    .parse()
                    .map_err(|_| anyhow!("OPENSENTRY_JPEG_QUALITY must be an integer"))?;
            }
        }
        if let Ok(fps) = std::env::var("OPENSENTRY_STREAM_FPS") {
            if !fps.trim().is_empty() {
                self.stream.fps = fps
                    .parse()
                    .map_err(|_| anyhow!("OPENSENTRY_STREAM_FPS must be an integer"))?;
            }
        }
        if let Ok(interval) = std::env::var("OPENSENTRY_SNAPSHOT_INTERVAL") {
            if !interval.trim().is_empty() {
                let parsed: u64 = interval
                    .parse()
                    .map_err(|_| anyhow!("OPENSENTRY_SNAPSHOT_INTERVAL must be an integer"))?;
                if parsed > 0 {
                    self.snapshots.interval = SnapshotSettings::clamp_interval(parsed);
                }
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.snapshots.interval = SnapshotSettings::clamp_interval(self.snapshots.interval);
        self.snapshots.retention_count =
            SnapshotSettings::clamp_retention_count(self.snapshots.retention_count);
        self.snapshots.retention_days =
            SnapshotSettings::clamp_retention_days(self.snapshots.retention_days);
        if self.snapshots.directory.trim().is_empty() {
            self.snapshots.directory = DEFAULT_SNAPSHOT_DIR.to_string();
        }
        let mode = self.auth.auth_mode.trim().to_lowercase();
        if mode != "local" && mode != "oauth2" {
            return Err(anyhow!(
                "unsupported auth_mode '{}'; expected 'local' or 'oauth2'",
                self.auth.auth_mode
            ));
        }
        self.auth.auth_mode = mode;
        Ok(())
    }
}

fn generate_device_id() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid JSON config file {}: {}", path.display(), e))
}

/// Thread-safe settings store with atomic apply and JSON persistence.
///
/// Readers take the mutex only long enough to clone the sections they need;
/// writers mutate and persist under the same lock so the file on disk always
/// reflects a complete update.
#[derive(Debug)]
pub struct SettingsStore {
    inner: Mutex<Config>,
    path: PathBuf,
}

impl SettingsStore {
    /// Load the config file (or defaults when absent), apply env overrides,
    /// and make sure a `device_id` exists. A freshly generated id is
    /// persisted immediately so it survives restarts.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut config = if path.exists() {
            read_config_file(&path)?
        } else {
            Config::default()
        };
        config.apply_env()?;
        config.validate()?;

        let store = Self {
            inner: Mutex::new(config),
            path,
        };
        let needs_id = store.lock().device_id.trim().is_empty();
        if needs_id {
            store.update(|cfg| {
                cfg.device_id = generate_device_id();
            })?;
        }
        Ok(store)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Config> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Copy of the whole tree; the hold time is one struct clone.
    pub fn snapshot(&self) -> Config {
        self.lock().clone()
    }

    pub fn device_id(&self) -> String {
        self.lock().device_id.clone()
    }

    pub fn motion(&self) -> MotionSettings {
        self.lock().motion_detection.clone()
    }

    pub fn snapshots(&self) -> SnapshotSettings {
        self.lock().snapshots.clone()
    }

    pub fn stream(&self) -> StreamSettings {
        self.lock().stream.clone()
    }

    pub fn auth(&self) -> AuthSettings {
        self.lock().auth.clone()
    }

    pub fn video(&self) -> VideoSettings {
        self.lock().video.clone()
    }

    /// Mutate the config and persist it, all under the lock. `device_id` is
    /// restored if the mutation clobbered it.
    pub fn update(&self, apply: impl FnOnce(&mut Config)) -> Result<()> {
        let mut guard = self.lock();
        let existing_id = guard.device_id.clone();
        apply(&mut guard);
        if guard.device_id.trim().is_empty() {
            guard.device_id = existing_id;
        }
        self.persist(&guard)
    }

    /// Restore the hardcoded motion defaults, preserving unknown keys.
    pub fn reset_motion(&self) -> Result<()> {
        self.update(|cfg| {
            let extra = std::mem::take(&mut cfg.motion_detection.extra);
            cfg.motion_detection = MotionSettings {
                extra,
                ..MotionSettings::default()
            };
        })
    }

    fn persist(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create config directory {}", parent.display()))?;
            }
        }
        let payload = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, payload)
            .with_context(|| format!("write config file {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.motion_detection.min_area, 500);
        assert_eq!(cfg.motion_detection.pad, 10);
        assert_eq!(cfg.snapshots.interval, 10);
        assert_eq!(cfg.snapshots.retention_count, 100);
        assert_eq!(cfg.snapshots.retention_days, 7);
        assert_eq!(cfg.stream.max_width, 960);
        assert_eq!(cfg.stream.quality, 75);
        assert_eq!(cfg.auth.auth_mode, "local");
        assert!(!cfg.auth.oauth2_effective());
    }

    #[test]
    fn device_id_survives_reload_and_updates() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");

        let store = SettingsStore::open(&path)?;
        let id = store.device_id();
        assert_eq!(id.len(), 12);
        drop(store);

        let store = SettingsStore::open(&path)?;
        assert_eq!(store.device_id(), id);

        store.update(|cfg| {
            cfg.motion_detection.min_area = 750;
            cfg.device_id.clear();
        })?;
        assert_eq!(store.device_id(), id);
        assert_eq!(store.motion().min_area, 750);
        Ok(())
    }

    #[test]
    fn unknown_keys_pass_through_saves() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "device_id": "abc123abc123",
                "future_section": {"flag": true},
                "snapshots": {"interval": 15, "experimental": "yes"}
            }"#,
        )?;

        let store = SettingsStore::open(&path)?;
        store.update(|cfg| cfg.snapshots.interval = 20)?;
        drop(store);

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(raw["future_section"]["flag"], Value::Bool(true));
        assert_eq!(raw["snapshots"]["experimental"], Value::String("yes".into()));
        assert_eq!(raw["snapshots"]["interval"], Value::from(20));
        assert_eq!(raw["device_id"], Value::String("abc123abc123".into()));
        Ok(())
    }

    #[test]
    fn reset_motion_restores_defaults() -> Result<()> {
        let dir = tempdir()?;
        let store = SettingsStore::open(dir.path().join("config.json"))?;
        store.update(|cfg| {
            cfg.motion_detection.min_area = 9999;
            cfg.motion_detection.pad = 99;
        })?;
        store.reset_motion()?;
        let motion = store.motion();
        assert_eq!(motion.min_area, DEFAULT_MIN_AREA);
        assert_eq!(motion.pad, DEFAULT_PAD);
        Ok(())
    }

    #[test]
    fn out_of_range_values_are_clamped_on_load() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"snapshots": {"interval": 500, "retention_count": 3, "retention_days": 90}}"#,
        )?;
        let store = SettingsStore::open(&path)?;
        let snaps = store.snapshots();
        assert_eq!(snaps.interval, 60);
        assert_eq!(snaps.retention_count, 10);
        assert_eq!(snaps.retention_days, 30);
        Ok(())
    }

    #[test]
    fn invalid_auth_mode_is_rejected() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"auth": {"auth_mode": "saml"}}"#).expect("write config");
        let err = SettingsStore::open(&path).expect_err("load should fail");
        assert!(err.to_string().contains("unsupported auth_mode"));
    }

    #[test]
    fn oauth2_effective_requires_base_url_and_client_id() {
        let mut auth = AuthSettings {
            auth_mode: "oauth2".to_string(),
            ..AuthSettings::default()
        };
        assert!(!auth.oauth2_effective());
        auth.oauth2_base_url = "https://idp.example".to_string();
        assert!(!auth.oauth2_effective());
        auth.oauth2_client_id = "opensentry".to_string();
        assert!(auth.oauth2_effective());
    }
}
