//! OpenSentry
//!
//! Single-node camera surveillance service: one capture loop feeds shared
//! workers (raw scaler, motion analyzer, snapshot sampler) whose encoded
//! frames fan out to any number of HTTP streaming clients through
//! latest-wins broadcast hubs, behind a session/OAuth2 authentication gate.
//!
//! # Module structure
//!
//! - `capture`: camera device acquisition and the latest-frame slot
//! - `frame` / `encode`: BGR frames and JPEG encode/decode
//! - `motion`: background-subtraction and frame-differencing analysis
//! - `overlay`: rectangle/status/timestamp annotation
//! - `hub`: latest-wins broadcaster with condvar wakeups
//! - `workers`: the raw and motion stream producers
//! - `snapshot`: interval sampler, retention pruning, event saves
//! - `config`: persisted settings tree and the thread-safe store
//! - `auth`: sessions, PKCE, signed state, OAuth2 probe/exchange
//! - `web`: the threaded HTTP surface
//! - `logbuf` / `mdns`: log ring buffer, service advertisement

pub mod auth;
pub mod capture;
pub mod config;
pub mod encode;
pub mod frame;
pub mod hub;
pub mod logbuf;
pub mod mdns;
pub mod motion;
pub mod overlay;
pub mod snapshot;
pub mod web;
pub mod workers;

pub use capture::{CameraConfig, CameraStream};
pub use config::{Config, SettingsStore};
pub use frame::Frame;
pub use hub::Broadcaster;
pub use motion::{Algorithm, MotionAnalyzer, MotionParams, MotionResult};
pub use overlay::Overlay;
pub use snapshot::SnapshotWorker;
pub use workers::StreamWorkers;
