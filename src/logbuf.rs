//! Logging initialization with an in-memory ring buffer tee.
//!
//! Records go to stderr through the usual env_logger pipeline and, in
//! parallel, into a byte- and line-bounded ring so `/logs/download` can
//! serve recent history without touching the filesystem.

use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};
use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

const DEFAULT_MAX_BYTES: usize = 1_048_576;
const DEFAULT_MAX_LINES: usize = 10_000;

struct RingBuffer {
    lines: VecDeque<Vec<u8>>,
    bytes: usize,
    max_bytes: usize,
    max_lines: usize,
}

impl RingBuffer {
    fn new(max_bytes: usize, max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            max_bytes: max_bytes.max(1024),
            max_lines: max_lines.max(16),
        }
    }

    fn push(&mut self, line: Vec<u8>) {
        self.bytes += line.len();
        self.lines.push_back(line);
        while self.bytes > self.max_bytes || self.lines.len() > self.max_lines {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len();
            } else {
                break;
            }
        }
    }

    fn dump(&self, n: Option<usize>) -> Vec<u8> {
        let skip = match n {
            Some(n) if n > 0 && n < self.lines.len() => self.lines.len() - n,
            _ => 0,
        };
        self.lines.iter().skip(skip).flatten().copied().collect()
    }
}

static LOG_RING: OnceLock<Mutex<RingBuffer>> = OnceLock::new();

fn ring() -> &'static Mutex<RingBuffer> {
    LOG_RING.get_or_init(|| {
        let max_bytes = env_usize("OPENSENTRY_LOG_BUFFER_BYTES", DEFAULT_MAX_BYTES);
        let max_lines = env_usize("OPENSENTRY_LOG_BUFFER_LINES", DEFAULT_MAX_LINES);
        Mutex::new(RingBuffer::new(max_bytes, max_lines))
    })
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

struct TeeLogger {
    inner: env_logger::Logger,
}

impl Log for TeeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.inner.matches(record) {
            let line = format!(
                "[{}] {} {}: {}\n",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            );
            match ring().lock() {
                Ok(mut guard) => guard.push(line.into_bytes()),
                Err(poisoned) => poisoned.into_inner().push(line.into_bytes()),
            }
        }
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Install the tee logger. Filter comes from `RUST_LOG`, or
/// `OPENSENTRY_LOG_LEVEL`, defaulting to `info`. Safe to call more than
/// once; later calls are no-ops.
pub fn init_logging() {
    let default_level = std::env::var("OPENSENTRY_LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    let logger = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .build();
    let max_level: LevelFilter = logger.filter();
    if log::set_boxed_logger(Box::new(TeeLogger { inner: logger })).is_ok() {
        log::set_max_level(max_level);
    }
}

/// Recent log lines, optionally limited to the last `n`.
pub fn dump_logs(n: Option<usize>) -> Vec<u8> {
    match ring().lock() {
        Ok(guard) => guard.dump(n),
        Err(poisoned) => poisoned.into_inner().dump(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_by_line_count() {
        let mut ring = RingBuffer::new(1 << 20, 16);
        for i in 0..40 {
            ring.push(format!("line {i}\n").into_bytes());
        }
        assert_eq!(ring.lines.len(), 16);
        let dump = String::from_utf8(ring.dump(None)).unwrap();
        assert!(dump.starts_with("line 24"));
        assert!(dump.ends_with("line 39\n"));
    }

    #[test]
    fn ring_evicts_by_byte_bound() {
        let mut ring = RingBuffer::new(1024, 10_000);
        for i in 0..100 {
            ring.push(vec![b'x'; 100].into_iter().chain([i as u8]).collect());
        }
        assert!(ring.bytes <= 1024);
        assert!(!ring.lines.is_empty());
    }

    #[test]
    fn dump_tail_returns_last_n_lines() {
        let mut ring = RingBuffer::new(1 << 20, 1000);
        for i in 0..10 {
            ring.push(format!("{i}\n").into_bytes());
        }
        let tail = String::from_utf8(ring.dump(Some(3))).unwrap();
        assert_eq!(tail, "7\n8\n9\n");
        // n larger than the buffer returns everything.
        let all = String::from_utf8(ring.dump(Some(99))).unwrap();
        assert_eq!(all.lines().count(), 10);
    }
}
