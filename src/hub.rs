//! Latest-wins broadcast hub for encoded frames.
//!
//! One producer thread per named stream encodes at the configured rate and
//! stores the newest JPEG in a single slot guarded by a mutex + condvar.
//! Any number of subscribers wait on the condvar and re-emit the slot; slow
//! subscribers skip frames, they never queue them and never block the
//! producer. Memory is one encoded frame per stream regardless of
//! subscriber count.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Condvar wait timeout so subscribers can observe shutdown even when the
/// producer is stalled.
const SUBSCRIBER_WAIT: Duration = Duration::from_secs(1);

struct HubState {
    latest: Option<Arc<Vec<u8>>>,
    seq: u64,
    running: bool,
}

struct Shared {
    state: Mutex<HubState>,
    cv: Condvar,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Shared MJPEG broadcaster; centralizes encoding per stream.
pub struct Broadcaster {
    name: String,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(HubState {
                    latest: None,
                    seq: 0,
                    running: false,
                }),
                cv: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Most recent encoded frame, if any has been produced yet.
    pub fn latest(&self) -> Option<Arc<Vec<u8>>> {
        self.shared.lock().latest.clone()
    }

    /// Spawn the producer loop. Calling `start` on a running broadcaster is a
    /// no-op. `produce` returning `None` skips the tick without bumping the
    /// sequence number, so subscribers stay parked.
    pub fn start(
        &self,
        mut produce: impl FnMut() -> Option<Vec<u8>> + Send + 'static,
        fps: impl Fn() -> u32 + Send + 'static,
    ) {
        {
            let mut state = self.shared.lock();
            if state.running {
                return;
            }
            state.running = true;
        }

        let shared = self.shared.clone();
        let name = self.name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("broadcaster-{name}"))
            .spawn(move || {
                let mut next_tick = Instant::now();
                loop {
                    if !shared.lock().running {
                        break;
                    }

                    let fps = fps().max(1);
                    let period = Duration::from_secs_f64(1.0 / fps as f64);
                    let now = Instant::now();
                    if now < next_tick {
                        std::thread::sleep(period.min(next_tick - now));
                    }
                    // An over-long iteration runs the next one immediately;
                    // there is no catch-up burst.
                    next_tick = Instant::now() + period;

                    let Some(data) = produce() else {
                        continue;
                    };

                    let mut state = shared.lock();
                    if !state.running {
                        break;
                    }
                    state.latest = Some(Arc::new(data));
                    state.seq += 1;
                    shared.cv.notify_all();
                }
            })
            .expect("spawn broadcaster thread");

        *lock_thread(&self.thread) = Some(handle);
    }

    /// Stop the producer and wake every parked subscriber. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.shared.lock();
            state.running = false;
            self.shared.cv.notify_all();
        }
        if let Some(handle) = lock_thread(&self.thread).take() {
            if handle.join().is_err() {
                log::error!("broadcaster '{}' producer thread panicked", self.name);
            }
        }
    }

    /// Lazy sequence of multipart parts for one streaming client.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            shared: self.shared.clone(),
            last_seen: 0,
        }
    }
}

fn lock_thread(slot: &Mutex<Option<JoinHandle<()>>>) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Iterator over `--frame` multipart parts. Each `next()` blocks until a
/// frame newer than the last emitted one exists, or the hub stops. The hub
/// mutex is released before the part bytes are assembled, so socket writes
/// never happen under the lock.
pub struct Subscription {
    shared: Arc<Shared>,
    last_seen: u64,
}

impl Iterator for Subscription {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let (seq, data) = {
            let mut state = self.shared.lock();
            while state.running && (state.seq == self.last_seen || state.latest.is_none()) {
                let (guard, _timeout) = self
                    .shared
                    .cv
                    .wait_timeout(state, SUBSCRIBER_WAIT)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                state = guard;
            }
            if !state.running {
                return None;
            }
            (state.seq, state.latest.clone()?)
        };
        self.last_seen = seq;

        let mut part = Vec::with_capacity(data.len() + 96);
        part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
        part.extend_from_slice(data.len().to_string().as_bytes());
        part.extend_from_slice(b"\r\n\r\n");
        part.extend_from_slice(&data);
        part.extend_from_slice(b"\r\n");
        Some(part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counting_producer() -> (Arc<AtomicU64>, impl FnMut() -> Option<Vec<u8>> + Send + 'static) {
        let counter = Arc::new(AtomicU64::new(0));
        let produced = counter.clone();
        let produce = move || {
            let n = produced.fetch_add(1, Ordering::SeqCst);
            Some(n.to_string().into_bytes())
        };
        (counter, produce)
    }

    fn part_payload(part: &[u8]) -> &[u8] {
        let header_end = part
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("part header")
            + 4;
        &part[header_end..part.len() - 2]
    }

    #[test]
    fn subscriber_sees_strictly_increasing_frames() {
        let hub = Broadcaster::new("raw");
        let (_, produce) = counting_producer();
        hub.start(produce, || 200);

        let mut sub = hub.subscribe();
        let mut last: Option<u64> = None;
        for _ in 0..5 {
            let part = sub.next().expect("part");
            let n: u64 = String::from_utf8_lossy(part_payload(&part)).parse().unwrap();
            if let Some(prev) = last {
                assert!(n > prev, "frames must advance, got {} after {}", n, prev);
            }
            last = Some(n);
        }
        hub.stop();
    }

    #[test]
    fn parts_carry_the_multipart_framing() {
        let hub = Broadcaster::new("raw");
        hub.start(|| Some(vec![0xFF, 0xD8, 0xFF, 0xD9]), || 100);

        let part = hub.subscribe().next().expect("part");
        let text = String::from_utf8_lossy(&part[..64]);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4"));
        assert_eq!(part_payload(&part), &[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(&part[part.len() - 2..], b"\r\n");
        hub.stop();
    }

    #[test]
    fn stop_wakes_parked_subscribers() {
        let hub = Broadcaster::new("raw");
        // Producer never yields a frame, so subscribers stay parked.
        hub.start(|| None, || 100);

        let mut sub = hub.subscribe();
        let waiter = std::thread::spawn(move || sub.next());
        std::thread::sleep(Duration::from_millis(50));
        hub.stop();
        assert!(waiter.join().expect("join").is_none());
    }

    #[test]
    fn start_twice_is_a_noop_and_stop_twice_is_safe() {
        let hub = Broadcaster::new("raw");
        let (counter, produce) = counting_producer();
        hub.start(produce, || 100);
        // Second start must not spawn a second producer.
        hub.start(|| Some(vec![b'x']), || 100);

        let mut sub = hub.subscribe();
        sub.next().expect("part");
        hub.stop();
        hub.stop();

        let seen = counter.load(Ordering::SeqCst);
        assert!(seen > 0);
        // A late subscriber observes shutdown, not frames.
        assert!(hub.subscribe().next().is_none());
    }

    #[test]
    fn skipped_production_does_not_wake_subscribers() {
        let hub = Broadcaster::new("motion");
        hub.start(|| None, || 500);
        std::thread::sleep(Duration::from_millis(30));
        assert!(hub.latest().is_none());
        hub.stop();
    }
}
