use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

/// Speeds below this are considered noise and dropped by the decay tick.
const MIN_SPEED: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy)]
struct PeerRate {
    /// Bytes accumulated since the last speed sample.
    bytes: u64,
    speed: f64,
    last_sample: Instant,
}

#[derive(Debug, Default)]
struct Lane {
    peers: HashMap<String, PeerRate>,
    total_speed: f64,
}

/// Per-peer upload/download byte counters and decayed speed estimates.
///
/// Every socket read or write records its byte count here; once at least
/// `sampling_window` has passed for a peer, the accumulator converts into a
/// speed sample. A periodic tick decays speeds of peers that went quiet and
/// recomputes the per-direction totals.
#[derive(Debug)]
pub struct RateTracker {
    upload: RwLock<Lane>,
    download: RwLock<Lane>,
    sampling_window: Duration,
    decay_factor: f64,
}

impl RateTracker {
    pub fn new(sampling_window: Duration, decay_factor: f64) -> Self {
        Self {
            upload: RwLock::new(Lane::default()),
            download: RwLock::new(Lane::default()),
            sampling_window,
            decay_factor,
        }
    }

    pub fn record(&self, direction: Direction, peer: &str, bytes: usize) {
        self.record_at(direction, peer, bytes, Instant::now())
    }

    /// Decays idle speeds and refreshes the totals. Driven by the session's
    /// one-second ticker.
    pub fn tick(&self) {
        self.tick_at(Instant::now())
    }

    pub fn speed(&self, direction: Direction, peer: &str) -> f64 {
        let lane = self.lane(direction).read().unwrap();
        lane.peers.get(peer).map(|r| r.speed).unwrap_or(0.0)
    }

    pub fn total_speed(&self, direction: Direction) -> f64 {
        self.lane(direction).read().unwrap().total_speed
    }

    pub fn remove_peer(&self, peer: &str) {
        self.upload.write().unwrap().peers.remove(peer);
        self.download.write().unwrap().peers.remove(peer);
    }

    fn lane(&self, direction: Direction) -> &RwLock<Lane> {
        match direction {
            Direction::Upload => &self.upload,
            Direction::Download => &self.download,
        }
    }

    fn record_at(&self, direction: Direction, peer: &str, bytes: usize, now: Instant) {
        let mut lane = self.lane(direction).write().unwrap();
        let rate = lane.peers.entry(peer.to_string()).or_insert(PeerRate {
            bytes: 0,
            speed: 0.0,
            last_sample: now,
        });
        rate.bytes += bytes as u64;

        let elapsed = now.duration_since(rate.last_sample);
        if elapsed >= self.sampling_window {
            rate.speed = rate.bytes as f64 / elapsed.as_secs_f64();
            rate.bytes = 0;
            rate.last_sample = now;
        }
    }

    fn tick_at(&self, now: Instant) {
        for direction in [Direction::Upload, Direction::Download] {
            let mut lane = self.lane(direction).write().unwrap();
            let window = self.sampling_window;
            let decay = self.decay_factor;
            lane.peers.retain(|_, rate| {
                if now.duration_since(rate.last_sample) > window {
                    rate.speed *= decay;
                }
                rate.speed >= MIN_SPEED || rate.bytes > 0
            });
            lane.total_speed = lane.peers.values().map(|r| r.speed).sum();
            debug!(
                ?direction,
                total_speed = lane.total_speed,
                peers = lane.peers.len(),
                "rate tick"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> RateTracker {
        RateTracker::new(Duration::from_millis(10), 0.4)
    }

    #[test]
    fn accumulates_until_window_elapses() {
        let rt = tracker();
        let start = Instant::now();
        rt.record_at(Direction::Download, "peer-a", 500, start);
        // Within the window: no sample yet.
        rt.record_at(
            Direction::Download,
            "peer-a",
            500,
            start + Duration::from_millis(5),
        );
        assert_eq!(rt.speed(Direction::Download, "peer-a"), 0.0);

        // Past the window: 1500 bytes over 20 ms.
        rt.record_at(
            Direction::Download,
            "peer-a",
            500,
            start + Duration::from_millis(20),
        );
        let speed = rt.speed(Direction::Download, "peer-a");
        assert!((speed - 75_000.0).abs() < 1.0, "speed was {}", speed);
    }

    #[test]
    fn directions_are_independent() {
        let rt = tracker();
        let start = Instant::now();
        rt.record_at(Direction::Upload, "peer-a", 100, start);
        rt.record_at(
            Direction::Upload,
            "peer-a",
            0,
            start + Duration::from_millis(20),
        );
        assert!(rt.speed(Direction::Upload, "peer-a") > 0.0);
        assert_eq!(rt.speed(Direction::Download, "peer-a"), 0.0);
    }

    #[test]
    fn tick_decays_idle_speeds_and_totals() {
        let rt = tracker();
        let start = Instant::now();
        rt.record_at(Direction::Download, "peer-a", 1000, start);
        rt.record_at(
            Direction::Download,
            "peer-a",
            1000,
            start + Duration::from_millis(20),
        );
        let before = rt.speed(Direction::Download, "peer-a");
        assert!(before > 0.0);

        rt.tick_at(start + Duration::from_millis(100));
        let after = rt.speed(Direction::Download, "peer-a");
        assert!((after - before * 0.4).abs() < 1e-6);
        assert!((rt.total_speed(Direction::Download) - after).abs() < 1e-6);
    }

    #[test]
    fn negligible_speeds_are_dropped() {
        let rt = tracker();
        let start = Instant::now();
        rt.record_at(Direction::Download, "peer-a", 1000, start);
        rt.record_at(
            Direction::Download,
            "peer-a",
            1000,
            start + Duration::from_millis(20),
        );
        // Enough decay rounds to push any speed under the floor.
        let mut now = start + Duration::from_millis(100);
        for _ in 0..40 {
            rt.tick_at(now);
            now += Duration::from_secs(1);
        }
        assert_eq!(rt.speed(Direction::Download, "peer-a"), 0.0);
        assert_eq!(rt.total_speed(Direction::Download), 0.0);
    }

    #[test]
    fn remove_peer_clears_both_directions() {
        let rt = tracker();
        let start = Instant::now();
        rt.record_at(Direction::Download, "peer-a", 1000, start);
        rt.record_at(Direction::Upload, "peer-a", 1000, start);
        rt.remove_peer("peer-a");
        rt.tick_at(start + Duration::from_secs(1));
        assert_eq!(rt.total_speed(Direction::Download), 0.0);
        assert_eq!(rt.total_speed(Direction::Upload), 0.0);
    }
}
