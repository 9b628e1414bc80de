use std::path::PathBuf;
use std::time::Duration;

/// Session tunables. The defaults are what the client ships with; the CLI
/// only overrides the listener port and download directory.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Port advertised to the tracker for inbound connections.
    pub listener_port: u16,
    /// Outbound TCP dial timeout.
    pub tcp_dial_timeout: Duration,
    /// Writer idle threshold before a keep-alive frame is sent.
    pub keep_alive_interval: Duration,
    /// Timeout for a single tracker HTTP request.
    pub tracker_timeout: Duration,
    /// Cap for the tracker retry backoff; reaching it abandons the attempt.
    pub tracker_max_backoff: Duration,
    /// A response with fewer peers than this counts as a failed query.
    pub tracker_min_peers: usize,
    /// Minimum elapsed time between per-peer speed samples.
    pub rate_sampling_window: Duration,
    /// Per-tick decay applied to idle per-peer speeds.
    pub rate_decay_factor: f64,
    /// Where the torrent's file tree is created.
    pub download_dir: PathBuf,
    /// Bound on each peer's outbound message queue.
    pub write_queue_capacity: usize,
    /// Outstanding block requests kept in flight per unchoked peer.
    pub pipeline_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listener_port: 8888,
            tcp_dial_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(120),
            tracker_timeout: Duration::from_secs(10),
            tracker_max_backoff: Duration::from_secs(60),
            tracker_min_peers: 4,
            rate_sampling_window: Duration::from_millis(10),
            rate_decay_factor: 0.4,
            download_dir: PathBuf::from("."),
            write_queue_capacity: 30,
            pipeline_depth: 5,
        }
    }
}
