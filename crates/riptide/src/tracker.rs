use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use sha1::{Digest, Sha1};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::bencode::Value;
use crate::config::SessionConfig;
use crate::counters::Snapshot;
use crate::error::RiptideError;

/// Initial retry delay; doubles after every bad announce up to the cap.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// A peer as learned from the tracker. Compact lists carry no peer id, so
/// those get a synthetic one derived from the address; the handshake later
/// reveals the real id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerPeer {
    pub id: [u8; 20],
    pub addr: SocketAddr,
}

impl TrackerPeer {
    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub min_interval: Option<u32>,
    pub tracker_id: Option<String>,
    pub warning_message: Option<String>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub peers: Vec<TrackerPeer>,
}

impl AnnounceResponse {
    /// Seconds until the next scheduled announce: `interval`, or
    /// `min interval` when present and smaller.
    pub fn next_announce_secs(&self) -> u32 {
        match self.min_interval {
            Some(min) if min < self.interval => min,
            _ => self.interval,
        }
    }
}

/// HTTP announce client for a single torrent.
#[derive(Debug)]
pub struct TrackerClient {
    announce_url: String,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    listener_port: u16,
    http: reqwest::Client,
    min_peers: usize,
    max_backoff: Duration,
}

impl TrackerClient {
    pub fn new(
        announce_url: &str,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        config: &SessionConfig,
    ) -> Result<Self, RiptideError> {
        url::Url::parse(announce_url)
            .map_err(|e| RiptideError::TrackerFailure(format!("bad announce url: {}", e)))?;
        let http = reqwest::Client::builder()
            .timeout(config.tracker_timeout)
            .build()?;
        Ok(Self {
            announce_url: announce_url.to_string(),
            info_hash,
            peer_id,
            listener_port: config.listener_port,
            http,
            min_peers: config.tracker_min_peers,
            max_backoff: config.tracker_max_backoff,
        })
    }

    /// The announce URL with the raw hash and id percent-encoded byte by
    /// byte, plus the progress counters.
    pub fn build_url(&self, counters: Snapshot) -> String {
        let mut url = self.announce_url.clone();
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str("info_hash=");
        url.push_str(&percent_encode(&self.info_hash, NON_ALPHANUMERIC).to_string());
        url.push_str("&peer_id=");
        url.push_str(&percent_encode(&self.peer_id, NON_ALPHANUMERIC).to_string());
        url.push_str(&format!(
            "&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.listener_port, counters.uploaded, counters.downloaded, counters.left
        ));
        url
    }

    /// One announce round-trip with no retry policy.
    pub async fn announce_once(&self, counters: Snapshot) -> Result<AnnounceResponse, RiptideError> {
        let url = self.build_url(counters);
        debug!(url = %url, "querying tracker");
        let response = self.http.get(&url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        parse_announce_response(&body)
    }

    /// Announces with exponential backoff: failed queries and responses with
    /// fewer than `min_peers` peers double the delay; past the cap the
    /// attempt is abandoned.
    pub async fn announce(&self, counters: Snapshot) -> Result<AnnounceResponse, RiptideError> {
        let mut delay = BACKOFF_INITIAL;
        loop {
            match self.announce_once(counters).await {
                Ok(response) => {
                    if let Some(message) = &response.warning_message {
                        warn!(message, "tracker warning");
                    }
                    if response.peers.len() >= self.min_peers {
                        info!(
                            peers = response.peers.len(),
                            interval = response.interval,
                            "tracker announce ok"
                        );
                        return Ok(response);
                    }
                    warn!(
                        peers = response.peers.len(),
                        min = self.min_peers,
                        retry_in = ?delay,
                        "tracker returned a thin peer list"
                    );
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?delay, "tracker announce failed");
                }
            }
            if delay > self.max_backoff {
                return Err(RiptideError::Timeout("tracker query".to_string()));
            }
            sleep(delay).await;
            delay *= 2;
        }
    }
}

/// Decodes the bencoded announce body.
pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, RiptideError> {
    let root = Value::parse(body)?;
    let dict = root
        .as_dict()
        .ok_or_else(|| RiptideError::TrackerFailure("response is not a dictionary".into()))?;

    if let Some(reason) = dict.get(b"failure reason") {
        let reason = reason.as_str().unwrap_or_else(|| "unspecified".into());
        return Err(RiptideError::TrackerFailure(reason));
    }

    let peers = match dict.get(b"peers") {
        Some(Value::Bytes(compact)) => parse_compact_peers(compact)?,
        Some(Value::List(entries)) => parse_dict_peers(entries)?,
        Some(_) => {
            return Err(RiptideError::TrackerFailure(
                "peers is neither compact nor a list".into(),
            ))
        }
        None => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval: dict
            .get(b"interval")
            .and_then(Value::as_integer)
            .map(|n| n.max(0) as u32)
            .unwrap_or(1800),
        min_interval: dict
            .get(b"min interval")
            .and_then(Value::as_integer)
            .map(|n| n.max(0) as u32),
        tracker_id: dict.get(b"tracker id").and_then(Value::as_str),
        warning_message: dict.get(b"warning message").and_then(Value::as_str),
        complete: dict
            .get(b"complete")
            .and_then(Value::as_integer)
            .map(|n| n.max(0) as u32),
        incomplete: dict
            .get(b"incomplete")
            .and_then(Value::as_integer)
            .map(|n| n.max(0) as u32),
        peers,
    })
}

/// 6-byte groups: 4-byte IPv4 address + 2-byte big-endian port.
fn parse_compact_peers(compact: &[u8]) -> Result<Vec<TrackerPeer>, RiptideError> {
    if compact.len() % 6 != 0 {
        return Err(RiptideError::TrackerFailure(format!(
            "compact peer list length {} is not a multiple of 6",
            compact.len()
        )));
    }
    Ok(compact
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            let addr = SocketAddr::new(IpAddr::V4(ip), port);
            TrackerPeer {
                id: synthetic_peer_id(&addr),
                addr,
            }
        })
        .collect())
}

fn parse_dict_peers(entries: &[Value]) -> Result<Vec<TrackerPeer>, RiptideError> {
    let mut peers = Vec::with_capacity(entries.len());
    for entry in entries {
        let dict = entry
            .as_dict()
            .ok_or_else(|| RiptideError::TrackerFailure("peer entry is not a dictionary".into()))?;
        let ip: IpAddr = dict
            .get(b"ip")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RiptideError::TrackerFailure("peer entry has no usable ip".into()))?;
        let port = dict
            .get(b"port")
            .and_then(Value::as_integer)
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| RiptideError::TrackerFailure("peer entry has no usable port".into()))?;
        let addr = SocketAddr::new(ip, port);
        let id = match dict.get(b"peer id").and_then(Value::as_bytes) {
            Some(bytes) if bytes.len() == 20 => {
                let mut id = [0u8; 20];
                id.copy_from_slice(bytes);
                id
            }
            _ => synthetic_peer_id(&addr),
        };
        peers.push(TrackerPeer { id, addr });
    }
    Ok(peers)
}

/// Stand-in id for peers announced without one, stable per address.
fn synthetic_peer_id(addr: &SocketAddr) -> [u8; 20] {
    let mut hasher = Sha1::new();
    match addr.ip() {
        IpAddr::V4(ip) => hasher.update(ip.octets()),
        IpAddr::V6(ip) => hasher.update(ip.octets()),
    }
    hasher.update(addr.port().to_be_bytes());
    let mut id = [0u8; 20];
    id.copy_from_slice(&hasher.finalize());
    id
}
