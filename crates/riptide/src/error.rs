use thiserror::Error;

use crate::bencode;
use crate::metainfo::MetainfoError;
use crate::storage::StorageError;

/// Crate-level error taxonomy. Peer-task failures never abort the process;
/// they route the connection to the session quit channel. Metadata parse,
/// initial announce, and storage-creation failures are fatal at session
/// start.
#[derive(Debug, Error)]
pub enum RiptideError {
    #[error("metadata: {0}")]
    Metainfo(#[from] MetainfoError),
    #[error("bencode: {0}")]
    Bencode(#[from] bencode::ParseError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("handshake: {0}")]
    Handshake(#[from] riptide_proto::HandshakeError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("tracker failure: {0}")]
    TrackerFailure(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("peer protocol violation: {0}")]
    PeerProtocol(String),
}

impl RiptideError {
    pub fn info_hash_mismatch(expected: [u8; 20], received: [u8; 20]) -> Self {
        Self::PeerProtocol(format!(
            "info-hash mismatch expected={} received={}",
            hex::encode(expected),
            hex::encode(received)
        ))
    }
}
