pub mod bencode;
pub mod bitset;
pub mod config;
pub mod counters;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod piece_frequency;
pub mod rate;
pub mod session;
pub mod storage;
pub mod swarm;
pub mod tracker;
pub mod transport;

pub use bitset::Bitset;
pub use config::SessionConfig;
pub use error::RiptideError;
pub use metainfo::Torrent;
pub use session::Session;
pub use storage::Storage;
