pub mod handshake;
pub mod message;

pub use handshake::{
    Handshake, HandshakeError, HANDSHAKE_LEN, HASH_LEN, PEER_ID_LEN, PROTOCOL_STR, RESERVED_BYTES,
};

pub use message::{Message, BLOCK_SIZE, MAX_FRAME_LEN};
