use bytes::{BufMut, Bytes, BytesMut};
use std::io;

/// Wire-level transfer granularity (16 KiB).
pub const BLOCK_SIZE: u32 = 16384;

/// Upper bound on a single frame: a `piece` header plus some slack. Anything
/// larger is a protocol violation, not a frame we should buffer for.
pub const MAX_FRAME_LEN: usize = 9 + 2 * BLOCK_SIZE as usize;

/// Peer wire messages: `<4B BE length><1B id><payload>`. A zero length is a
/// keep-alive with neither id nor payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Piece index the sender has just completed and verified.
    Have(u32),
    /// Packed big-endian bits, one per piece. Size validation against the
    /// torrent's piece count happens in the session, which knows it.
    Bitfield(Bytes),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        data: Bytes,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
}

impl Message {
    pub fn encode(&self) -> BytesMut {
        match self {
            Message::KeepAlive => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(0);
                buf
            }
            Message::Choke => encode_bare(0),
            Message::Unchoke => encode_bare(1),
            Message::Interested => encode_bare(2),
            Message::NotInterested => encode_bare(3),
            Message::Have(piece_index) => {
                let mut buf = BytesMut::with_capacity(9);
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(*piece_index);
                buf
            }
            Message::Bitfield(bits) => {
                let mut buf = BytesMut::with_capacity(5 + bits.len());
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(5);
                buf.put_slice(bits);
                buf
            }
            Message::Request {
                index,
                begin,
                length,
            } => encode_block_header(6, *index, *begin, *length),
            Message::Piece { index, begin, data } => {
                let mut buf = BytesMut::with_capacity(13 + data.len());
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
                buf
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => encode_block_header(8, *index, *begin, *length),
        }
    }

    /// Decodes the first complete frame in `buf`, returning the message and
    /// the number of bytes consumed. Returns `Ok(None)` when the buffer holds
    /// only part of a frame; callers accumulate socket reads and retry, so
    /// back-to-back messages in one read and messages split across reads both
    /// work.
    pub fn decode(buf: &[u8]) -> io::Result<Option<(Self, usize)>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {} exceeds maximum {}", length, MAX_FRAME_LEN),
            ));
        }
        let total_len = 4 + length;
        if buf.len() < total_len {
            return Ok(None);
        }

        if length == 0 {
            return Ok(Some((Message::KeepAlive, 4)));
        }

        let msg_id = buf[4];
        let payload = &buf[5..total_len];

        let message = match msg_id {
            0 => expect_empty(Message::Choke, payload)?,
            1 => expect_empty(Message::Unchoke, payload)?,
            2 => expect_empty(Message::Interested, payload)?,
            3 => expect_empty(Message::NotInterested, payload)?,
            4 => {
                if payload.len() != 4 {
                    return Err(bad_payload("have", 4, payload.len()));
                }
                Message::Have(read_u32(payload, 0))
            }
            5 => Message::Bitfield(Bytes::copy_from_slice(payload)),
            6 => {
                if payload.len() != 12 {
                    return Err(bad_payload("request", 12, payload.len()));
                }
                Message::Request {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                }
            }
            7 => {
                if payload.len() < 8 {
                    return Err(bad_payload("piece", 8, payload.len()));
                }
                Message::Piece {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    data: Bytes::copy_from_slice(&payload[8..]),
                }
            }
            8 => {
                if payload.len() != 12 {
                    return Err(bad_payload("cancel", 12, payload.len()));
                }
                Message::Cancel {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                }
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown message id: {}", other),
                ));
            }
        };

        Ok(Some((message, total_len)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not-interested",
            Message::Have(_) => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request { .. } => "request",
            Message::Piece { .. } => "piece",
            Message::Cancel { .. } => "cancel",
        }
    }
}

fn encode_bare(id: u8) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u32(1);
    buf.put_u8(id);
    buf
}

fn encode_block_header(id: u8, index: u32, begin: u32, length: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(17);
    buf.put_u32(13);
    buf.put_u8(id);
    buf.put_u32(index);
    buf.put_u32(begin);
    buf.put_u32(length);
    buf
}

fn expect_empty(message: Message, payload: &[u8]) -> io::Result<Message> {
    if payload.is_empty() {
        Ok(message)
    } else {
        Err(bad_payload(message.name(), 0, payload.len()))
    }
}

fn bad_payload(name: &str, expected: usize, got: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{} payload: expected {} bytes, got {}", name, expected, got),
    )
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> usize {
        let encoded = msg.encode();
        let (decoded, consumed) = Message::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(consumed, encoded.len());
        consumed
    }

    #[test]
    fn keepalive_is_four_zero_bytes() {
        let encoded = Message::KeepAlive.encode();
        assert_eq!(&encoded[..], &[0, 0, 0, 0]);
        assert_eq!(roundtrip(Message::KeepAlive), 4);
    }

    #[test]
    fn bare_messages_roundtrip() {
        for msg in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
        ] {
            assert_eq!(roundtrip(msg), 5);
        }
    }

    #[test]
    fn have_roundtrip() {
        assert_eq!(roundtrip(Message::Have(42)), 9);
    }

    #[test]
    fn bitfield_roundtrip() {
        let msg = Message::Bitfield(Bytes::from_static(&[0xFF, 0xAA, 0x55]));
        assert_eq!(roundtrip(msg), 4 + 1 + 3);
    }

    #[test]
    fn request_and_cancel_roundtrip() {
        let req = Message::Request {
            index: 10,
            begin: BLOCK_SIZE,
            length: BLOCK_SIZE,
        };
        assert_eq!(roundtrip(req), 17);
        let cancel = Message::Cancel {
            index: 7,
            begin: 2 * BLOCK_SIZE,
            length: BLOCK_SIZE,
        };
        assert_eq!(roundtrip(cancel), 17);
    }

    #[test]
    fn piece_roundtrip() {
        let msg = Message::Piece {
            index: 5,
            begin: 0,
            data: Bytes::from(vec![1u8; 100]),
        };
        assert_eq!(roundtrip(msg), 4 + 9 + 100);
    }

    #[test]
    fn partial_frame_defers() {
        let encoded = Message::Have(123).encode();
        for cut in 0..encoded.len() {
            assert!(Message::decode(&encoded[..cut]).unwrap().is_none());
        }
        assert!(Message::decode(&encoded).unwrap().is_some());
    }

    #[test]
    fn back_to_back_frames_in_one_buffer() {
        let mut stream = BytesMut::new();
        let msgs = vec![
            Message::Unchoke,
            Message::Have(3),
            Message::KeepAlive,
            Message::Request {
                index: 0,
                begin: 0,
                length: BLOCK_SIZE,
            },
        ];
        for m in &msgs {
            stream.extend_from_slice(&m.encode());
        }

        let mut offset = 0;
        let mut decoded = Vec::new();
        while let Some((msg, consumed)) = Message::decode(&stream[offset..]).unwrap() {
            decoded.push(msg);
            offset += consumed;
        }
        assert_eq!(decoded, msgs);
        assert_eq!(offset, stream.len());
    }

    #[test]
    fn unknown_id_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(9); // DHT port, not part of the core set
        assert!(Message::decode(&buf).is_err());
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(Message::decode(&buf).is_err());
    }

    #[test]
    fn mis_sized_payload_rejected() {
        // A `have` whose length prefix claims 6 bytes (id + 5 payload bytes).
        let mut buf = BytesMut::new();
        buf.put_u32(6);
        buf.put_u8(4);
        buf.put_slice(&[0, 0, 0, 1, 0]);
        assert!(Message::decode(&buf).is_err());
    }
}
