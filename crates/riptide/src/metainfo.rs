use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::bencode::{self, Value};

/// Parsed metadata descriptor: the `.torrent` root dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Torrent {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub encoding: Option<String>,
    pub url_list: Vec<String>,
    pub info: Info,
    /// SHA-1 over the canonical re-encoding of the `info` sub-dictionary.
    pub info_hash: [u8; 20],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    SingleFile,
    MultiFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub name: String,
    pub piece_length: u64,
    pub pieces: Vec<[u8; 20]>,
    pub layout: Layout,
    /// Single-file torrents hold one entry whose path is `[name]`.
    pub files: Vec<FileEntry>,
    /// Total payload length across all files.
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub length: u64,
    pub path: Vec<String>,
}

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode: {0}")]
    Bencode(#[from] bencode::ParseError),
    #[error("metadata root is not a dictionary")]
    RootNotDict,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("field {0} has the wrong type")]
    WrongType(&'static str),
    #[error("pieces blob length {0} is not a multiple of 20")]
    BadPiecesLength(usize),
    #[error("piece length must be positive")]
    ZeroPieceLength,
    #[error("{declared} piece hashes declared, {expected} needed for {total} bytes")]
    PieceCountMismatch {
        declared: usize,
        expected: usize,
        total: u64,
    },
    #[error("negative length in file entry")]
    NegativeLength,
    #[error("empty file list")]
    EmptyFiles,
}

impl Torrent {
    /// Decodes a whole metadata file. This runs once at session start; any
    /// failure here is fatal.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let root = Value::parse(data)?;
        let dict = root.as_dict().ok_or(MetainfoError::RootNotDict)?;

        let announce = dict
            .get(b"announce")
            .ok_or(MetainfoError::MissingField("announce"))?
            .as_str()
            .ok_or(MetainfoError::WrongType("announce"))?;

        let mut announce_list = Vec::new();
        if let Some(tiers) = dict.get(b"announce-list").and_then(Value::as_list) {
            for tier in tiers {
                let urls: Vec<String> = tier
                    .as_list()
                    .unwrap_or(&[])
                    .iter()
                    .filter_map(Value::as_str)
                    .collect();
                if !urls.is_empty() {
                    announce_list.push(urls);
                }
            }
        }

        let url_list = match dict.get(b"url-list") {
            Some(Value::List(items)) => items.iter().filter_map(Value::as_str).collect(),
            Some(Value::Bytes(_)) => dict
                .get(b"url-list")
                .and_then(Value::as_str)
                .into_iter()
                .collect(),
            _ => Vec::new(),
        };

        let info_value = dict
            .get(b"info")
            .ok_or(MetainfoError::MissingField("info"))?;
        let info = Info::from_value(info_value)?;
        let info_hash = compute_info_hash(info_value);

        Ok(Self {
            announce,
            announce_list,
            creation_date: dict.get(b"creation date").and_then(Value::as_integer),
            comment: dict.get(b"comment").and_then(Value::as_str),
            created_by: dict.get(b"created by").and_then(Value::as_str),
            encoding: dict.get(b"encoding").and_then(Value::as_str),
            url_list,
            info,
            info_hash,
        })
    }
}

impl Info {
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn total_size(&self) -> u64 {
        self.length
    }

    pub fn is_single_file(&self) -> bool {
        self.layout == Layout::SingleFile
    }

    /// Length of one piece; only the last may be short.
    pub fn piece_size(&self, index: usize) -> u64 {
        debug_assert!(index < self.num_pieces());
        if index + 1 == self.num_pieces() {
            self.length - self.piece_length * (self.num_pieces() as u64 - 1)
        } else {
            self.piece_length
        }
    }

    fn from_value(value: &Value) -> Result<Self, MetainfoError> {
        let dict = value.as_dict().ok_or(MetainfoError::WrongType("info"))?;

        let name = dict
            .get(b"name")
            .ok_or(MetainfoError::MissingField("name"))?
            .as_str()
            .ok_or(MetainfoError::WrongType("name"))?;

        let piece_length = dict
            .get(b"piece length")
            .ok_or(MetainfoError::MissingField("piece length"))?
            .as_integer()
            .ok_or(MetainfoError::WrongType("piece length"))?;
        if piece_length <= 0 {
            return Err(MetainfoError::ZeroPieceLength);
        }
        let piece_length = piece_length as u64;

        let blob = dict
            .get(b"pieces")
            .ok_or(MetainfoError::MissingField("pieces"))?
            .as_bytes()
            .ok_or(MetainfoError::WrongType("pieces"))?;
        if blob.len() % 20 != 0 {
            return Err(MetainfoError::BadPiecesLength(blob.len()));
        }
        let pieces: Vec<[u8; 20]> = blob
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (layout, files) = match dict.get(b"files") {
            Some(files_value) => (Layout::MultiFile, decode_files(files_value)?),
            None => {
                let length = dict
                    .get(b"length")
                    .ok_or(MetainfoError::MissingField("length"))?
                    .as_integer()
                    .ok_or(MetainfoError::WrongType("length"))?;
                if length < 0 {
                    return Err(MetainfoError::NegativeLength);
                }
                (
                    Layout::SingleFile,
                    vec![FileEntry {
                        length: length as u64,
                        path: vec![name.clone()],
                    }],
                )
            }
        };
        if files.is_empty() {
            return Err(MetainfoError::EmptyFiles);
        }

        let length: u64 = files.iter().map(|f| f.length).sum();
        let expected = length.div_ceil(piece_length) as usize;
        if pieces.len() != expected {
            return Err(MetainfoError::PieceCountMismatch {
                declared: pieces.len(),
                expected,
                total: length,
            });
        }

        Ok(Self {
            name,
            piece_length,
            pieces,
            layout,
            files,
            length,
        })
    }
}

fn decode_files(value: &Value) -> Result<Vec<FileEntry>, MetainfoError> {
    let entries = value.as_list().ok_or(MetainfoError::WrongType("files"))?;
    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        let dict = entry
            .as_dict()
            .ok_or(MetainfoError::WrongType("files entry"))?;
        let length = dict
            .get(b"length")
            .ok_or(MetainfoError::MissingField("file length"))?
            .as_integer()
            .ok_or(MetainfoError::WrongType("file length"))?;
        if length < 0 {
            return Err(MetainfoError::NegativeLength);
        }
        let path: Vec<String> = dict
            .get(b"path")
            .ok_or(MetainfoError::MissingField("file path"))?
            .as_list()
            .ok_or(MetainfoError::WrongType("file path"))?
            .iter()
            .filter_map(Value::as_str)
            .collect();
        if path.is_empty() {
            return Err(MetainfoError::MissingField("file path"));
        }
        files.push(FileEntry {
            length: length as u64,
            path,
        });
    }
    Ok(files)
}

fn compute_info_hash(info: &Value) -> [u8; 20] {
    let mut canonical = Vec::new();
    info.encode_canonical(&mut canonical);
    let mut hasher = Sha1::new();
    hasher.update(&canonical);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: &[u8] = b"d8:announce25:http://tracker.test/annce7:comment4:test10:created by7:riptide4:infod6:lengthi100e4:name8:test.txt12:piece lengthi16384e6:pieces20:12345678901234567890ee";

    #[test]
    fn parses_single_file_torrent() {
        let torrent = Torrent::from_bytes(SINGLE).unwrap();
        assert_eq!(torrent.announce, "http://tracker.test/annce");
        assert_eq!(torrent.comment.as_deref(), Some("test"));
        assert_eq!(torrent.created_by.as_deref(), Some("riptide"));
        assert_eq!(torrent.info.name, "test.txt");
        assert_eq!(torrent.info.piece_length, 16384);
        assert_eq!(torrent.info.num_pieces(), 1);
        assert!(torrent.info.is_single_file());
        assert_eq!(torrent.info.files.len(), 1);
        assert_eq!(torrent.info.files[0].length, 100);
        assert_eq!(torrent.info.files[0].path, vec!["test.txt".to_string()]);
        assert_eq!(torrent.info.total_size(), 100);
    }

    #[test]
    fn parses_multi_file_torrent() {
        let raw = b"d8:announce9:test-host4:infod5:filesld6:lengthi50e4:pathl5:file1eed6:lengthi75e4:pathl3:dir5:file2eee4:name4:test12:piece lengthi16384e6:pieces20:12345678901234567890ee";
        let torrent = Torrent::from_bytes(raw).unwrap();
        assert!(!torrent.info.is_single_file());
        assert_eq!(torrent.info.files.len(), 2);
        assert_eq!(torrent.info.files[0].length, 50);
        assert_eq!(torrent.info.files[1].path, vec!["dir", "file2"]);
        assert_eq!(torrent.info.total_size(), 125);
    }

    #[test]
    fn info_hash_is_canonical_and_stable() {
        // The same info dict with keys shuffled must hash identically.
        let a = b"d8:announce4:http4:infod6:lengthi100e4:name4:test12:piece lengthi16384e6:pieces20:12345678901234567890ee";
        let b = b"d8:announce4:http4:infod4:name4:test6:lengthi100e12:piece lengthi16384e6:pieces20:12345678901234567890ee";
        let ta = Torrent::from_bytes(a).unwrap();
        let tb = Torrent::from_bytes(b).unwrap();
        assert_eq!(ta.info_hash, tb.info_hash);
        assert_ne!(ta.info_hash, [0u8; 20]);
    }

    #[test]
    fn last_piece_may_be_short() {
        // 100 bytes at piece length 64 is two pieces: 64 and 36.
        let raw = b"d8:announce4:http4:infod6:lengthi100e4:name4:test12:piece lengthi64e6:pieces40:1234567890123456789012345678901234567890ee";
        let torrent = Torrent::from_bytes(raw).unwrap();
        assert_eq!(torrent.info.num_pieces(), 2);
        assert_eq!(torrent.info.piece_size(0), 64);
        assert_eq!(torrent.info.piece_size(1), 36);
    }

    #[test]
    fn rejects_missing_announce() {
        let raw = b"d4:infod6:lengthi100e4:name4:test12:piece lengthi16384e6:pieces20:12345678901234567890ee";
        assert!(matches!(
            Torrent::from_bytes(raw),
            Err(MetainfoError::MissingField("announce"))
        ));
    }

    #[test]
    fn rejects_bad_pieces_blob() {
        let raw = b"d8:announce4:http4:infod6:lengthi100e4:name4:test12:piece lengthi16384e6:pieces15:123456789012345ee";
        assert!(matches!(
            Torrent::from_bytes(raw),
            Err(MetainfoError::BadPiecesLength(15))
        ));
    }

    #[test]
    fn rejects_piece_count_mismatch() {
        // 100000 bytes at 16384/piece needs 7 hashes, only 1 declared.
        let raw = b"d8:announce4:http4:infod6:lengthi100000e4:name4:test12:piece lengthi16384e6:pieces20:12345678901234567890ee";
        assert!(matches!(
            Torrent::from_bytes(raw),
            Err(MetainfoError::PieceCountMismatch { .. })
        ));
    }

    #[test]
    fn announce_list_tiers_survive() {
        let raw = b"d8:announce4:http13:announce-listll4:http5:httpsel3:udpee4:infod6:lengthi100e4:name4:test12:piece lengthi16384e6:pieces20:12345678901234567890ee";
        let torrent = Torrent::from_bytes(raw).unwrap();
        assert_eq!(
            torrent.announce_list,
            vec![
                vec!["http".to_string(), "https".to_string()],
                vec!["udp".to_string()]
            ]
        );
    }
}
