use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// A bencoded value: byte string, integer, list, or dictionary.
///
/// Dictionaries remember insertion order so a document can be re-serialized
/// exactly as read, and can also be re-serialized in canonical (ascending
/// key byte) order, which is what info-hashing requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dict(Dict),
}

/// Insertion-ordered map from byte-string keys to values with an O(1)
/// lookup index. Duplicate keys are rejected at parse time.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    entries: Vec<(Vec<u8>, Value)>,
    index: HashMap<Vec<u8>, usize>,
}

impl PartialEq for Dict {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for Dict {}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.index.get(key).map(|&slot| &self.entries[slot].1)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    /// Inserts a key, failing if it is already present.
    pub fn insert(&mut self, key: Vec<u8>, value: Value) -> Result<(), ParseError> {
        if self.index.contains_key(&key) {
            return Err(ParseError::DuplicateKey {
                key: String::from_utf8_lossy(&key).into_owned(),
            });
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected byte 0x{byte:02x} at position {pos}")]
    BadByte { byte: u8, pos: usize },
    #[error("unexpected end of input at position {pos}")]
    UnexpectedEof { pos: usize },
    #[error("integer at position {pos} does not fit in 64 bits")]
    IntegerOverflow { pos: usize },
    #[error("integer with leading zero at position {pos}")]
    LeadingZero { pos: usize },
    #[error("negative zero at position {pos}")]
    NegativeZero { pos: usize },
    #[error("string length at position {pos} overflows")]
    LengthOverflow { pos: usize },
    #[error("dictionary key at position {pos} is not a byte string")]
    KeyNotString { pos: usize },
    #[error("duplicate dictionary key {key:?}")]
    DuplicateKey { key: String },
    #[error("trailing bytes after value at position {pos}")]
    TrailingData { pos: usize },
}

impl Value {
    /// Parses exactly one value spanning the whole input.
    pub fn parse(data: &[u8]) -> Result<Value, ParseError> {
        let mut cursor = Cursor { data, pos: 0 };
        let value = cursor.parse_value()?;
        if cursor.pos != data.len() {
            return Err(ParseError::TrailingData { pos: cursor.pos });
        }
        Ok(value)
    }

    /// Parses one value from the front of the input, returning it together
    /// with the number of bytes consumed.
    pub fn parse_prefix(data: &[u8]) -> Result<(Value, usize), ParseError> {
        let mut cursor = Cursor { data, pos: 0 };
        let value = cursor.parse_value()?;
        Ok((value, cursor.pos))
    }

    /// Serializes preserving dictionary insertion order.
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.encode_with(out, false)
    }

    /// Serializes with dictionary keys in ascending lexicographic byte
    /// order. Info-hashes are computed over this form.
    pub fn encode_canonical(&self, out: &mut Vec<u8>) {
        self.encode_with(out, true)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    fn encode_with(&self, out: &mut Vec<u8>, canonical: bool) {
        match self {
            Value::Bytes(bytes) => {
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(bytes);
            }
            Value::Integer(n) => {
                out.push(b'i');
                out.extend_from_slice(n.to_string().as_bytes());
                out.push(b'e');
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_with(out, canonical);
                }
                out.push(b'e');
            }
            Value::Dict(dict) => {
                out.push(b'd');
                if canonical {
                    let mut order: Vec<usize> = (0..dict.entries.len()).collect();
                    order.sort_by(|&a, &b| dict.entries[a].0.cmp(&dict.entries[b].0));
                    for slot in order {
                        let (key, value) = &dict.entries[slot];
                        Value::Bytes(key.clone()).encode_with(out, canonical);
                        value.encode_with(out, canonical);
                    }
                } else {
                    for (key, value) in &dict.entries {
                        Value::Bytes(key.clone()).encode_with(out, canonical);
                        value.encode_with(out, canonical);
                    }
                }
                out.push(b'e');
            }
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bytes(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            Value::Integer(n) => write!(f, "{}", n),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Dict(dict) => {
                write!(f, "{{")?;
                for (i, (key, value)) in dict.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", String::from_utf8_lossy(key), value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Result<u8, ParseError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(ParseError::UnexpectedEof { pos: self.pos })
    }

    fn bump(&mut self) -> Result<u8, ParseError> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn parse_value(&mut self) -> Result<Value, ParseError> {
        match self.peek()? {
            b'i' => self.parse_integer(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => self.parse_bytes().map(Value::Bytes),
            byte => Err(ParseError::BadByte {
                byte,
                pos: self.pos,
            }),
        }
    }

    fn parse_integer(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        self.bump()?; // 'i'
        let negative = if self.peek()? == b'-' {
            self.bump()?;
            true
        } else {
            false
        };

        let digits_start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        let digits = &self.data[digits_start..self.pos];
        if digits.is_empty() {
            let byte = self.peek()?;
            return Err(ParseError::BadByte {
                byte,
                pos: self.pos,
            });
        }
        match self.bump()? {
            b'e' => {}
            byte => {
                return Err(ParseError::BadByte {
                    byte,
                    pos: self.pos - 1,
                })
            }
        }

        if digits.len() > 1 && digits[0] == b'0' {
            return Err(ParseError::LeadingZero { pos: start });
        }
        if negative && digits == b"0" {
            return Err(ParseError::NegativeZero { pos: start });
        }

        let mut n: i64 = 0;
        for &d in digits {
            n = n
                .checked_mul(10)
                .and_then(|n| {
                    if negative {
                        n.checked_sub((d - b'0') as i64)
                    } else {
                        n.checked_add((d - b'0') as i64)
                    }
                })
                .ok_or(ParseError::IntegerOverflow { pos: start })?;
        }
        Ok(Value::Integer(n))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>, ParseError> {
        let start = self.pos;
        let mut length: usize = 0;
        while self.peek()?.is_ascii_digit() {
            let digit = (self.bump()? - b'0') as usize;
            length = length
                .checked_mul(10)
                .and_then(|l| l.checked_add(digit))
                .ok_or(ParseError::LengthOverflow { pos: start })?;
        }
        match self.bump()? {
            b':' => {}
            byte => {
                return Err(ParseError::BadByte {
                    byte,
                    pos: self.pos - 1,
                })
            }
        }
        if length > self.data.len() - self.pos {
            return Err(ParseError::UnexpectedEof {
                pos: self.data.len(),
            });
        }
        let bytes = self.data[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<Value, ParseError> {
        self.bump()?; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.bump()?; // 'e'
        Ok(Value::List(items))
    }

    fn parse_dict(&mut self) -> Result<Value, ParseError> {
        self.bump()?; // 'd'
        let mut dict = Dict::new();
        while self.peek()? != b'e' {
            let key_pos = self.pos;
            let key = match self.peek()? {
                b'0'..=b'9' => self.parse_bytes()?,
                _ => return Err(ParseError::KeyNotString { pos: key_pos }),
            };
            let value = self.parse_value()?;
            dict.insert(key, value)?;
        }
        self.bump()?; // 'e'
        Ok(Value::Dict(dict))
    }
}
