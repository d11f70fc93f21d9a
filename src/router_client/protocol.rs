//! RouterOS API wire format.
//!
//! A sentence is a sequence of length-prefixed words terminated by an empty
//! word. Lengths use a variable 1 to 5 byte prefix.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest word accepted from a router. `/file/read` chunks stay far below it.
const MAX_WORD_LEN: usize = 16 * 1024 * 1024;

pub fn encode_length(len: usize) -> Vec<u8> {
    let len = len as u32;
    if len < 0x80 {
        vec![len as u8]
    } else if len < 0x4000 {
        let v = len | 0x8000;
        vec![(v >> 8) as u8, v as u8]
    } else if len < 0x20_0000 {
        let v = len | 0xC0_0000;
        vec![(v >> 16) as u8, (v >> 8) as u8, v as u8]
    } else if len < 0x1000_0000 {
        let v = len | 0xE000_0000;
        v.to_be_bytes().to_vec()
    } else {
        let mut out = vec![0xF0];
        out.extend_from_slice(&len.to_be_bytes());
        out
    }
}

pub async fn decode_length<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<usize> {
    let first = reader.read_u8().await?;
    let (extra, initial) = match first {
        b if b & 0x80 == 0x00 => (0, b as u32),
        b if b & 0xC0 == 0x80 => (1, (b & 0x3F) as u32),
        b if b & 0xE0 == 0xC0 => (2, (b & 0x1F) as u32),
        b if b & 0xF0 == 0xE0 => (3, (b & 0x0F) as u32),
        0xF0 => (4, 0),
        b => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unexpected control byte 0x{:02X}", b),
            ))
        }
    };

    let mut len = initial;
    for _ in 0..extra {
        len = (len << 8) | reader.read_u8().await? as u32;
    }
    Ok(len as usize)
}

pub async fn write_sentence<W, S>(writer: &mut W, words: &[S]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    S: AsRef<[u8]>,
{
    let mut buf = Vec::new();
    for word in words {
        let word = word.as_ref();
        buf.extend_from_slice(&encode_length(word.len()));
        buf.extend_from_slice(word);
    }
    buf.push(0);
    writer.write_all(&buf).await?;
    writer.flush().await
}

pub async fn read_sentence<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<Vec<u8>>> {
    let mut words = Vec::new();
    loop {
        let len = decode_length(reader).await?;
        if len == 0 {
            return Ok(words);
        }
        if len > MAX_WORD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Word of {} bytes exceeds limit", len),
            ));
        }
        let mut word = vec![0u8; len];
        reader.read_exact(&mut word).await?;
        words.push(word);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Re,
    Done,
    Trap,
    Fatal,
    Empty,
}

/// One reply sentence with its attribute words split into key and value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: ReplyKind,
    pub attributes: Vec<(String, Vec<u8>)>,
    /// Words that are not `=key=value` attributes, such as the reason text
    /// following `!fatal`.
    pub other: Vec<String>,
}

impl Reply {
    pub fn parse(words: Vec<Vec<u8>>) -> io::Result<Self> {
        let mut iter = words.into_iter();
        let head = iter
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Empty reply sentence"))?;
        let kind = match head.as_slice() {
            b"!re" => ReplyKind::Re,
            b"!done" => ReplyKind::Done,
            b"!trap" => ReplyKind::Trap,
            b"!fatal" => ReplyKind::Fatal,
            b"!empty" => ReplyKind::Empty,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Unknown reply type {}", String::from_utf8_lossy(other)),
                ))
            }
        };

        let mut attributes = Vec::new();
        let mut other = Vec::new();
        for word in iter {
            match word.strip_prefix(b"=") {
                Some(rest) => {
                    let split = rest.iter().position(|b| *b == b'=').unwrap_or(rest.len());
                    let key = String::from_utf8_lossy(&rest[..split]).into_owned();
                    let value = rest.get(split + 1..).unwrap_or_default().to_vec();
                    attributes.push((key, value));
                }
                None => other.push(String::from_utf8_lossy(&word).into_owned()),
            }
        }

        Ok(Self {
            kind,
            attributes,
            other,
        })
    }

    pub fn attribute(&self, key: &str) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn attribute_str(&self, key: &str) -> Option<String> {
        self.attribute(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Human-readable reason for a `!trap` or `!fatal`.
    pub fn message(&self) -> String {
        self.attribute_str("message")
            .or_else(|| self.other.first().cloned())
            .unwrap_or_else(|| "no message".to_string())
    }
}
