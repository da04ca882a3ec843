use core::str;

use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::serde::{get_next_word, tokenize, ProtocolError, RespRaw, RespToken};

/// Fundamental type produced by the parser and consumed by the dispatcher
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum RespValue {
    SimpleString(Bytes),
    SimpleError(Bytes),
    BulkString(Bytes),
    NullBulkString,
    Array(Vec<RespValue>),
    Integer(i64),
    Null,
    Boolean(bool),
}

impl RespValue {
    pub fn simple(s: impl Into<String>) -> RespValue {
        RespValue::SimpleString(Bytes::from(s.into()))
    }

    pub fn error(msg: impl Into<String>) -> RespValue {
        RespValue::SimpleError(Bytes::from(msg.into()))
    }

    pub fn bulk(s: impl Into<String>) -> RespValue {
        RespValue::BulkString(Bytes::from(s.into()))
    }

    pub fn ok() -> RespValue {
        RespValue::simple("OK")
    }

    /// An array of bulk strings, the shape every client command takes.
    pub fn command(parts: &[&str]) -> RespValue {
        RespValue::Array(parts.iter().map(|p| RespValue::bulk(*p)).collect())
    }

    /// Borrows the payload of a bulk string as UTF-8 text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::BulkString(b) => str::from_utf8(b).ok(),
            _ => None,
        }
    }

    fn from_token(tok: RespRaw, buf: &Bytes) -> Result<RespValue> {
        let value = match tok {
            RespRaw::SimpleString(s) => RespValue::SimpleString(s.as_bytes(buf)),
            RespRaw::Error(e) => RespValue::SimpleError(e.as_bytes(buf)),
            RespRaw::BulkString(b) => RespValue::BulkString(b.as_bytes(buf)),
            RespRaw::NullBulkString => RespValue::NullBulkString,
            RespRaw::Array(arr) => RespValue::Array(
                arr.into_iter()
                    .map(|m| RespValue::from_token(m, buf))
                    .collect::<Result<_>>()?,
            ),
            RespRaw::Integer(t) => {
                let raw = t.as_bytes(buf);
                let as_str = str::from_utf8(&raw)?;
                RespValue::Integer(as_str.parse().context("invalid integer frame")?)
            }
            RespRaw::Null => RespValue::Null,
            RespRaw::Boolean(t) => match &t.as_bytes(buf)[..] {
                b"t" => RespValue::Boolean(true),
                b"f" => RespValue::Boolean(false),
                other => bail!("invalid boolean frame {other:?}"),
            },
        };

        Ok(value)
    }
}

/// Fundamental type returned by the parser, ready to be consumed by the executor
pub type RespResult = Result<Option<RespValue>>;

/// Buffered RESP I/O over one connection. Also counts every byte drained
/// from the stream, which is what replication offset accounting reads.
pub struct ConnectionHandler<S> {
    stream: S,
    buffer: BytesMut,
    consumed: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ConnectionHandler<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(512),
            consumed: 0,
        }
    }

    /// Total bytes consumed from the stream as completed frames.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Reads one RESP value. `Ok(None)` is a clean close between frames;
    /// EOF in the middle of a frame is an error.
    pub async fn read_and_parse(&mut self) -> RespResult {
        loop {
            if let Some(RespToken(raw, end)) = tokenize(&self.buffer, 0)? {
                let frame = self.buffer.split_to(end).freeze();
                self.consumed += end as u64;
                return Ok(Some(RespValue::from_token(raw, &frame)?));
            }

            let bytes_read = self.stream.read_buf(&mut self.buffer).await?;
            if bytes_read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                bail!(ProtocolError::UnexpectedEof);
            }
        }
    }

    /// Reads the out-of-band RDB transfer that follows a FULLRESYNC reply:
    /// `$<len>\r\n<bytes>` with no trailing CRLF after the payload.
    pub async fn read_rdb_payload(&mut self) -> Result<Bytes> {
        loop {
            if let Some(payload) = self.try_split_rdb_payload()? {
                return Ok(payload);
            }

            let bytes_read = self.stream.read_buf(&mut self.buffer).await?;
            if bytes_read == 0 {
                bail!(ProtocolError::UnexpectedEof);
            }
        }
    }

    fn try_split_rdb_payload(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        if self.buffer[0] != b'$' {
            bail!(ProtocolError::UnexpectedTag(self.buffer[0]));
        }

        let Some((tok, payload_start)) = get_next_word(&self.buffer, 1) else {
            return Ok(None);
        };

        let len_as_str = str::from_utf8(tok.as_slice(&self.buffer))?;
        let len: usize = len_as_str
            .parse()
            .map_err(|_| ProtocolError::InvalidLength(len_as_str.to_string()))?;

        let end = payload_start + len;
        if self.buffer.len() < end {
            return Ok(None);
        }

        let frame = self.buffer.split_to(end).freeze();
        self.consumed += end as u64;
        Ok(Some(frame.slice(payload_start..)))
    }

    pub async fn write(&mut self, response: &RespValue) -> Result<()> {
        self.stream.write_all(&response.serialize()).await?;
        Ok(())
    }

    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }
}
