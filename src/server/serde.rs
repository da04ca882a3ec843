use core::str;

use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::handler::RespValue;

/// Framing failures. Any of these closes the offending connection.
#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("identifier {0:#04x} does not start a RESP frame")]
    UnexpectedTag(u8),
    #[error("invalid length prefix '{0}'")]
    InvalidLength(String),
    #[error("frame terminator is not CRLF")]
    MissingCrlf,
    #[error("unexpected end of stream inside a frame")]
    UnexpectedEof,
}

/// Tok represents the start index and last index (exclusive)
/// of the current token in a buffer
#[derive(PartialEq, Clone, Debug)]
pub struct Tok(pub usize, pub usize);

impl<'a> Tok {
    pub fn new(from: usize, to: usize) -> Self {
        Self(from, to)
    }

    pub fn as_slice(&self, buf: &'a BytesMut) -> &'a [u8] {
        &buf[self.0..self.1]
    }

    pub fn as_bytes(&self, buf: &Bytes) -> Bytes {
        buf.slice(self.0..self.1)
    }
}

#[derive(PartialEq, Clone, Debug)]
pub enum RespRaw {
    SimpleString(Tok),
    Error(Tok),
    BulkString(Tok),
    NullBulkString,
    Array(Vec<RespRaw>),
    Integer(Tok),
    Null,
    Boolean(Tok),
}

/// Return type of the tokenizer, containing the raw token and the offset one
/// past the end of its frame
#[derive(PartialEq, Clone, Debug)]
pub struct RespToken(pub RespRaw, pub usize);

/// Scans one RESP frame starting at `pos`. Returns `None` when the buffer
/// holds only a prefix of the frame so the caller can read more bytes first.
pub fn tokenize(buf: &BytesMut, pos: usize) -> Result<Option<RespToken>> {
    if pos >= buf.len() {
        return Ok(None);
    }

    match buf[pos] {
        b'+' => parse_line(buf, pos + 1, RespRaw::SimpleString),
        b'-' => parse_line(buf, pos + 1, RespRaw::Error),
        b'$' => parse_bulk_string(buf, pos + 1),
        b'*' => parse_array(buf, pos + 1),
        b':' => parse_line(buf, pos + 1, RespRaw::Integer),
        b'_' => parse_null(buf, pos + 1),
        b'#' => parse_line(buf, pos + 1, RespRaw::Boolean),
        other => bail!(ProtocolError::UnexpectedTag(other)),
    }
}

fn parse_line(buf: &BytesMut, pos: usize, wrap: fn(Tok) -> RespRaw) -> Result<Option<RespToken>> {
    let word = get_next_word(buf, pos);
    Ok(word.map(|(tok, next_pos)| RespToken(wrap(tok), next_pos)))
}

fn parse_null(buf: &BytesMut, pos: usize) -> Result<Option<RespToken>> {
    let word = get_next_word(buf, pos);
    Ok(word.map(|(_, next_pos)| RespToken(RespRaw::Null, next_pos)))
}

fn parse_bulk_string(buf: &BytesMut, pos: usize) -> Result<Option<RespToken>> {
    let Some((tok, next_pos)) = get_next_word(buf, pos) else {
        return Ok(None);
    };

    let expected_len = parse_decimal(tok.as_slice(buf))?;

    // --- check for null bulk strings
    if expected_len == -1 {
        return Ok(Some(RespToken(RespRaw::NullBulkString, next_pos)));
    }
    if expected_len < 0 {
        bail!(ProtocolError::InvalidLength(expected_len.to_string()));
    }

    let from = next_pos;
    let to = from + expected_len as usize;

    // --- payload plus trailing CRLF not buffered yet -> wait for next cycle
    if buf.len() < to + 2 {
        return Ok(None);
    }
    if &buf[to..to + 2] != b"\r\n" {
        bail!(ProtocolError::MissingCrlf);
    }

    Ok(Some(RespToken(RespRaw::BulkString(Tok::new(from, to)), to + 2)))
}

fn parse_array(buf: &BytesMut, pos: usize) -> Result<Option<RespToken>> {
    let Some((tok, next_pos)) = get_next_word(buf, pos) else {
        return Ok(None);
    };

    let expected_arr_len = parse_decimal(tok.as_slice(buf))?;
    if expected_arr_len < 0 {
        bail!(ProtocolError::InvalidLength(expected_arr_len.to_string()));
    }

    // used to keep track of next index in buf to scan
    let mut cur_pos = next_pos;
    let mut array: Vec<RespRaw> = Vec::with_capacity(expected_arr_len as usize);

    for _ in 0..expected_arr_len {
        match tokenize(buf, cur_pos)? {
            Some(parsed_tok) => {
                cur_pos = parsed_tok.1;
                array.push(parsed_tok.0);
            }
            None => return Ok(None),
        }
    }

    Ok(Some(RespToken(RespRaw::Array(array), cur_pos)))
}

fn parse_decimal(raw: &[u8]) -> Result<i64> {
    let as_str =
        str::from_utf8(raw).map_err(|_| ProtocolError::InvalidLength(format!("{raw:?}")))?;
    let value = as_str
        .parse()
        .map_err(|_| ProtocolError::InvalidLength(as_str.to_string()))?;
    Ok(value)
}

/// Returns the range of the next CRLF-terminated word
pub fn get_next_word(buf: &BytesMut, pos: usize) -> Option<(Tok, usize)> {
    // --- end of buffer
    if pos >= buf.len() {
        return None;
    }

    // --- find first occurence of "\r\n"
    let next_crlf = buf[pos..].windows(2).position(|w| w == b"\r\n");
    next_crlf.map(|cr| (Tok::new(pos, pos + cr), pos + cr + 2))
}

impl RespValue {
    /// Renders the value back into its wire form. Empty and null bulk
    /// strings stay distinct: `$0\r\n\r\n` vs `$-1\r\n`.
    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.write_to(&mut out);
        out.freeze()
    }

    fn write_to(&self, out: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => {
                out.extend_from_slice(b"+");
                out.extend_from_slice(s);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::SimpleError(e) => {
                out.extend_from_slice(b"-");
                out.extend_from_slice(e);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::BulkString(b) => {
                out.extend_from_slice(format!("${}\r\n", b.len()).as_bytes());
                out.extend_from_slice(b);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::NullBulkString => out.extend_from_slice(b"$-1\r\n"),
            RespValue::Array(arr) => {
                out.extend_from_slice(format!("*{}\r\n", arr.len()).as_bytes());
                for item in arr {
                    item.write_to(out);
                }
            }
            RespValue::Integer(n) => out.extend_from_slice(format!(":{n}\r\n").as_bytes()),
            RespValue::Null => out.extend_from_slice(b"_\r\n"),
            RespValue::Boolean(true) => out.extend_from_slice(b"#t\r\n"),
            RespValue::Boolean(false) => out.extend_from_slice(b"#f\r\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(raw: &[u8]) -> BytesMut {
        BytesMut::from(raw)
    }

    #[test]
    fn tokenizes_every_tag() {
        let cases: Vec<(&[u8], RespRaw, usize)> = vec![
            (b"+OK\r\n", RespRaw::SimpleString(Tok::new(1, 3)), 5),
            (b"-Error\r\n", RespRaw::Error(Tok::new(1, 6)), 8),
            (b"$3\r\nfoo\r\n", RespRaw::BulkString(Tok::new(4, 7)), 9),
            (b":123\r\n", RespRaw::Integer(Tok::new(1, 4)), 6),
            (b":-42\r\n", RespRaw::Integer(Tok::new(1, 4)), 6),
            (b"_\r\n", RespRaw::Null, 3),
            (b"#t\r\n", RespRaw::Boolean(Tok::new(1, 2)), 4),
            (b"#f\r\n", RespRaw::Boolean(Tok::new(1, 2)), 4),
            (b"$-1\r\n", RespRaw::NullBulkString, 5),
            (b"$0\r\n\r\n", RespRaw::BulkString(Tok::new(4, 4)), 6),
        ];

        for (input, raw, end) in cases {
            let got = tokenize(&buf(input), 0).unwrap().unwrap();
            assert_eq!(got, RespToken(raw, end), "input {input:?}");
        }
    }

    #[test]
    fn tokenizes_nested_arrays() {
        let input = buf(b"*2\r\n*1\r\n$4\r\nping\r\n:7\r\n");
        let RespToken(raw, end) = tokenize(&input, 0).unwrap().unwrap();
        assert_eq!(end, input.len());
        let RespRaw::Array(items) = raw else {
            panic!("expected array");
        };
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], RespRaw::Array(inner) if inner.len() == 1));
        assert!(matches!(&items[1], RespRaw::Integer(_)));
    }

    #[test]
    fn incomplete_frames_yield_none() {
        let prefixes: Vec<&[u8]> = vec![
            b"",
            b"+OK",
            b"$5\r\nhel",
            b"$5\r\nhello",
            b"*2\r\n$4\r\necho\r\n",
            b"*2\r\n$4\r\necho\r\n$5\r\nhel",
        ];

        for prefix in prefixes {
            assert_eq!(tokenize(&buf(prefix), 0).unwrap(), None, "prefix {prefix:?}");
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        let inputs: Vec<&[u8]> = vec![b"%2\r\n", b"$abc\r\n", b"$-2\r\n", b"*-3\r\n"];

        for input in inputs {
            assert!(tokenize(&buf(input), 0).is_err(), "input {input:?}");
        }
    }

    #[test]
    fn rejects_bulk_string_without_crlf_terminator() {
        assert!(tokenize(&buf(b"$3\r\nfooXX"), 0).is_err());
    }

    #[test]
    fn serializes_values() {
        let cases = vec![
            (RespValue::simple("PONG"), "+PONG\r\n"),
            (RespValue::error("ERR boom"), "-ERR boom\r\n"),
            (RespValue::bulk("hello"), "$5\r\nhello\r\n"),
            (RespValue::bulk(""), "$0\r\n\r\n"),
            (RespValue::NullBulkString, "$-1\r\n"),
            (RespValue::Integer(-7), ":-7\r\n"),
            (RespValue::Null, "_\r\n"),
            (RespValue::Boolean(true), "#t\r\n"),
            (
                RespValue::Array(vec![RespValue::bulk("echo"), RespValue::bulk("hi")]),
                "*2\r\n$4\r\necho\r\n$2\r\nhi\r\n",
            ),
            (RespValue::Array(vec![]), "*0\r\n"),
        ];

        for (value, expected) in cases {
            assert_eq!(value.serialize(), expected.as_bytes());
        }
    }
}
