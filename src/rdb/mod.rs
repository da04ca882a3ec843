use std::collections::HashMap;

use thiserror::Error;

const MAGIC: &[u8] = b"REDIS0011";

const SEP_METADATA: u8 = 0xFA;
const SEP_HASH_SIZES: u8 = 0xFB;
const KEY_EXPIRY_MS: u8 = 0xFC;
const KEY_EXPIRY_S: u8 = 0xFD;
const SEP_DATABASE: u8 = 0xFE;
const SEP_EOF: u8 = 0xFF;

// markers preceding numeric metadata, indicating the integer width
const INT_U8: u8 = 0xC0;
const INT_U32: u8 = 0xC2;

const TYPE_STRING: u8 = 0x00;

#[derive(Error, Debug, PartialEq)]
pub enum RdbError {
    #[error("not an rdb file (bad magic)")]
    BadMagic,
    #[error("unexpected end of file")]
    ShortRead,
    #[error("unexpected metadata key '{0}'")]
    UnknownMetadata(String),
    #[error("unexpected separator byte {0:#04x}")]
    UnexpectedSeparator(u8),
    #[error("unexpected integer width marker {0:#04x}")]
    UnexpectedIntMarker(u8),
    #[error("unexpected redis-bits value {0}")]
    UnexpectedBits(u8),
    #[error("unsupported value type {0:#04x}")]
    UnsupportedType(u8),
}

#[derive(Debug, Default, PartialEq)]
pub struct Metadata {
    pub redis_version: Option<String>,
    pub ctime: Option<u64>,
    pub used_mem: Option<u64>,
    pub redis_bits: Option<u8>,
}

#[derive(Debug, Default, PartialEq)]
pub struct Database {
    pub index: u8,
    pub keys: HashMap<String, String>,
    pub expiries: HashMap<String, u64>,
}

#[derive(Debug, Default, PartialEq)]
pub struct RdbContents {
    pub metadata: Metadata,
    pub databases: Vec<Database>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], RdbError> {
        let end = self.pos.checked_add(count).ok_or(RdbError::ShortRead)?;
        if end > self.buf.len() {
            return Err(RdbError::ShortRead);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, RdbError> {
        Ok(self.take(1)?[0])
    }

    fn peek(&self) -> Result<u8, RdbError> {
        self.buf.get(self.pos).copied().ok_or(RdbError::ShortRead)
    }

    fn u32_le(&mut self) -> Result<u32, RdbError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes(raw.try_into().unwrap()))
    }

    fn u64_le(&mut self) -> Result<u64, RdbError> {
        let raw = self.take(8)?;
        Ok(u64::from_le_bytes(raw.try_into().unwrap()))
    }

    /// Length-prefixed string: one length byte, then that many raw bytes.
    fn lp_string(&mut self) -> Result<String, RdbError> {
        let len = self.u8()? as usize;
        let raw = self.take(len)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    fn expect(&mut self, marker: u8) -> Result<(), RdbError> {
        let got = self.u8()?;
        if got != marker {
            return Err(RdbError::UnexpectedIntMarker(got));
        }
        Ok(())
    }
}

/// Parses a complete snapshot image: magic, metadata attributes, database
/// sections, EOF marker plus an 8-byte checksum that is consumed unverified.
pub fn parse(raw: &[u8]) -> Result<RdbContents, RdbError> {
    let mut r = Reader::new(raw);

    if r.take(MAGIC.len()).map_err(|_| RdbError::BadMagic)? != MAGIC {
        return Err(RdbError::BadMagic);
    }

    let mut contents = RdbContents::default();

    while !r.at_end() {
        let separator = r.u8()?;
        match separator {
            SEP_METADATA => read_metadata(&mut r, &mut contents.metadata)?,
            SEP_DATABASE => contents.databases.push(read_database(&mut r)?),
            SEP_EOF => {
                r.take(8)?; // checksum, not verified
                break;
            }
            other => return Err(RdbError::UnexpectedSeparator(other)),
        }
    }

    Ok(contents)
}

fn read_metadata(r: &mut Reader, metadata: &mut Metadata) -> Result<(), RdbError> {
    let key = r.lp_string()?;

    match key.as_str() {
        "redis-ver" => metadata.redis_version = Some(r.lp_string()?),
        "ctime" => {
            r.expect(INT_U32)?;
            metadata.ctime = Some(r.u32_le()? as u64);
        }
        "redis-bits" => {
            r.expect(INT_U8)?;
            let bits = r.u8()?;
            if bits != 64 {
                return Err(RdbError::UnexpectedBits(bits));
            }
            metadata.redis_bits = Some(bits);
        }
        "used-mem" => {
            r.expect(INT_U32)?;
            metadata.used_mem = Some(r.u32_le()? as u64);
        }
        "aof-base" => {
            r.expect(INT_U8)?;
            r.u8()?; // value is ignored
        }
        _ => return Err(RdbError::UnknownMetadata(key)),
    }

    Ok(())
}

fn read_database(r: &mut Reader) -> Result<Database, RdbError> {
    let index = r.u8()?;

    let sizes = r.u8()?;
    if sizes != SEP_HASH_SIZES {
        return Err(RdbError::UnexpectedSeparator(sizes));
    }
    let ksize = r.u8()? as usize;
    let esize = r.u8()? as usize;

    let mut db = Database {
        index,
        keys: HashMap::with_capacity(ksize),
        expiries: HashMap::with_capacity(esize),
    };

    for _ in 0..ksize {
        let expiry = match r.peek()? {
            KEY_EXPIRY_MS => {
                r.u8()?;
                Some(r.u64_le()?)
            }
            KEY_EXPIRY_S => {
                r.u8()?;
                Some(r.u32_le()? as u64 * 1000)
            }
            _ => None,
        };

        let value_type = r.u8()?;
        if value_type != TYPE_STRING {
            return Err(RdbError::UnsupportedType(value_type));
        }

        let key = r.lp_string()?;
        let value = r.lp_string()?;

        if let Some(at) = expiry {
            db.expiries.insert(key.clone(), at);
        }
        db.keys.insert(key, value);
    }

    Ok(db)
}

/// Serializes a snapshot of string keys and their absolute ms expiries into
/// the same image `parse` reads. Entries whose key or value exceed the
/// one-byte length prefix are skipped with a warning.
pub fn serialize(keys: &HashMap<String, String>, expiries: &HashMap<String, u64>) -> Vec<u8> {
    let mut fits: Vec<(&String, &String)> = keys
        .iter()
        .filter(|(key, value)| {
            let ok = key.len() <= u8::MAX as usize && value.len() <= u8::MAX as usize;
            if !ok {
                log::warn!("skipping rdb entry with oversized key or value: {key}");
            }
            ok
        })
        .collect();
    // cap at the one-byte table size
    if fits.len() > u8::MAX as usize {
        log::warn!("rdb snapshot truncated to {} keys", u8::MAX);
        fits.truncate(u8::MAX as usize);
    }

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);

    out.push(SEP_METADATA);
    push_lp_string(&mut out, "redis-ver");
    push_lp_string(&mut out, "7.2.0");

    out.push(SEP_DATABASE);
    out.push(0); // database index
    out.push(SEP_HASH_SIZES);
    out.push(fits.len() as u8);
    out.push(fits.iter().filter(|(k, _)| expiries.contains_key(*k)).count() as u8);

    for (key, value) in fits {
        if let Some(&at) = expiries.get(key) {
            out.push(KEY_EXPIRY_MS);
            out.extend_from_slice(&at.to_le_bytes());
        }
        out.push(TYPE_STRING);
        push_lp_string(&mut out, key);
        push_lp_string(&mut out, value);
    }

    out.push(SEP_EOF);
    out.extend_from_slice(&[0u8; 8]); // checksum slot, readers discard it

    out
}

fn push_lp_string(out: &mut Vec<u8>, raw: &str) {
    out.push(raw.len() as u8);
    out.extend_from_slice(raw.as_bytes());
}
