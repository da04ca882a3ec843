use core::fmt;
use core::str::FromStr;

use thiserror::Error;

/// Errors raised while validating stream entry IDs. The messages are the
/// exact strings clients see.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StreamError {
    #[error("ERR Invalid stream ID specified as stream command argument")]
    MalformedId,
    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    IdIsZero,
    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    IdNotGreaterThanTop,
}

/// Composite sequence key of a stream entry: milliseconds since the epoch
/// plus a tie-breaking sequence number. Ordering is lexicographic on
/// `(ms, seq)`, which the derived `Ord` gives us.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StreamError;

    /// Parses `T-S`, defaulting a missing `-S` to 0.
    fn from_str(raw: &str) -> Result<Self, StreamError> {
        let (ms_part, seq_part) = match raw.split_once('-') {
            Some((ms, seq)) => (ms, Some(seq)),
            None => (raw, None),
        };

        let ms = ms_part.parse().map_err(|_| StreamError::MalformedId)?;
        let seq = match seq_part {
            Some(s) => s.parse().map_err(|_| StreamError::MalformedId)?,
            None => 0,
        };

        Ok(EntryId { ms, seq })
    }
}

/// The ID argument of XADD: a literal `T-S`, a `T-*` asking the store to
/// pick the sequence number, or a bare `*` asking for a wall-clock ID.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum IdSpec {
    Explicit(EntryId),
    SeqWildcard(u64),
    Wildcard,
}

impl FromStr for IdSpec {
    type Err = StreamError;

    fn from_str(raw: &str) -> Result<Self, StreamError> {
        if raw == "*" {
            return Ok(IdSpec::Wildcard);
        }

        match raw.split_once('-') {
            Some((ms, "*")) => {
                let ms = ms.parse().map_err(|_| StreamError::MalformedId)?;
                Ok(IdSpec::SeqWildcard(ms))
            }
            _ => Ok(IdSpec::Explicit(raw.parse()?)),
        }
    }
}

/// An XRANGE boundary: `-` for the smallest possible ID, `+` for the
/// largest, or a literal ID with `-S` defaulting to 0.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum RangeBound {
    Min,
    Max,
    At(EntryId),
}

impl FromStr for RangeBound {
    type Err = StreamError;

    fn from_str(raw: &str) -> Result<Self, StreamError> {
        match raw {
            "-" => Ok(RangeBound::Min),
            "+" => Ok(RangeBound::Max),
            _ => Ok(RangeBound::At(raw.parse()?)),
        }
    }
}

/// One appended entry: its sequence key plus the field/value pairs.
#[derive(PartialEq, Clone, Debug)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: Vec<(String, String)>,
}

/// Resolves the requested ID against the stream's current top entry and
/// validates the ordering invariant. `now_ms` feeds the bare `*` wildcard.
pub fn resolve_entry_id(
    spec: IdSpec,
    last: Option<EntryId>,
    now_ms: u64,
) -> Result<EntryId, StreamError> {
    let id = match spec {
        IdSpec::Explicit(id) => id,
        IdSpec::Wildcard => EntryId::new(now_ms, 0),
        IdSpec::SeqWildcard(ms) => {
            let seq = match last {
                Some(top) if top.ms == ms => top.seq + 1,
                // the very first entry at time zero cannot be 0-0
                _ if ms == 0 => 1,
                _ => 0,
            };
            EntryId::new(ms, seq)
        }
    };

    if id == EntryId::ZERO {
        return Err(StreamError::IdIsZero);
    }
    if let Some(top) = last {
        if top >= id {
            return Err(StreamError::IdNotGreaterThanTop);
        }
    }

    Ok(id)
}
