use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::errors::DatabaseError;

/// Which lane of a page range a record lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Lane {
    Base,
    Tail,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Base => write!(f, "base"),
            Lane::Tail => write!(f, "tail"),
        }
    }
}

/// A record identifier: a lane tag plus a per-table, per-lane monotonic
/// sequence number. Serializes as its `b<N>` / `t<N>` string form so it can
/// key JSON maps and interoperate with the path layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Rid {
    pub lane: Lane,
    pub seq: u64,
}

impl Rid {
    pub fn base(seq: u64) -> Self {
        Rid { lane: Lane::Base, seq }
    }

    pub fn tail(seq: u64) -> Self {
        Rid { lane: Lane::Tail, seq }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.lane {
            Lane::Base => 'b',
            Lane::Tail => 't',
        };
        write!(f, "{}{}", tag, self.seq)
    }
}

impl FromStr for Rid {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || DatabaseError::MalformedRid(s.to_string());
        let lane = match s.chars().next() {
            Some('b') => Lane::Base,
            Some('t') => Lane::Tail,
            _ => return Err(malformed()),
        };
        let seq = s[1..].parse::<u64>().map_err(|_| malformed())?;
        Ok(Rid { lane, seq })
    }
}

impl From<Rid> for String {
    fn from(rid: Rid) -> String {
        rid.to_string()
    }
}

impl TryFrom<String> for Rid {
    type Error = DatabaseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// One row version. Base records are written once and mutated only through
/// `Page::update_indirection`; tail records are immutable deltas carrying the
/// full (cumulative) column image of their version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub rid: Rid,

    /// RID of the base record this version belongs to; equals `rid` for bases.
    pub base_rid: Rid,

    /// RID of the next-newer version. A base self-points until its first
    /// update; the oldest tail points back at the base.
    pub indirection: Rid,

    /// Wall-clock creation time, milliseconds since the epoch.
    pub start_time: u64,

    /// Bit `i` is set iff column `i` has been updated since the base image.
    pub schema_encoding: u64,

    pub columns: Vec<Option<i64>>,
}

impl Record {
    /// A fresh base record: self-pointing indirection, empty schema encoding.
    pub fn base(rid: Rid, columns: Vec<Option<i64>>) -> Self {
        Record {
            rid,
            base_rid: rid,
            indirection: rid,
            start_time: now_millis(),
            schema_encoding: 0,
            columns,
        }
    }

    pub fn tail(
        rid: Rid,
        base_rid: Rid,
        indirection: Rid,
        schema_encoding: u64,
        columns: Vec<Option<i64>>,
    ) -> Self {
        Record {
            rid,
            base_rid,
            indirection,
            start_time: now_millis(),
            schema_encoding,
            columns,
        }
    }

    /// An all-null column image marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.columns.iter().all(Option::is_none)
    }

    /// Copy of this record keeping only the columns whose projection bit is set.
    pub fn project(&self, projection: &[usize]) -> Record {
        let columns = self
            .columns
            .iter()
            .zip(projection.iter())
            .filter(|(_, &bit)| bit == 1)
            .map(|(value, _)| *value)
            .collect();

        Record {
            rid: self.rid,
            base_rid: self.base_rid,
            indirection: self.indirection,
            start_time: self.start_time,
            schema_encoding: self.schema_encoding,
            columns,
        }
    }
}

/// Bitmask with bit `i` set for every non-null entry of `columns`.
pub fn schema_mask(columns: &[Option<i64>]) -> u64 {
    let mut mask = 0;

    for (index, value) in columns.iter().enumerate() {
        if value.is_some() {
            mask |= 1 << index;
        }
    }

    mask
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
