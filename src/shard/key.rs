//! Distribution key resolution
//!
//! Pulls the value of a model's distribution key out of a record payload or
//! a query filter. Only a top-level `key == scalar` condition counts for a
//! filter: anything else (ranges, IN lists, nested AND/OR, no filter) is
//! ambiguous and forces a fan-out. A missed optimization is acceptable, a
//! wrong shard is not.

use crc::{Crc, CRC_32_ISO_HDLC};
use serde_json::Value;
use std::fmt;

use crate::error::{KeySource, ShardError};
use crate::model::{Condition, Filter, ModelDeclaration, Record};

/// Hash for text keys that do not read as integers
static TEXT_HASH: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A resolved distribution key value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShardKey {
    Int(i64),
    /// Integers above `i64::MAX`; smaller values are always `Int`
    UInt(u64),
    Text(String),
}

impl ShardKey {
    /// Convert a JSON scalar into a key.
    ///
    /// Integers (and integral floats that fit an `i64`) are integer keys.
    /// Strings holding a base-10 integer are integer keys too, so `"7"` and
    /// `7` land on the same shard. Null, booleans, arrays and objects are
    /// not keys.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(ShardKey::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Some(ShardKey::UInt(u))
                } else {
                    n.as_f64().and_then(Self::from_integral_float)
                }
            }
            Value::String(s) => Some(Self::from_text(s)),
            _ => None,
        }
    }

    fn from_text(s: &str) -> Self {
        if let Ok(i) = s.parse::<i64>() {
            ShardKey::Int(i)
        } else if let Ok(u) = s.parse::<u64>() {
            ShardKey::UInt(u)
        } else {
            ShardKey::Text(s.to_string())
        }
    }

    /// `-2^63 <= f < 2^63` with no fractional part; anything else would
    /// saturate in the cast and collide with other keys.
    fn from_integral_float(f: f64) -> Option<Self> {
        const LIMIT: f64 = 9_223_372_036_854_775_808.0;
        (f.fract() == 0.0 && (-LIMIT..LIMIT).contains(&f)).then(|| ShardKey::Int(f as i64))
    }

    /// Shard index for a topology of `shard_count` shards.
    ///
    /// Identity hash for integers (`k mod N`, kept in `[0, N)` for negative
    /// keys); CRC-32 for text. Changing N remaps almost every key.
    pub fn index_for(&self, shard_count: usize) -> Option<usize> {
        if shard_count == 0 {
            return None;
        }
        let index = match self {
            ShardKey::Int(k) => k.rem_euclid(shard_count as i64) as usize,
            ShardKey::UInt(k) => (k % shard_count as u64) as usize,
            ShardKey::Text(s) => TEXT_HASH.checksum(s.as_bytes()) as usize % shard_count,
        };
        Some(index)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::Int(k) => write!(f, "{k}"),
            ShardKey::UInt(k) => write!(f, "{k}"),
            ShardKey::Text(s) => f.write_str(s),
        }
    }
}

/// Reads a model's distribution key out of payloads and filters
#[derive(Debug, Clone, Copy)]
pub struct DistributionKeyResolver<'a> {
    declaration: &'a ModelDeclaration,
}

impl<'a> DistributionKeyResolver<'a> {
    pub fn new(declaration: &'a ModelDeclaration) -> Self {
        Self { declaration }
    }

    /// Name of the attribute that picks the shard
    pub fn key(&self) -> &'a str {
        &self.declaration.distribution_key
    }

    /// Key value carried by a record payload; `None` when the attribute is
    /// absent, null, or not a scalar.
    pub fn value_from_payload(&self, payload: &Record) -> Option<ShardKey> {
        payload.get(self.key()).and_then(ShardKey::from_value)
    }

    /// Key value pinned by a filter; `None` when the filter does not pin
    /// exactly one value with a top-level equality.
    pub fn value_from_filter(&self, filter: &Filter) -> Option<ShardKey> {
        let key = self.key();
        let mut pinned: Option<ShardKey> = None;

        for condition in &filter.conditions {
            if let Condition::Eq(field, value) = condition {
                if field != key {
                    continue;
                }
                let value = ShardKey::from_value(value)?;
                match &pinned {
                    // Contradictory equalities: no single shard is right.
                    Some(existing) if *existing != value => return None,
                    _ => pinned = Some(value),
                }
            }
        }

        pinned
    }

    pub fn require_from_payload(&self, payload: &Record) -> Result<ShardKey, ShardError> {
        self.value_from_payload(payload)
            .ok_or_else(|| self.missing(KeySource::Payload))
    }

    pub fn require_from_filter(&self, filter: &Filter) -> Result<ShardKey, ShardError> {
        self.value_from_filter(filter)
            .ok_or_else(|| self.missing(KeySource::Filter))
    }

    fn missing(&self, attempted: KeySource) -> ShardError {
        ShardError::MissingDistributionValue {
            model: self.declaration.name.clone(),
            attempted,
        }
    }
}
