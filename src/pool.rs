//! Decoder for pooled-reference JSON documents.
//!
//! The configurator transports its responses as a flat *pool* of values:
//!
//! ```text
//! [{"_1": 2}, "customer-feasibility", {"_3": 4}, "data", [5, -5], "X1"]
//! ```
//!
//! Element 0 is the root. Inside the pool:
//!
//! - a non-negative integer is a reference to another pool element;
//! - `-5` and `-7` are null sentinels, other negative integers are literal;
//! - an integer past the end of the pool is a literal;
//! - an object key `_<n>` names its key by reference to element `n`;
//! - booleans, strings and floats are literal.
//!
//! The example decodes to `{"customer-feasibility": {"data": ["X1", null]}}`.
//!
//! Resolution goes through an index-addressed memo table, so shared elements
//! are resolved once. An element that is reached again while it is still
//! being resolved (a cycle) reads as `null` at that point.

use serde_json::{Map, Value};
use thiserror::Error;

/// Sentinels standing for `null`.
const NULL_SENTINELS: [i64; 2] = [-5, -7];

/// Maximum nesting depth accepted before giving up.
///
/// Resolution recurses, so this must stay well inside a 2 MiB thread stack
/// in unoptimized builds.
const MAX_DEPTH: usize = 256;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool must be a JSON array")]
    NotAnArray,
    #[error("pool is nested deeper than {0} levels")]
    TooDeep(usize),
}

#[derive(Clone)]
enum Slot {
    Unresolved,
    InProgress,
    Resolved(Value),
}

struct Decoder<'a> {
    pool: &'a [Value],
    memo: Vec<Slot>,
}

/// Decodes a pooled document into plain JSON.
///
/// An empty pool decodes to `null`.
pub fn decode_pool(doc: &Value) -> Result<Value, PoolError> {
    let pool = doc.as_array().ok_or(PoolError::NotAnArray)?;
    if pool.is_empty() {
        return Ok(Value::Null);
    }
    let mut decoder = Decoder {
        pool,
        memo: vec![Slot::Unresolved; pool.len()],
    };
    decoder.index(0, 0)
}

impl Decoder<'_> {
    fn index(&mut self, idx: i64, depth: usize) -> Result<Value, PoolError> {
        if idx < 0 {
            return Ok(if NULL_SENTINELS.contains(&idx) {
                Value::Null
            } else {
                Value::from(idx)
            });
        }
        let i = idx as usize;
        if i >= self.pool.len() {
            return Ok(Value::from(idx));
        }
        match &self.memo[i] {
            Slot::Resolved(v) => return Ok(v.clone()),
            Slot::InProgress => return Ok(Value::Null),
            Slot::Unresolved => {}
        }
        if depth > MAX_DEPTH {
            return Err(PoolError::TooDeep(MAX_DEPTH));
        }

        self.memo[i] = Slot::InProgress;
        let pool = self.pool;
        let value = self.value(&pool[i], depth + 1)?;
        self.memo[i] = Slot::Resolved(value.clone());
        Ok(value)
    }

    fn value(&mut self, val: &Value, depth: usize) -> Result<Value, PoolError> {
        match val {
            Value::Number(n) => match n.as_i64() {
                Some(idx) => self.index(idx, depth),
                None => Ok(val.clone()),
            },
            Value::Array(items) => items
                .iter()
                .map(|v| self.value(v, depth + 1))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(obj) => {
                let mut out = Map::with_capacity(obj.len());
                for (k, v) in obj {
                    let key = match pooled_key(k) {
                        Some(idx) => key_string(self.index(idx, depth + 1)?),
                        None => k.clone(),
                    };
                    out.insert(key, self.value(v, depth + 1)?);
                }
                Ok(Value::Object(out))
            }
            Value::Null | Value::Bool(_) | Value::String(_) => Ok(val.clone()),
        }
    }
}

fn pooled_key(key: &str) -> Option<i64> {
    let digits = key.strip_prefix('_')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn key_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
