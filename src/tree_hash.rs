//! Order-insensitive digests of JSON values.
//!
//! Each JSON value is reduced to a SHA-256 digest. Object members and array
//! elements are digested individually and sorted before being combined, so
//! two documents that only differ in key order or element order produce the
//! same root digest.

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of a tree digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// A fixed-size digest of one JSON value.
pub type TreeDigest = [u8; DIGEST_LEN];

/// Values the tree hash cannot represent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeHashError {
    #[error("unable to hash JSON null")]
    Null,

    #[error("unable to hash JSON number {0}")]
    Number(String),
}

/// Computes the tree digest of `value`.
///
/// `null` has no digest: it returns an error so that callers fail closed
/// instead of treating it as equal to anything.
pub fn tree_hash(value: &Value) -> Result<TreeDigest, TreeHashError> {
    match value {
        Value::Null => Err(TreeHashError::Null),
        Value::Bool(b) => Ok(bool_digest(*b)),
        Value::Number(n) => number_digest(n),
        Value::String(s) => Ok(sha256(s.as_bytes())),
        Value::Array(items) => array_digest(items),
        Value::Object(map) => object_digest(map),
    }
}

/// Returns true iff both values hash without error to the same digest.
pub fn equal_by_hash(a: &Value, b: &Value) -> bool {
    match (tree_hash(a), tree_hash(b)) {
        (Ok(ha), Ok(hb)) => ha == hb,
        _ => false,
    }
}

fn sha256(data: &[u8]) -> TreeDigest {
    Sha256::digest(data).into()
}

fn bool_digest(b: bool) -> TreeDigest {
    let mut out = [0u8; DIGEST_LEN];
    if b {
        out[0] = 1;
    }
    out
}

/// A JSON number reduced to the form both comparison modes agree on.
///
/// Integers that `f64` represents exactly become `Float`, so `1` and `1.0`
/// compare equal. Larger integers keep their exact value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CanonicalNumber {
    Float(f64),
    Integer(i128),
}

pub fn canonical_number(n: &Number) -> Option<CanonicalNumber> {
    let integer = n
        .as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from));
    match integer {
        Some(i) if (i as f64) as i128 == i => Some(CanonicalNumber::Float(i as f64)),
        Some(i) => Some(CanonicalNumber::Integer(i)),
        None => n.as_f64().map(CanonicalNumber::Float),
    }
}

fn number_digest(n: &Number) -> Result<TreeDigest, TreeHashError> {
    match canonical_number(n) {
        // -0.0 and 0.0 are the same number.
        Some(CanonicalNumber::Float(f)) if f == 0.0 => Ok(sha256(&0f64.to_le_bytes())),
        Some(CanonicalNumber::Float(f)) => Ok(sha256(&f.to_le_bytes())),
        Some(CanonicalNumber::Integer(i)) => {
            let bytes = i.to_le_bytes();
            Ok(combine(b'#', std::iter::once(bytes.as_slice())))
        }
        None => Err(TreeHashError::Number(n.to_string())),
    }
}

fn array_digest(items: &[Value]) -> Result<TreeDigest, TreeHashError> {
    let mut digests = items
        .iter()
        .map(tree_hash)
        .collect::<Result<Vec<_>, _>>()?;
    digests.sort_unstable();
    Ok(combine(b'[', digests.iter().map(|d| d.as_slice())))
}

fn object_digest(map: &Map<String, Value>) -> Result<TreeDigest, TreeHashError> {
    let mut pairs = Vec::with_capacity(map.len());
    for (key, value) in map {
        let mut pair = [0u8; DIGEST_LEN * 2];
        pair[..DIGEST_LEN].copy_from_slice(&sha256(key.as_bytes()));
        pair[DIGEST_LEN..].copy_from_slice(&tree_hash(value)?);
        pairs.push(pair);
    }
    pairs.sort_unstable();
    Ok(combine(b'{', pairs.iter().map(|p| p.as_slice())))
}

// The tag keeps empty arrays, empty objects and empty strings apart.
fn combine<'a>(tag: u8, parts: impl Iterator<Item = &'a [u8]>) -> TreeDigest {
    let mut hasher = Sha256::new();
    hasher.update([tag]);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}
