//! Response comparison policy.
//!
//! Two responses are the same when their status codes match, their headers
//! match once volatile headers are removed, and their bodies are either
//! byte-identical or structurally identical JSON.

use hyper::HeaderMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::forward::ForwardedResponse;
use crate::tree_hash::{canonical_number, equal_by_hash};

/// How JSON bodies are compared when they are not byte-identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareMode {
    /// Object key order is ignored, array order is significant.
    Strict,
    /// Both object key order and array element order are ignored.
    Weak,
}

impl CompareMode {
    pub fn from_weak(weak: bool) -> Self {
        if weak {
            CompareMode::Weak
        } else {
            CompareMode::Strict
        }
    }
}

/// Compares control and experiment responses for one replayed request.
#[derive(Debug, Clone)]
pub struct ResponseComparator {
    ignored_headers: HashSet<String>,
    mode: CompareMode,
}

impl ResponseComparator {
    pub fn new<I, S>(ignored_headers: I, mode: CompareMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            ignored_headers: ignored_headers
                .into_iter()
                .map(|h| h.as_ref().to_ascii_lowercase())
                .collect(),
            mode,
        }
    }

    /// Returns true when the two responses are considered the same.
    pub fn equal(&self, control: &ForwardedResponse, experiment: &ForwardedResponse) -> bool {
        codes_equal(control.status, experiment.status)
            && self.headers_equal(&control.headers, &experiment.headers)
            && bodies_equal(&control.body, &experiment.body, self.mode)
    }

    /// Header multimaps must match once ignored names are dropped.
    /// The order of values within one header name is not significant.
    pub fn headers_equal(&self, control: &HeaderMap, experiment: &HeaderMap) -> bool {
        self.normalize(control) == self.normalize(experiment)
    }

    fn normalize<'a>(&self, headers: &'a HeaderMap) -> BTreeMap<&'a str, Vec<&'a [u8]>> {
        let mut out: BTreeMap<&str, Vec<&[u8]>> = BTreeMap::new();
        for (name, value) in headers {
            // HeaderName is always stored lowercase.
            if self.ignored_headers.contains(name.as_str()) {
                continue;
            }
            out.entry(name.as_str()).or_default().push(value.as_bytes());
        }
        for values in out.values_mut() {
            values.sort_unstable();
        }
        out
    }
}

pub fn codes_equal(control: i32, experiment: i32) -> bool {
    control == experiment
}

/// Byte equality first, then structural JSON equality.
pub fn bodies_equal(control: &[u8], experiment: &[u8], mode: CompareMode) -> bool {
    control == experiment || json_equal(control, experiment, mode)
}

/// Structural equality of two JSON documents.
///
/// Bodies that do not parse as JSON are never equal here. `null` anywhere in
/// either document makes the comparison fail.
pub fn json_equal(control: &[u8], experiment: &[u8], mode: CompareMode) -> bool {
    let (Ok(control), Ok(experiment)) = (
        serde_json::from_slice::<Value>(control),
        serde_json::from_slice::<Value>(experiment),
    ) else {
        return false;
    };

    match mode {
        CompareMode::Weak => equal_by_hash(&control, &experiment),
        CompareMode::Strict => strict_equal(&control, &experiment),
    }
}

fn strict_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => {
            match (canonical_number(a), canonical_number(b)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| strict_equal(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, va)| b.get(k).is_some_and(|vb| strict_equal(va, vb)))
        }
        _ => false,
    }
}
