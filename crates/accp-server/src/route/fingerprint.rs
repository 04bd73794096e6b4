//! Request fingerprints, the cache key of a request.
//!
//! xxh3-64 over method, path, sorted query pairs, sorted headers and body.
//! Header names are lower-cased; hop-by-hop headers and headers that only
//! steer the proxy itself do not participate.

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

use crate::record::{RequestRecord, is_hop_by_hop_header};

/// Request-scoped headers excluded from the fingerprint
const EXCLUDED_HEADERS: &[&str] = &[
    "content-length",
    "x-request-id",
    "accp-cache-disable",
    "accp-captcha-disable",
    "accp-captcha-token",
    "accp-introspect-body",
    "g-recaptcha-response",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    pub fn of(record: &RequestRecord) -> Self {
        let mut hasher = Xxh3::new();
        write_field(&mut hasher, record.method.to_ascii_uppercase().as_bytes());
        write_field(&mut hasher, record.path().as_bytes());

        let mut pairs: Vec<(&str, &str)> = record
            .query()
            .unwrap_or_default()
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| p.split_once('=').unwrap_or((p, "")))
            .collect();
        pairs.sort_unstable();
        for (k, v) in pairs {
            write_field(&mut hasher, k.as_bytes());
            write_field(&mut hasher, v.as_bytes());
        }

        // BTreeMap keys are already sorted; names are lower-cased on record.
        for (name, values) in &record.headers {
            if participates(name) {
                write_field(&mut hasher, name.as_bytes());
                let mut values: Vec<&String> = values.iter().collect();
                values.sort_unstable();
                for value in values {
                    write_field(&mut hasher, value.as_bytes());
                }
            }
        }

        write_field(&mut hasher, &record.body);
        Fingerprint(hasher.digest())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn participates(name: &str) -> bool {
    !is_hop_by_hop_header(name) && !EXCLUDED_HEADERS.contains(&name)
}

fn write_field(hasher: &mut Xxh3, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
