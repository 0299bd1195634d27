//! 🧭 Key routing: turn a storage key into `(index, doc_id)`, and back again when we can.
//!
//! 🗺️ The collectors write objects at `{provider}/{service}/{type}/{resource}.json`.
//! The path IS the schema. We don't open the file to figure out where it goes.
//! We read the address on the envelope like a reasonable mail carrier.
//!
//! ```text
//!   Resources/ec2/instance/i-0123.json
//!   └───────┬────────────┘ └──┬──┘
//!   index = resources_ec2_instance   doc_id = i-0123
//! ```
//!
//! 🔐 Some providers (the `hashed_id_prefixes` taxonomy) name their objects with ids
//! that are long, case-sensitive, and full of characters the cluster finds rude.
//! Those get a sha256 hex doc id instead. Hashes don't go backwards, so those keys
//! can't be inverted. That's fine: the requeue ledger remembers them. 🦆

use crate::app_config::IngestConfig;
use crate::common::IndexTarget;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// 🔣 Characters left alone when a key goes back out into a notification.
/// Everything else gets `%XX`'d, which is exactly what the storage service does.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'!')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// 🧾 Every way a key can fail to become an address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("💀 storage key '{key}' needs at least two non-empty path segments to route")]
    TooFewSegments { key: String },
    #[error("🔐 target {index}/{doc_id} uses a hashed doc id; its storage key cannot be rebuilt")]
    NotInvertible { index: String, doc_id: String },
}

/// 🏷️ Which doc id scheme a key falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Taxonomy {
    /// Last path segment, extension stripped.
    PathId,
    /// sha256 hex of the last path segment, extension stripped.
    HashedId,
}

#[derive(Debug, Clone)]
pub struct KeyRouter {
    hashed_id_prefixes: Vec<String>,
    provider_prefixes: Vec<String>,
}

impl KeyRouter {
    pub fn new(hashed_id_prefixes: Vec<String>, provider_prefixes: Vec<String>) -> Self {
        Self {
            hashed_id_prefixes,
            provider_prefixes,
        }
    }

    pub fn from_config(ingest: &IngestConfig) -> Self {
        Self::new(
            ingest.hashed_id_prefixes.clone(),
            ingest.provider_prefixes.clone(),
        )
    }

    /// 🏷️ Taxonomy is decided by the first path segment, compared case-insensitively.
    pub fn taxonomy_of(&self, first_segment: &str) -> Taxonomy {
        if self
            .hashed_id_prefixes
            .iter()
            .any(|prefix| prefix.eq_ignore_ascii_case(first_segment))
        {
            Taxonomy::HashedId
        } else {
            Taxonomy::PathId
        }
    }

    /// 🧭 Route a decoded storage key.
    ///
    /// - index: every segment but the last, joined with `_`, lowercased.
    /// - doc_id: the last segment minus its final extension (or its sha256 hex, see [`Taxonomy`]).
    ///
    /// Pure and deterministic. Same key in, same target out, every invocation, every retry.
    pub fn route(&self, key: &str) -> Result<IndexTarget, RoutingError> {
        let segments: Vec<&str> = key.split('/').collect();
        let Some((last, leading)) = segments.split_last() else {
            return Err(too_few(key));
        };
        if leading.is_empty() || last.is_empty() {
            return Err(too_few(key));
        }

        let index = leading.join("_").to_lowercase();
        if index.chars().all(|c| c == '_') {
            // 🕳️ "//thing.json" joins to "_", which is an index name in the same way "" is a password
            return Err(too_few(key));
        }

        let stem = strip_extension(last);
        let doc_id = match self.taxonomy_of(leading[0]) {
            Taxonomy::PathId => stem.to_string(),
            Taxonomy::HashedId => format!("{:x}", Sha256::digest(stem.as_bytes())),
        };

        Ok(IndexTarget { index, doc_id })
    }

    /// 🔙 Rebuild a storage key from a target: `_` becomes `/`, the provider segment gets
    /// its canonical casing back, and `{doc_id}.json` goes on the end.
    ///
    /// Routing the result yields the same target again. Hashed targets refuse.
    pub fn invert(&self, target: &IndexTarget) -> Result<String, RoutingError> {
        let mut segments: Vec<String> = target.index.split('_').map(str::to_string).collect();

        if let Some(first) = segments.first_mut() {
            if self.taxonomy_of(first) == Taxonomy::HashedId {
                return Err(RoutingError::NotInvertible {
                    index: target.index.clone(),
                    doc_id: target.doc_id.clone(),
                });
            }
            if let Some(canonical) = self
                .provider_prefixes
                .iter()
                .find(|provider| provider.eq_ignore_ascii_case(first))
            {
                *first = canonical.clone();
            }
        }

        Ok(format!("{}/{}.json", segments.join("/"), target.doc_id))
    }
}

fn too_few(key: &str) -> RoutingError {
    RoutingError::TooFewSegments {
        key: key.to_string(),
    }
}

/// ✂️ `i-0123.json` → `i-0123`. `archive.tar.gz` → `archive.tar`. `.json` stays `.json`.
fn strip_extension(segment: &str) -> &str {
    match segment.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => segment,
    }
}

/// 🔣 Notification keys arrive URL-encoded with `+` standing in for spaces.
///
/// Pluses are turned into spaces first, then `%XX` sequences are decoded, so an encoded
/// plus (`%2B`) survives as a literal `+`.
pub fn decode_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// 🔣 The reverse of [`decode_key`], used when a key goes back out in a requeue message.
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}
