//! 🔐 Principal fixup: `"Principal": "*"` becomes `"Principal": {"ALL": "*"}`.
//!
//! Policy documents use `Principal` as either a bare `"*"` or an object of principal
//! lists. The cluster can only map one of those, and the object form is the one that
//! carries information, so the wildcard string gets promoted to an object.
//!
//! Two modes:
//! - tree (default): walk the parsed document, touch only real `Principal` members.
//! - text: byte-scan the raw JSON before parsing. Faster on huge objects, but it will
//!   also rewrite a string *value* that happens to contain `"Principal":"*"` verbatim.
//!   Whitespace layout doesn't matter to either mode.

use super::DocumentFixup;
use memchr::memmem;
use serde_json::{Value, json};
use std::borrow::Cow;

const PRINCIPAL_FIELD: &str = "Principal";
const WILDCARD: &str = "*";
const TEXT_NEEDLE: &[u8] = b"\"Principal\"";
const TEXT_WILDCARD: &[u8] = b"\"*\"";
const TEXT_REPLACEMENT: &str = "\"Principal\": { \"ALL\": \"*\" }";

pub struct PrincipalFixup;

impl PrincipalFixup {
    /// 🔍 Text mode. Matches `"Principal"`, a colon, then `"*"`, with any JSON whitespace
    /// on either side of the colon (`"Principal" : "*"`, `"Principal":\n  "*"`, ...).
    ///
    /// Returns `Cow::Borrowed` when nothing matched, so the common case doesn't allocate.
    pub fn fix_text(raw: &str) -> Cow<'_, str> {
        let bytes = raw.as_bytes();
        let mut fixed: Option<String> = None;
        let mut cursor = 0;

        for start in memmem::find_iter(bytes, TEXT_NEEDLE) {
            let after_name = skip_whitespace(bytes, start + TEXT_NEEDLE.len());
            if bytes.get(after_name) != Some(&b':') {
                continue;
            }
            let value_start = skip_whitespace(bytes, after_name + 1);
            if !bytes[value_start..].starts_with(TEXT_WILDCARD) {
                continue;
            }
            let out = fixed.get_or_insert_with(|| String::with_capacity(raw.len() + 32));
            out.push_str(&raw[cursor..start]);
            out.push_str(TEXT_REPLACEMENT);
            cursor = value_start + TEXT_WILDCARD.len();
        }

        match fixed {
            Some(mut out) => {
                out.push_str(&raw[cursor..]);
                Cow::Owned(out)
            }
            None => Cow::Borrowed(raw),
        }
    }
}

/// ⏭️ First index at or after `from` that isn't JSON insignificant whitespace.
fn skip_whitespace(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|byte| !matches!(byte, b' ' | b'\t' | b'\n' | b'\r'))
        .map_or(bytes.len(), |offset| from + offset)
}

impl DocumentFixup for PrincipalFixup {
    /// 🌳 Tree mode. Every object member named `Principal` whose value is exactly `"*"`.
    fn fix(document: &mut Value) -> bool {
        match document {
            Value::Object(members) => {
                let mut changed = false;
                for (name, value) in members.iter_mut() {
                    if name == PRINCIPAL_FIELD && value.as_str() == Some(WILDCARD) {
                        *value = json!({"ALL": WILDCARD});
                        changed = true;
                    } else {
                        changed |= Self::fix(value);
                    }
                }
                changed
            }
            Value::Array(items) => items
                .iter_mut()
                .fold(false, |changed, item| Self::fix(item) | changed),
            _ => false,
        }
    }
}
