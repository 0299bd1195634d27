//! 🔄 Transforms: make collector output palatable to the cluster, then wrap it for `_bulk`.
//!
//! 🎬 COLD OPEN: INT. MAPPING CONFLICT. 2:47 AM.
//!
//! Document A says `"Principal": "*"`. Document B says `"Principal": {"AWS": "arn:..."}`.
//! The cluster saw A first, decided `Principal` is a string forever, and now rejects B
//! with a `mapper_parsing_exception` and the quiet smugness of a DMV clerk.
//! Meanwhile the capture timestamps show up with microseconds on Tuesdays and without
//! them on Wednesdays, and the date format accepts exactly one of those.
//!
//! This module is the diplomatic corps.
//!
//! ```text
//!   raw JSON text ──▶ [PrincipalFixup] ──▶ [CaptureTimeFixup] ──▶ Value ──▶ [ElasticsearchBulk] ──▶ NDJSON unit
//!                      (text or tree)        (top-level only)                 (command + doc)
//! ```
//!
//! Every transform is a zero-sized marker type with static methods, same as it ever was.
//!
//! ## Knowledge Graph 🧠
//! - Used by: `supervisors` (fixups per fetched object), `composers` (egress per document)
//! - Config: `ingest.principal_fixup` picks text or tree mode 🦆

use crate::app_config::PrincipalFixupMode;
use crate::common::IndexableDocument;
use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

pub mod capture_time;
pub mod elasticsearch;
pub mod principal;

pub use capture_time::CaptureTimeFixup;
pub use elasticsearch::ElasticsearchBulk;
pub use principal::PrincipalFixup;

/// 🩹 A document-level repair. Mutates in place, reports whether it changed anything.
///
/// Must be idempotent: running a fixup on its own output is a no-op. Retries and
/// requeues replay the whole pipeline, and the cluster should never notice.
pub trait DocumentFixup {
    fn fix(document: &mut Value) -> bool;
}

/// 📤 Turns one document into the exact bytes a sink will send for it.
pub trait EgressTransform {
    fn render(document: &IndexableDocument) -> Result<String>;
}

/// 🧰 The full fixup chain applied to every fetched object, in a fixed order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaFixups {
    principal_mode: PrincipalFixupMode,
}

impl SchemaFixups {
    pub fn new(principal_mode: PrincipalFixupMode) -> Self {
        Self { principal_mode }
    }

    /// 🔄 Raw object text in, parsed and repaired document out.
    ///
    /// Fails only when the text isn't JSON. That's on the collector, not us.
    pub fn apply(&self, raw: &str) -> Result<Value> {
        let (mut document, principal_changed) = match self.principal_mode {
            PrincipalFixupMode::Text => {
                let fixed = PrincipalFixup::fix_text(raw);
                let changed = matches!(fixed, std::borrow::Cow::Owned(_));
                let document: Value = serde_json::from_str(&fixed)
                    .context("💀 Object is not valid JSON after the principal text fixup")?;
                (document, changed)
            }
            PrincipalFixupMode::Structural => {
                let mut document: Value =
                    serde_json::from_str(raw).context("💀 Object is not valid JSON")?;
                let changed = PrincipalFixup::fix(&mut document);
                (document, changed)
            }
        };
        let time_changed = CaptureTimeFixup::fix(&mut document);

        if principal_changed || time_changed {
            debug!(
                "🩹 Fixups applied (principal: {}, capture time: {})",
                principal_changed, time_changed
            );
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;

    const THE_BUCKET_POLICY: &str = r#"{
        "configurationItemCaptureTime": "2024-01-02 03:04:05",
        "resourceType": "AWS::S3::Bucket",
        "supplementaryConfiguration": {
            "BucketPolicy": {"Statement": [{"Effect": "Allow", "Principal":"*", "Action": "s3:GetObject"}]}
        }
    }"#;

    #[test]
    fn the_one_where_both_modes_agree_on_the_usual_suspects() -> Result<()> {
        let the_tree = SchemaFixups::new(PrincipalFixupMode::Structural).apply(THE_BUCKET_POLICY)?;
        let the_text = SchemaFixups::new(PrincipalFixupMode::Text).apply(THE_BUCKET_POLICY)?;
        assert_eq!(the_tree, the_text);
        assert_eq!(
            the_tree["supplementaryConfiguration"]["BucketPolicy"]["Statement"][0]["Principal"],
            json!({"ALL": "*"})
        );
        assert_eq!(the_tree["configurationItemCaptureTime"], "2024-01-02 03:04:05.000000");
        Ok(())
    }

    #[test]
    fn the_one_where_fixing_twice_changes_nothing_the_second_time() -> Result<()> {
        let the_fixups = SchemaFixups::default();
        let the_once = the_fixups.apply(THE_BUCKET_POLICY)?;
        let the_twice = the_fixups.apply(&the_once.to_string())?;
        assert_eq!(the_once, the_twice);
        Ok(())
    }

    #[test]
    fn the_one_where_a_document_with_nothing_to_fix_comes_back_byte_for_byte() -> Result<()> {
        let the_raw = r#"{"resourceId":"i-1","counter":123456789012345678901234567890,"ratio":1e2,"negative":-0.000000000000000000001,"nested":{"z":1,"a":2}}"#;
        for the_mode in [PrincipalFixupMode::Structural, PrincipalFixupMode::Text] {
            let the_fixed = SchemaFixups::new(the_mode).apply(the_raw)?;
            assert_eq!(the_fixed.to_string(), the_raw, "{:?} mode altered an untouched document", the_mode);
            assert_eq!(the_fixed["counter"].to_string(), "123456789012345678901234567890");
            assert_eq!(the_fixed["ratio"].to_string(), "1e2");
        }
        Ok(())
    }

    #[test]
    fn the_one_where_garbage_in_is_an_error_out() {
        assert!(SchemaFixups::default().apply("{\"half\": ").is_err());
        assert!(SchemaFixups::new(PrincipalFixupMode::Text).apply("nope").is_err());
    }
}
