//! 📡 Elasticsearch bulk rendering: one document becomes one command line plus one source line.
//!
//! Rule 1: two lines per document. Action metadata, then the document.
//! Rule 2: newline-delimited. Not comma-separated. Not XML. NEWLINES.
//! Rule 3: every line ends with `\n`, including the last one in the body.
//!
//! The unit returned here already carries both newlines, so a body is just units
//! concatenated, and `unit.len()` is exactly what the unit adds to the request size. 🦆

use super::EgressTransform;
use crate::common::IndexableDocument;
use anyhow::{Context, Result};
use serde::Serialize;

#[derive(Serialize)]
struct BulkCommand<'a> {
    index: BulkCommandTarget<'a>,
}

#[derive(Serialize)]
struct BulkCommandTarget<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_id")]
    id: &'a str,
}

/// 📡 The bulk API's favorite format. No `_type`, no routing, no surprises.
pub struct ElasticsearchBulk;

impl EgressTransform for ElasticsearchBulk {
    /// `{"index":{"_index":"...","_id":"..."}}\n{...document...}\n`
    fn render(document: &IndexableDocument) -> Result<String> {
        let command = BulkCommand {
            index: BulkCommandTarget {
                index: &document.target.index,
                id: &document.target.doc_id,
            },
        };
        let command_line = serde_json::to_string(&command)
            .context("💀 Failed to serialize bulk command line")?;
        let source_line = serde_json::to_string(&document.body).with_context(|| {
            format!("💀 Failed to serialize document {}", document.target)
        })?;

        let mut unit = String::with_capacity(command_line.len() + source_line.len() + 2);
        unit.push_str(&command_line);
        unit.push('\n');
        unit.push_str(&source_line);
        unit.push('\n');
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IndexTarget;
    use serde_json::{Value, json};

    #[test]
    fn the_one_where_a_document_becomes_exactly_two_lines() -> Result<()> {
        let the_doc = IndexableDocument {
            target: IndexTarget::new("resources_ec2_instance", "i-0123"),
            body: json!({"resourceId": "i-0123", "tags": {"Name": "web"}}),
        };
        let the_unit = ElasticsearchBulk::render(&the_doc)?;

        assert!(the_unit.ends_with('\n'));
        let the_lines: Vec<&str> = the_unit.trim_end_matches('\n').split('\n').collect();
        assert_eq!(the_lines.len(), 2);

        let the_command: Value = serde_json::from_str(the_lines[0])?;
        assert_eq!(
            the_command,
            json!({"index": {"_index": "resources_ec2_instance", "_id": "i-0123"}})
        );
        assert!(the_command["index"].get("_type").is_none());

        let the_source: Value = serde_json::from_str(the_lines[1])?;
        assert_eq!(the_source, the_doc.body);
        Ok(())
    }

    #[test]
    fn the_one_where_newlines_inside_strings_stay_escaped() -> Result<()> {
        let the_doc = IndexableDocument {
            target: IndexTarget::new("resources_iam_policy", "p"),
            body: json!({"description": "line one\nline two"}),
        };
        let the_unit = ElasticsearchBulk::render(&the_doc)?;
        assert_eq!(the_unit.matches('\n').count(), 2);
        Ok(())
    }
}
