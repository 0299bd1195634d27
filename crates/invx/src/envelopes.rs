//! 🪆 Envelope normalization: peel the matryoshka until only storage-write records remain.
//!
//! 🎬 A single "object was written" fact can arrive:
//! - raw, as a storage notification record
//! - inside a bus message (`Sns.Message` / `Message`, a JSON *string*)
//! - inside a queue message (`body`, also a JSON *string*)
//! - inside a queue message inside a bus message inside a batch, because fan-out is a lifestyle
//!
//! Every layer is identified by its `EventSource`/`eventSource` tag, with two shape-based
//! fallbacks: a bare `TopicArn` means bus, and `s3.bucket.name` + `s3.object.key` means
//! storage write (our own requeue messages look exactly like that).
//!
//! 🚫 Anything we don't recognize is logged and dropped. Never fatal. One weird record
//! does not get to ruin the batch for everyone else.

use crate::common::StorageWriteRecord;
use crate::routing::decode_key;
use serde_json::Value;
use tracing::{debug, warn};

/// 🪜 How deep we'll dig before assuming someone built an envelope loop.
const MAX_ENVELOPE_DEPTH: usize = 16;

/// 🏷️ Where the source tag lives, depending on which service wrote the envelope.
const SOURCE_TAG_KEYS: [&str; 2] = ["EventSource", "eventSource"];

/// 🔄 Requeue counter we stamp onto records we send back through the queue.
pub const REQUEUE_ATTEMPT_FIELD: &str = "requeueAttempt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvelopeSource {
    Bus,
    Queue,
    StorageWrite,
}

const KNOWN_SOURCES: [(&str, EnvelopeSource); 3] = [
    ("aws:sns", EnvelopeSource::Bus),
    ("aws:sqs", EnvelopeSource::Queue),
    ("aws:s3", EnvelopeSource::StorageWrite),
];

/// 🪆 One layer of the doll, classified.
#[derive(Debug, PartialEq)]
pub enum Envelope<'a> {
    /// `{"Records": [...]}`: each child is its own envelope.
    Batch(&'a [Value]),
    /// Queue delivery. The payload is the JSON text in `body`.
    Queue(&'a str),
    /// Bus delivery. The payload is the JSON text in `Sns.Message` or `Message`.
    Bus(&'a str),
    /// The innermost fact: an object landed.
    StorageWrite(StorageWriteRecord),
    /// Shape we don't know, or a known tag with the wrong fields.
    Unrecognized,
}

/// 📬 Everything one invocation payload unwrapped into.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Normalized {
    pub records: Vec<StorageWriteRecord>,
    /// 🗑️ Envelopes dropped along the way (unknown shape, unparseable inner JSON, too deep).
    pub dropped: usize,
}

/// 🔍 Classify exactly one layer. No recursion, no parsing of inner strings.
pub fn classify(value: &Value) -> Envelope<'_> {
    if let Some(records) = value.get("Records") {
        return match records.as_array() {
            Some(children) => Envelope::Batch(children),
            None => Envelope::Unrecognized,
        };
    }

    match detect_source(value) {
        Some(EnvelopeSource::Bus) => value
            .get("Sns")
            .and_then(|sns| sns.get("Message"))
            .or_else(|| value.get("Message"))
            .and_then(Value::as_str)
            .map_or(Envelope::Unrecognized, Envelope::Bus),
        Some(EnvelopeSource::Queue) => value
            .get("body")
            .and_then(Value::as_str)
            .map_or(Envelope::Unrecognized, Envelope::Queue),
        Some(EnvelopeSource::StorageWrite) => {
            storage_write_from(value).map_or(Envelope::Unrecognized, Envelope::StorageWrite)
        }
        None => Envelope::Unrecognized,
    }
}

fn detect_source(value: &Value) -> Option<EnvelopeSource> {
    let tagged = SOURCE_TAG_KEYS
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str));
    if let Some(tag) = tagged {
        return KNOWN_SOURCES
            .iter()
            .find(|(known, _)| *known == tag)
            .map(|(_, source)| *source);
    }
    if value.get("TopicArn").is_some() {
        return Some(EnvelopeSource::Bus);
    }
    if storage_write_from(value).is_some() {
        return Some(EnvelopeSource::StorageWrite);
    }
    None
}

/// 🪣 `s3.bucket.name` + `s3.object.key` (+ optional `requeueAttempt`) → record.
fn storage_write_from(value: &Value) -> Option<StorageWriteRecord> {
    let s3 = value.get("s3")?;
    let bucket = s3.get("bucket")?.get("name")?.as_str()?;
    let raw_key = s3.get("object")?.get("key")?.as_str()?;
    let attempt = value
        .get(REQUEUE_ATTEMPT_FIELD)
        .and_then(Value::as_u64)
        .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX));

    Some(StorageWriteRecord {
        bucket: bucket.to_string(),
        key: decode_key(raw_key),
        attempt,
    })
}

/// 🪆 Unwrap an invocation payload all the way down, in order.
pub fn normalize(payload: &Value) -> Normalized {
    let mut normalized = Normalized::default();
    unwrap_into(payload, 0, &mut normalized);
    normalized
}

fn unwrap_into(value: &Value, depth: usize, out: &mut Normalized) {
    if depth > MAX_ENVELOPE_DEPTH {
        warn!(
            "🪆 Envelope nesting deeper than {} layers, dropping it. Somebody built a loop.",
            MAX_ENVELOPE_DEPTH
        );
        out.dropped += 1;
        return;
    }

    match classify(value) {
        Envelope::Batch(children) => {
            for child in children {
                unwrap_into(child, depth + 1, out);
            }
        }
        Envelope::Queue(body) => {
            debug!("📨 Unwrapping queue message at depth {}", depth);
            unwrap_text(body, depth, out);
        }
        Envelope::Bus(message) => {
            debug!("📢 Unwrapping bus message at depth {}", depth);
            unwrap_text(message, depth, out);
        }
        Envelope::StorageWrite(record) => {
            debug!("🪣 Found storage write {} (attempt {})", record.uri(), record.attempt);
            out.records.push(record);
        }
        Envelope::Unrecognized => {
            warn!("🤷 Unrecognized envelope, dropping it: {}", abbreviate(value));
            out.dropped += 1;
        }
    }
}

fn unwrap_text(text: &str, depth: usize, out: &mut Normalized) {
    match serde_json::from_str::<Value>(text) {
        Ok(inner) => unwrap_into(&inner, depth + 1, out),
        Err(err) => {
            warn!("💀 Inner envelope is not valid JSON ({}), dropping it", err);
            out.dropped += 1;
        }
    }
}

/// ✂️ Unknown envelopes can be big. Logs should not be.
fn abbreviate(value: &Value) -> String {
    const LIMIT: usize = 256;
    let rendered = value.to_string();
    if rendered.len() <= LIMIT {
        return rendered;
    }
    let mut cut = LIMIT;
    while !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &rendered[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn the_storage_record(key: &str) -> Value {
        json!({
            "eventSource": "aws:s3",
            "eventName": "ObjectCreated:Put",
            "s3": {"bucket": {"name": "inventory"}, "object": {"key": key, "size": 512}}
        })
    }

    fn the_queue_message(body: &Value) -> Value {
        json!({"eventSource": "aws:sqs", "messageId": "m-1", "body": body.to_string()})
    }

    fn the_bus_message(message: &Value) -> Value {
        json!({"EventSource": "aws:sns", "Sns": {"TopicArn": "arn:aws:sns:t", "Message": message.to_string()}})
    }

    #[test]
    fn the_one_where_a_bare_notification_unwraps_to_itself() {
        let the_payload = json!({"Records": [the_storage_record("Resources/ec2/instance/i-1.json")]});
        let the_normalized = normalize(&the_payload);
        assert_eq!(
            the_normalized.records,
            vec![StorageWriteRecord::new("inventory", "Resources/ec2/instance/i-1.json")]
        );
        assert_eq!(the_normalized.dropped, 0);
    }

    #[test]
    fn the_one_where_the_matryoshka_goes_queue_bus_batch_storage() {
        let the_inner = json!({"Records": [
            the_storage_record("Resources/ec2/instance/i-1.json"),
            the_storage_record("Resources/ec2/instance/i-2.json"),
        ]});
        let the_payload = json!({"Records": [the_queue_message(&the_bus_message(&the_inner))]});

        let the_keys: Vec<String> = normalize(&the_payload)
            .records
            .into_iter()
            .map(|record| record.key)
            .collect();
        assert_eq!(
            the_keys,
            vec!["Resources/ec2/instance/i-1.json", "Resources/ec2/instance/i-2.json"]
        );
    }

    #[test]
    fn the_one_where_the_bus_invokes_us_directly_with_no_queue_in_between() {
        let the_inner = json!({"Records": [
            the_storage_record("Resources/s3/bucket/logs.json"),
            the_storage_record("Azure-Resources/vm/instance/vm-1.json"),
        ]});
        let the_payload = json!({"Records": [the_bus_message(&the_inner)]});

        assert_eq!(classify(&the_payload["Records"][0]), Envelope::Bus(the_inner.to_string().as_str()));
        let the_normalized = normalize(&the_payload);
        assert_eq!(
            the_normalized.records,
            vec![
                StorageWriteRecord::new("inventory", "Resources/s3/bucket/logs.json"),
                StorageWriteRecord::new("inventory", "Azure-Resources/vm/instance/vm-1.json"),
            ]
        );
        assert_eq!(the_normalized.dropped, 0);
    }

    #[test]
    fn the_one_where_a_raw_bus_notification_has_only_a_topic_arn() {
        // 🎯 bus → queue with raw delivery off: the queue body is the notification itself
        let the_notification = json!({
            "Type": "Notification",
            "TopicArn": "arn:aws:sns:us-east-1:1:inventory",
            "Message": json!({"Records": [the_storage_record("Resources/iam/role/r.json")]}).to_string()
        });
        let the_payload = json!({"Records": [the_queue_message(&the_notification)]});
        assert_eq!(normalize(&the_payload).records.len(), 1);
    }

    #[test]
    fn the_one_where_requeued_records_come_home_with_their_attempt_count() {
        let the_requeued = json!({"Records": [{
            "s3": {"bucket": {"name": "inventory"}, "object": {"key": "Resources/ec2/instance/i-9.json"}},
            "requeueAttempt": 3
        }]});
        let the_payload = json!({"Records": [the_queue_message(&the_requeued)]});
        let the_normalized = normalize(&the_payload);
        assert_eq!(the_normalized.records[0].attempt, 3);
        assert_eq!(the_normalized.records[0].bucket, "inventory");
    }

    #[test]
    fn the_one_where_keys_are_decoded_on_the_way_in() {
        let the_payload = json!({"Records": [the_storage_record("Resources/s3/bucket/my+logs%2Bbackup.json")]});
        assert_eq!(
            normalize(&the_payload).records[0].key,
            "Resources/s3/bucket/my logs+backup.json"
        );
    }

    #[test]
    fn the_one_where_junk_is_counted_and_the_rest_survives() {
        let the_payload = json!({"Records": [
            {"eventSource": "aws:dynamodb", "dynamodb": {}},
            {"eventSource": "aws:sqs", "body": "{not json"},
            {"Service": "Amazon S3", "Event": "s3:TestEvent"},
            {"eventSource": "aws:s3", "s3": {"bucket": {"name": "inventory"}}},
            the_storage_record("Resources/ec2/instance/i-1.json"),
        ]});
        let the_normalized = normalize(&the_payload);
        assert_eq!(the_normalized.records.len(), 1);
        assert_eq!(the_normalized.dropped, 4);
    }

    #[test]
    fn the_one_where_an_empty_batch_is_perfectly_fine() {
        assert_eq!(normalize(&json!({"Records": []})), Normalized::default());
    }

    #[test]
    fn the_one_where_an_endless_doll_hits_the_depth_guard() {
        let mut the_value = json!({"Records": [the_storage_record("Resources/a/b.json")]});
        for _ in 0..(MAX_ENVELOPE_DEPTH + 2) {
            the_value = json!({"Records": [the_value]});
        }
        let the_normalized = normalize(&the_value);
        assert!(the_normalized.records.is_empty());
        assert_eq!(the_normalized.dropped, 1);
    }

    #[test]
    fn the_one_where_classify_only_peels_one_layer() {
        let the_message = the_queue_message(&json!({"Records": []}));
        assert!(matches!(classify(&the_message), Envelope::Queue(_)));
        assert_eq!(classify(&json!({"Records": "nope"})), Envelope::Unrecognized);
        assert_eq!(classify(&json!(42)), Envelope::Unrecognized);
    }
}
