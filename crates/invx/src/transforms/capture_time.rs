//! ⏱️ Capture-time padding.
//!
//! The index maps `configurationItemCaptureTime` as `yyyy-MM-dd HH:mm:ss.SSSSSS`.
//! Some snapshots leave off the fractional part. Those get `.000000` appended.
//! Only the top-level field counts; nested timestamps are someone else's problem.

use super::DocumentFixup;
use serde_json::Value;

pub const CAPTURE_TIME_FIELD: &str = "configurationItemCaptureTime";
const ZERO_FRACTION: &str = ".000000";

pub struct CaptureTimeFixup;

impl DocumentFixup for CaptureTimeFixup {
    fn fix(document: &mut Value) -> bool {
        let Some(Value::String(timestamp)) = document.get_mut(CAPTURE_TIME_FIELD) else {
            return false;
        };
        if timestamp.contains('.') {
            return false;
        }
        timestamp.push_str(ZERO_FRACTION);
        true
    }
}
