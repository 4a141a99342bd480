// Tool result shaping: text extraction, image-data redaction, truncation
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::debug;

/// Upper bound on a tool call's text result; anything longer is cut.
pub const MAX_OUTPUT_LEN: usize = 15_000;
pub const TRUNCATION_NOTICE: &str = "\n\n... (output truncated to prevent token limit overflow)";

/// A `data` field at least this long is treated as an inline binary payload.
const INLINE_DATA_MIN: usize = 1000;
/// Outputs shorter than this are never scanned for stray payloads.
const REDACT_SCAN_MIN: usize = 5000;

static IMAGE_DATA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""data":\s*"([A-Za-z0-9+/=]{1000,})""#).unwrap());

/// Normalizes a tool call result into the string handed to callers:
/// extraction per the content policy, then payload redaction and length
/// capping so one screenshot-sized result cannot blow up the caller.
pub fn normalize_result(result: &Value) -> String {
    truncate_output(redact_image_data(extract_text(result)))
}

/// Extraction policy: a `content` array is joined item by item with
/// newlines, using each item's `text` or, failing that, its string form;
/// a non-array `content` is stringified directly; a result without
/// `content` is stringified whole. Stringification never fails.
pub fn extract_text(result: &Value) -> String {
    let Some(object) = result.as_object() else {
        return stringify(result);
    };

    if let Some(content) = object.get("content") {
        let Some(items) = content.as_array() else {
            return stringify(content);
        };
        let parts: Vec<String> = items.iter().map(content_item_text).collect();
        return parts.join("\n");
    }

    if let Some(error) = object.get("error") {
        return format!("Error: {}", stringify(error));
    }

    stringify(result)
}

fn content_item_text(item: &Value) -> String {
    if let Some(fields) = item.as_object() {
        // Inline binary payloads (screenshots and the like) are replaced by
        // a placeholder before stringification.
        if let Some(data) = fields.get("data").and_then(Value::as_str) {
            if data.len() > INLINE_DATA_MIN {
                let mime = fields
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                debug!(bytes = data.len(), mime, "replacing inline image data");
                let mut replaced = fields.clone();
                replaced.insert(
                    "data".to_string(),
                    Value::String(format!("[Image data - {} chars, type: {}]", data.len(), mime)),
                );
                return stringify(&Value::Object(replaced));
            }
        }
        if let Some(text) = fields.get("text").and_then(Value::as_str) {
            return text.to_string();
        }
    }
    stringify(item)
}

/// String form of a value: strings yield their contents, everything else
/// its JSON rendering (deterministic; object keys are ordered).
fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn redact_image_data(output: String) -> String {
    if output.len() <= REDACT_SCAN_MIN || !output.contains("\"data\":") {
        return output;
    }
    IMAGE_DATA
        .replace_all(&output, |caps: &Captures<'_>| {
            format!("\"data\":\"[Image data - {} chars]\"", caps[1].len())
        })
        .into_owned()
}

fn truncate_output(mut output: String) -> String {
    if output.len() <= MAX_OUTPUT_LEN {
        return output;
    }
    let mut cut = MAX_OUTPUT_LEN;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    debug!(from = output.len(), to = cut, "truncating oversized output");
    output.truncate(cut);
    output.push_str(TRUNCATION_NOTICE);
    output
}
