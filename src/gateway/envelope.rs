//! Frame envelope parsing and outbound envelopes
//!
//! Inbound: `{observerId, frameId, timestamp, image}` where `frameId` is a
//! string or number, `timestamp` is epoch millis or ISO-8601 and `image` is
//! base64 (a `data:` URL prefix is tolerated).

use crate::models::{FailureKind, RecognitionOutcome};
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};

/// Validated inbound frame
#[derive(Debug, Clone)]
pub struct FrameEnvelope {
    pub observer_id: String,
    pub frame_id: String,
    /// Timestamp as received, echoed back verbatim
    pub timestamp: Value,
    pub captured_at: DateTime<Utc>,
    pub image: Vec<u8>,
}

/// Rejected envelope; carries whatever ids could be read for the echo
#[derive(Debug, Clone, thiserror::Error)]
#[error("{detail}")]
pub struct EnvelopeError {
    pub frame_id: Option<String>,
    pub timestamp: Option<Value>,
    pub detail: String,
}

impl EnvelopeError {
    fn new(frame_id: Option<String>, timestamp: Option<Value>, detail: impl Into<String>) -> Self {
        Self {
            frame_id,
            timestamp,
            detail: detail.into(),
        }
    }

    /// Outbound `Invalid data format` envelope
    pub fn to_envelope(&self) -> Value {
        error_envelope(
            self.frame_id.as_deref(),
            self.timestamp.as_ref(),
            FailureKind::InvalidFormat,
            &self.detail,
        )
    }
}

/// Parse and validate one websocket text message
pub fn parse_frame(text: &str) -> Result<FrameEnvelope, EnvelopeError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| EnvelopeError::new(None, None, format!("Message is not valid JSON: {}", e)))?;

    let Value::Object(obj) = value else {
        return Err(EnvelopeError::new(None, None, "Message is not a JSON object"));
    };

    let frame_id = normalize_frame_id(obj.get("frameId"));
    let timestamp = obj.get("timestamp").filter(|v| !v.is_null()).cloned();
    let reject = |detail: &str| EnvelopeError::new(frame_id.clone(), timestamp.clone(), detail);

    let observer_id = match obj.get("observerId") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        _ => return Err(reject("Missing or empty observerId")),
    };

    let frame_id_value = match &frame_id {
        Some(id) => id.clone(),
        None => return Err(reject("Missing or empty frameId")),
    };

    let captured_at = match &timestamp {
        Some(raw) => parse_timestamp(raw).ok_or_else(|| {
            reject("timestamp must be epoch milliseconds or ISO-8601")
        })?,
        None => return Err(reject("Missing timestamp")),
    };

    let image = match obj.get("image") {
        Some(Value::String(s)) if !s.trim().is_empty() => decode_image(s)
            .ok_or_else(|| reject("image is not valid base64"))?,
        _ => return Err(reject("Missing or empty image")),
    };

    Ok(FrameEnvelope {
        observer_id,
        frame_id: frame_id_value,
        timestamp: timestamp.unwrap_or(Value::Null),
        captured_at,
        image,
    })
}

/// String ids pass through; numeric ids become their decimal form
fn normalize_frame_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Epoch millis (number or digit string) or RFC 3339
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(millis) = s.parse::<i64>() {
                return Utc.timestamp_millis_opt(millis).single();
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }
        _ => None,
    }
}

fn decode_image(data: &str) -> Option<Vec<u8>> {
    let payload = match data.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, b64)| b64)?,
        None => data,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .ok()?;
    (!bytes.is_empty()).then_some(bytes)
}

/// `{frameId, timestamp, error, details}`
pub fn error_envelope(
    frame_id: Option<&str>,
    timestamp: Option<&Value>,
    kind: FailureKind,
    details: &str,
) -> Value {
    let mut map = Map::new();
    if let Some(frame_id) = frame_id {
        map.insert("frameId".to_string(), Value::String(frame_id.to_string()));
    }
    if let Some(timestamp) = timestamp {
        map.insert("timestamp".to_string(), timestamp.clone());
    }
    map.insert("error".to_string(), Value::String(kind.label().to_string()));
    map.insert("details".to_string(), Value::String(details.to_string()));
    Value::Object(map)
}

/// Outbound envelope for a finished task
pub fn outcome_envelope(outcome: &RecognitionOutcome, timestamp: &Value) -> Value {
    if let Some(error) = &outcome.error {
        return error_envelope(
            Some(&outcome.frame_id),
            Some(timestamp),
            error.kind,
            &error.detail,
        );
    }

    match (&outcome.person, outcome.found) {
        (Some(person), true) => json!({
            "frameId": outcome.frame_id,
            "timestamp": timestamp,
            "found": true,
            "person": person,
            "confidence": outcome.confidence,
        }),
        _ => json!({
            "frameId": outcome.frame_id,
            "timestamp": timestamp,
            "found": false,
            "message": outcome.message.clone().unwrap_or_default(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(data: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }

    #[test]
    fn test_parse_valid_frame() {
        let text = json!({
            "observerId": "obs1",
            "frameId": "f1",
            "timestamp": 1_700_000_000_000i64,
            "image": b64(b"jpeg-bytes"),
        })
        .to_string();

        let frame = parse_frame(&text).unwrap();
        assert_eq!(frame.observer_id, "obs1");
        assert_eq!(frame.frame_id, "f1");
        assert_eq!(frame.timestamp, json!(1_700_000_000_000i64));
        assert_eq!(frame.captured_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(frame.image, b"jpeg-bytes");
    }

    #[test]
    fn test_numeric_frame_id_and_iso_timestamp() {
        let text = json!({
            "observerId": "obs1",
            "frameId": 42,
            "timestamp": "2023-11-14T22:13:20.000Z",
            "image": format!("data:image/jpeg;base64,{}", b64(b"x")),
        })
        .to_string();

        let frame = parse_frame(&text).unwrap();
        assert_eq!(frame.frame_id, "42");
        assert_eq!(frame.timestamp, json!("2023-11-14T22:13:20.000Z"));
        assert_eq!(frame.captured_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(frame.image, b"x");
    }

    #[test]
    fn test_missing_fields_echo_ids() {
        let text = json!({"frameId": "f9", "timestamp": 5, "image": b64(b"x")}).to_string();
        let err = parse_frame(&text).unwrap_err();
        assert_eq!(err.frame_id.as_deref(), Some("f9"));

        let envelope = err.to_envelope();
        assert_eq!(envelope["frameId"], "f9");
        assert_eq!(envelope["timestamp"], 5);
        assert_eq!(envelope["error"], "Invalid data format");

        let text = json!({"observerId": "obs1", "frameId": "f9", "timestamp": 5}).to_string();
        assert!(parse_frame(&text).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        let err = parse_frame("not json").unwrap_err();
        assert!(err.frame_id.is_none());
        let envelope = err.to_envelope();
        assert!(envelope.get("frameId").is_none());
        assert_eq!(envelope["error"], "Invalid data format");

        assert!(parse_frame("[1,2]").is_err());

        let bad_image = json!({
            "observerId": "obs1", "frameId": "f1", "timestamp": 1, "image": "***"
        })
        .to_string();
        assert!(parse_frame(&bad_image).is_err());

        let bad_ts = json!({
            "observerId": "obs1", "frameId": "f1", "timestamp": "yesterday", "image": b64(b"x")
        })
        .to_string();
        assert_eq!(
            parse_frame(&bad_ts).unwrap_err().timestamp,
            Some(json!("yesterday"))
        );
    }

    #[test]
    fn test_no_match_envelope() {
        let outcome = RecognitionOutcome::no_match("f1", Some("No faces detected".to_string()));
        assert_eq!(
            outcome_envelope(&outcome, &json!("t0")),
            json!({"frameId": "f1", "timestamp": "t0", "found": false, "message": "No faces detected"})
        );
    }

    #[test]
    fn test_failure_envelope() {
        let outcome =
            RecognitionOutcome::failed("f1", FailureKind::ProcessFailure, "model load failed");
        assert_eq!(
            outcome_envelope(&outcome, &json!(1)),
            json!({
                "frameId": "f1",
                "timestamp": 1,
                "error": "Recognition failed",
                "details": "model load failed"
            })
        );
    }
}
