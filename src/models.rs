//! Shared models and types for the frame pipeline
//!
//! This module contains types shared across multiple modules
//! to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub dispatch_mode: String,
    pub ledger_ok: bool,
}

/// One accepted frame on its way to the recognition engine.
///
/// Created by the gateway once admission succeeds; the image bytes move with
/// the task and are only materialized to disk by the engine adapter.
#[derive(Clone, PartialEq)]
pub struct FrameTask {
    pub observer_id: String,
    pub frame_id: String,
    pub captured_at: DateTime<Utc>,
    pub image: Vec<u8>,
}

impl fmt::Debug for FrameTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTask")
            .field("observer_id", &self.observer_id)
            .field("frame_id", &self.frame_id)
            .field("captured_at", &self.captured_at)
            .field("image_len", &self.image.len())
            .finish()
    }
}

/// Person identifier as reported by the engine or the person directory.
///
/// Numeric ids stay numeric on the wire (`{"id": 7}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PersonId {
    Number(i64),
    Text(String),
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersonId::Number(n) => write!(f, "{}", n),
            PersonId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for PersonId {
    fn from(n: i64) -> Self {
        PersonId::Number(n)
    }
}

impl From<&str> for PersonId {
    fn from(s: &str) -> Self {
        PersonId::Text(s.to_string())
    }
}

/// Matched person
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    pub name: String,
}

/// Per-task failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed or incomplete inbound envelope (never dispatched)
    InvalidFormat,
    /// Queue unreachable at submit time
    DispatchUnavailable,
    /// Engine exceeded its time budget and was killed
    Timeout,
    /// Engine exited non-zero or could not be run
    ProcessFailure,
    /// Engine exited zero but stdout was not a verdict
    MalformedOutput,
}

impl FailureKind {
    /// Text of the `error` field in outbound error envelopes
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::InvalidFormat => "Invalid data format",
            FailureKind::DispatchUnavailable => "Dispatch unavailable",
            FailureKind::Timeout => "Timeout exceeded",
            FailureKind::ProcessFailure => "Recognition failed",
            FailureKind::MalformedOutput => "Invalid recognition output",
        }
    }
}

/// Failure carried by an outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub kind: FailureKind,
    pub detail: String,
}

impl OutcomeError {
    /// Reason written to the ledger status column (`Error: <reason>`)
    pub fn audit_reason(&self) -> String {
        match self.kind {
            FailureKind::ProcessFailure if !self.detail.trim().is_empty() => {
                self.detail.trim().to_string()
            }
            kind => kind.label().to_string(),
        }
    }
}

/// Terminal result of one frame task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionOutcome {
    pub frame_id: String,
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person: Option<Person>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
}

/// Default message for a verdict without a match
pub const NO_MATCH_MESSAGE: &str = "No matching person found";

impl RecognitionOutcome {
    pub fn matched(frame_id: impl Into<String>, person: Person, confidence: f64) -> Self {
        Self {
            frame_id: frame_id.into(),
            found: true,
            person: Some(person),
            confidence,
            message: None,
            error: None,
        }
    }

    pub fn no_match(frame_id: impl Into<String>, message: Option<String>) -> Self {
        Self {
            frame_id: frame_id.into(),
            found: false,
            person: None,
            confidence: 0.0,
            message: Some(message.unwrap_or_else(|| NO_MATCH_MESSAGE.to_string())),
            error: None,
        }
    }

    pub fn failed(frame_id: impl Into<String>, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            frame_id: frame_id.into(),
            found: false,
            person: None,
            confidence: 0.0,
            message: None,
            error: Some(OutcomeError {
                kind,
                detail: detail.into(),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_person_id_serialization() {
        let person = Person {
            id: PersonId::Number(7),
            name: "Alice".to_string(),
        };
        let json = serde_json::to_value(&person).unwrap();
        assert_eq!(json, serde_json::json!({"id": 7, "name": "Alice"}));

        let parsed: Person = serde_json::from_str(r#"{"id":"p-9","name":"Bob"}"#).unwrap();
        assert_eq!(parsed.id, PersonId::Text("p-9".to_string()));
        assert_eq!(parsed.id.to_string(), "p-9");
    }

    #[test]
    fn test_no_match_reports_zero_confidence() {
        let outcome = RecognitionOutcome::no_match("f1", None);
        assert!(!outcome.found);
        assert!(outcome.person.is_none());
        assert_eq!(outcome.confidence, 0.0);
        assert_eq!(outcome.message.as_deref(), Some(NO_MATCH_MESSAGE));
    }

    #[test]
    fn test_audit_reason() {
        let err = OutcomeError {
            kind: FailureKind::ProcessFailure,
            detail: "model load failed\n".to_string(),
        };
        assert_eq!(err.audit_reason(), "model load failed");

        let err = OutcomeError {
            kind: FailureKind::Timeout,
            detail: "engine exceeded 10s".to_string(),
        };
        assert_eq!(err.audit_reason(), "Timeout exceeded");

        let err = OutcomeError {
            kind: FailureKind::ProcessFailure,
            detail: "  ".to_string(),
        };
        assert_eq!(err.audit_reason(), "Recognition failed");
    }
}
