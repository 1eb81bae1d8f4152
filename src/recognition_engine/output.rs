//! Engine stdout parsing

use super::RecognitionError;
use crate::models::PersonId;
use serde::Deserialize;

/// Raw verdict line printed by the engine
#[derive(Debug, Deserialize)]
struct EngineReport {
    #[serde(default)]
    found: Option<bool>,
    #[serde(default)]
    person: Option<EnginePerson>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Person block; extra columns (age, email, ...) are ignored
#[derive(Debug, Deserialize)]
struct EnginePerson {
    id: PersonId,
    #[serde(default)]
    name: Option<String>,
}

/// Parsed engine verdict
#[derive(Debug, Clone, PartialEq)]
pub enum EngineVerdict {
    Match {
        person_id: PersonId,
        name: Option<String>,
        confidence: f64,
    },
    NoMatch {
        message: Option<String>,
    },
}

/// Parse engine stdout.
///
/// The engine may print diagnostic JSON lines (`{"debug": ...}`) before its
/// verdict, so the last line carrying `found` or `error` wins.
pub fn parse_output(stdout: &str) -> Result<EngineVerdict, RecognitionError> {
    let report = stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<EngineReport>(line).ok())
        .find(|report| report.found.is_some() || report.error.is_some())
        .ok_or_else(|| RecognitionError::MalformedOutput(stdout.to_string()))?;

    if let Some(error) = report.error.filter(|_| report.found.is_none()) {
        return Err(RecognitionError::ProcessFailure(error));
    }

    match report.found {
        Some(true) => {
            let person = report.person.ok_or_else(|| {
                RecognitionError::MalformedOutput(format!(
                    "match reported without person: {}",
                    stdout.trim()
                ))
            })?;
            Ok(EngineVerdict::Match {
                person_id: person.id,
                name: person.name,
                confidence: normalize_confidence(report.confidence),
            })
        }
        _ => Ok(EngineVerdict::NoMatch {
            message: report.message,
        }),
    }
}

/// Map an engine confidence onto [0, 1].
///
/// Values in (1, 100] are percentages. A match without a confidence is
/// reported as certain.
pub fn normalize_confidence(raw: Option<f64>) -> f64 {
    let value = match raw {
        None => return 1.0,
        Some(v) if v.is_nan() => return 0.0,
        Some(v) if v > 1.0 && v <= 100.0 => v / 100.0,
        Some(v) => v,
    };
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match() {
        let verdict = parse_output(
            r#"{"found":true,"person":{"id":7,"name":"Alice"},"confidence":0.92}"#,
        )
        .unwrap();
        assert_eq!(
            verdict,
            EngineVerdict::Match {
                person_id: PersonId::Number(7),
                name: Some("Alice".to_string()),
                confidence: 0.92,
            }
        );
    }

    #[test]
    fn test_debug_lines_are_skipped() {
        let stdout = concat!(
            "{\"debug\": {\"original_mode\": \"RGB\", \"array_shape\": [480, 640, 3]}}\n",
            "{\"found\": false, \"message\": \"No faces detected in the image\"}\n"
        );
        assert_eq!(
            parse_output(stdout).unwrap(),
            EngineVerdict::NoMatch {
                message: Some("No faces detected in the image".to_string())
            }
        );
    }

    #[test]
    fn test_extra_person_fields_ignored() {
        let stdout = r#"{"found":true,"person":{"id":3,"name":"Bob","age":40,"email":null},"confidence":100}"#;
        match parse_output(stdout).unwrap() {
            EngineVerdict::Match { confidence, .. } => assert_eq!(confidence, 1.0),
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_error_report_is_process_failure() {
        let err = parse_output(r#"{"error": "No trained encodings found. Run training first."}"#)
            .unwrap_err();
        assert!(matches!(err, RecognitionError::ProcessFailure(msg) if msg.starts_with("No trained")));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = parse_output("Traceback (most recent call last):\n  oops").unwrap_err();
        assert!(matches!(err, RecognitionError::MalformedOutput(raw) if raw.contains("Traceback")));

        let err = parse_output("").unwrap_err();
        assert!(matches!(err, RecognitionError::MalformedOutput(_)));
    }

    #[test]
    fn test_match_without_person_is_malformed() {
        let err = parse_output(r#"{"found":true,"confidence":0.5}"#).unwrap_err();
        assert!(matches!(err, RecognitionError::MalformedOutput(_)));
    }

    #[test]
    fn test_normalize_confidence() {
        assert_eq!(normalize_confidence(Some(0.92)), 0.92);
        assert_eq!(normalize_confidence(Some(85.0)), 0.85);
        assert_eq!(normalize_confidence(Some(250.0)), 1.0);
        assert_eq!(normalize_confidence(Some(-0.3)), 0.0);
        assert_eq!(normalize_confidence(Some(f64::NAN)), 0.0);
        assert_eq!(normalize_confidence(None), 1.0);
    }
}
