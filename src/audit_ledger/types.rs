//! AuditLedger types

use crate::error::{Error, Result};
use crate::models::{FrameTask, RecognitionOutcome};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Column headers, in file order
pub const LEDGER_HEADER: [&str; 7] = [
    "ObserverID",
    "FrameID",
    "Timestamp",
    "PersonID",
    "PersonName",
    "Confidence",
    "Status",
];

/// Placeholder for person columns when nothing matched
pub const NOT_APPLICABLE: &str = "N/A";

/// Outcome status column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason")]
pub enum AuditStatus {
    MatchFound,
    NoMatch,
    Error(String),
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditStatus::MatchFound => f.write_str("Match Found"),
            AuditStatus::NoMatch => f.write_str("No Match"),
            AuditStatus::Error(reason) => write!(f, "Error: {}", reason),
        }
    }
}

impl FromStr for AuditStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Match Found" => Ok(AuditStatus::MatchFound),
            "No Match" => Ok(AuditStatus::NoMatch),
            other => other
                .strip_prefix("Error: ")
                .map(|reason| AuditStatus::Error(reason.to_string()))
                .ok_or_else(|| Error::Ledger(format!("Unknown status '{}'", other))),
        }
    }
}

/// One ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub observer_id: String,
    pub frame_id: String,
    pub timestamp: DateTime<Utc>,
    /// Person id or "N/A"
    pub person_id: String,
    /// Person name or "N/A"
    pub person_name: String,
    pub confidence: f64,
    pub status: AuditStatus,
}

impl AuditRecord {
    /// Build the record for a finished task
    pub fn from_outcome(task: &FrameTask, outcome: &RecognitionOutcome) -> Self {
        Self::new(&task.observer_id, &task.frame_id, task.captured_at, outcome)
    }

    pub fn new(
        observer_id: &str,
        frame_id: &str,
        timestamp: DateTime<Utc>,
        outcome: &RecognitionOutcome,
    ) -> Self {
        let status = match (&outcome.error, outcome.found) {
            (Some(err), _) => AuditStatus::Error(err.audit_reason()),
            (None, true) => AuditStatus::MatchFound,
            (None, false) => AuditStatus::NoMatch,
        };

        let (person_id, person_name, confidence) = match (&outcome.person, outcome.found) {
            (Some(person), true) => (
                person.id.to_string(),
                person.name.clone(),
                outcome.confidence,
            ),
            _ => (NOT_APPLICABLE.to_string(), NOT_APPLICABLE.to_string(), 0.0),
        };

        Self {
            observer_id: observer_id.to_string(),
            frame_id: frame_id.to_string(),
            timestamp,
            person_id,
            person_name,
            confidence,
            status,
        }
    }

    /// CSV fields in column order
    pub fn to_row(&self) -> [String; 7] {
        [
            self.observer_id.clone(),
            self.frame_id.clone(),
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.person_id.clone(),
            self.person_name.clone(),
            self.confidence.to_string(),
            self.status.to_string(),
        ]
    }

    /// Parse a CSV row read back from the ledger
    pub fn from_row(row: &csv::StringRecord) -> Result<Self> {
        if row.len() != LEDGER_HEADER.len() {
            return Err(Error::Ledger(format!(
                "Expected {} columns, got {}",
                LEDGER_HEADER.len(),
                row.len()
            )));
        }

        let timestamp = DateTime::parse_from_rfc3339(&row[2])
            .map_err(|e| Error::Ledger(format!("Bad timestamp '{}': {}", &row[2], e)))?
            .with_timezone(&Utc);
        let confidence = row[5]
            .parse::<f64>()
            .map_err(|e| Error::Ledger(format!("Bad confidence '{}': {}", &row[5], e)))?;

        Ok(Self {
            observer_id: row[0].to_string(),
            frame_id: row[1].to_string(),
            timestamp,
            person_id: row[3].to_string(),
            person_name: row[4].to_string(),
            confidence,
            status: row[6].parse()?,
        })
    }
}

/// Ledger lookup filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub observer_id: Option<String>,
    pub frame_id: Option<String>,
    pub person_id: Option<String>,
    /// Keep only the newest N matching rows
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.observer_id
            .as_deref()
            .map_or(true, |id| record.observer_id == id)
            && self.frame_id.as_deref().map_or(true, |id| record.frame_id == id)
            && self.person_id.as_deref().map_or(true, |id| record.person_id == id)
    }
}
