//! AuditLedger - Append-only Outcome Log
//!
//! ## Responsibilities
//!
//! - One CSV row per finished frame task (match, no match, error)
//! - Header row created on startup when the file is missing or empty
//! - Read-back and filtering by observer / frame / person
//!
//! ## Design
//!
//! - Rows are written with a single append-mode write followed by fsync,
//!   so the file is never rewritten and row order is append order
//! - Appends within a process are serialized by an async mutex; this is the
//!   only shared mutable resource of the pipeline
//! - Each append also holds an exclusive OS lock on the file, since the
//!   gateway and standalone `frame_worker` processes share one ledger

mod types;

pub use types::*;

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// AuditLedger instance
pub struct AuditLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLedger {
    /// Open the ledger, creating it (with header) if absent
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let init_path = path.clone();
        let created = tokio::task::spawn_blocking(move || ensure_header(&init_path))
            .await
            .map_err(|e| Error::Internal(format!("Ledger init task failed: {}", e)))??;

        if created {
            tracing::info!(path = %path.display(), "Audit ledger created");
        } else {
            tracing::info!(path = %path.display(), "Audit ledger opened");
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Ledger file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record; returns once the row is durable
    pub async fn append(&self, record: &AuditRecord) -> Result<()> {
        let row = record.to_row();
        let path = self.path.clone();

        let _guard = self.write_lock.lock().await;
        tokio::task::spawn_blocking(move || append_row(&path, &row))
            .await
            .map_err(|e| Error::Internal(format!("Ledger append task failed: {}", e)))??;

        tracing::debug!(
            observer_id = %record.observer_id,
            frame_id = %record.frame_id,
            status = %record.status,
            "Audit record appended"
        );

        Ok(())
    }

    /// Read every row in append order
    pub async fn read_all(&self) -> Result<Vec<AuditRecord>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_rows(&path))
            .await
            .map_err(|e| Error::Internal(format!("Ledger read task failed: {}", e)))?
    }

    /// Rows matching the query, in append order
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let mut records: Vec<AuditRecord> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| query.matches(r))
            .collect();

        if let Some(limit) = query.limit {
            if records.len() > limit {
                records.drain(..records.len() - limit);
            }
        }

        Ok(records)
    }

    /// Check the ledger file is still reachable
    pub async fn is_healthy(&self) -> bool {
        tokio::fs::metadata(&self.path).await.is_ok()
    }
}

/// Write the header if the file is missing or empty. Returns true if written.
fn ensure_header(path: &Path) -> Result<bool> {
    let empty = match std::fs::metadata(path) {
        Ok(meta) => meta.len() == 0,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => return Err(e.into()),
    };

    if !empty {
        return Ok(false);
    }

    append_row(path, &LEDGER_HEADER)?;
    Ok(true)
}

fn append_row<S: AsRef<str>>(path: &Path, fields: &[S]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(fields.iter().map(|f| f.as_ref()))?;
    let bytes = writer
        .into_inner()
        .map_err(|e| Error::Ledger(format!("Failed to encode row: {}", e)))?;

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock()?;
    file.write_all(&bytes)?;
    file.sync_data()?;
    file.unlock()?;
    Ok(())
}

fn read_rows(path: &Path) -> Result<Vec<AuditRecord>> {
    let file = File::open(path)?;
    file.lock_shared()?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(file);

    let mut records = Vec::new();
    for row in reader.records() {
        records.push(AuditRecord::from_row(&row?)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailureKind, FrameTask, Person, PersonId, RecognitionOutcome};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn task(observer: &str, frame: &str) -> FrameTask {
        FrameTask {
            observer_id: observer.to_string(),
            frame_id: frame.to_string(),
            captured_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            image: vec![],
        }
    }

    #[tokio::test]
    async fn test_open_writes_header_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger").join("results.csv");

        AuditLedger::open(&path).await.unwrap();
        AuditLedger::open(&path).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "ObserverID,FrameID,Timestamp,PersonID,PersonName,Confidence,Status\n"
        );
    }

    #[tokio::test]
    async fn test_append_and_read_back_in_order() {
        let dir = tempdir().unwrap();
        let ledger = AuditLedger::open(dir.path().join("results.csv")).await.unwrap();

        let alice = RecognitionOutcome::matched(
            "f2",
            Person {
                id: PersonId::Number(7),
                name: "Alice".to_string(),
            },
            0.92,
        );
        ledger
            .append(&AuditRecord::from_outcome(&task("obs2", "f2"), &alice))
            .await
            .unwrap();
        ledger
            .append(&AuditRecord::from_outcome(
                &task("obs1", "f1"),
                &RecognitionOutcome::failed("f1", FailureKind::ProcessFailure, "model load failed"),
            ))
            .await
            .unwrap();

        let records = ledger.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].frame_id, "f2");
        assert_eq!(records[0].person_name, "Alice");
        assert_eq!(records[0].confidence, 0.92);
        assert_eq!(records[1].frame_id, "f1");
        assert_eq!(
            records[1].status,
            AuditStatus::Error("model load failed".to_string())
        );
    }

    #[tokio::test]
    async fn test_fields_with_commas_survive() {
        let dir = tempdir().unwrap();
        let ledger = AuditLedger::open(dir.path().join("results.csv")).await.unwrap();

        let outcome = RecognitionOutcome::failed(
            "f1",
            FailureKind::ProcessFailure,
            "Traceback, line 3: \"boom\"",
        );
        ledger
            .append(&AuditRecord::from_outcome(&task("obs1", "f1"), &outcome))
            .await
            .unwrap();

        let records = ledger.read_all().await.unwrap();
        assert_eq!(
            records[0].status,
            AuditStatus::Error("Traceback, line 3: \"boom\"".to_string())
        );
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let dir = tempdir().unwrap();
        let ledger = Arc::new(AuditLedger::open(dir.path().join("results.csv")).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let frame = format!("f{}", i);
                let record = AuditRecord::from_outcome(
                    &task("obs1", &frame),
                    &RecognitionOutcome::no_match(frame.clone(), None),
                );
                ledger.append(&record).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ledger.read_all().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_query_filters_and_limits() {
        let dir = tempdir().unwrap();
        let ledger = AuditLedger::open(dir.path().join("results.csv")).await.unwrap();

        for (observer, frame) in [("obs1", "a"), ("obs2", "b"), ("obs1", "c"), ("obs1", "d")] {
            let record = AuditRecord::from_outcome(
                &task(observer, frame),
                &RecognitionOutcome::no_match(frame, None),
            );
            ledger.append(&record).await.unwrap();
        }

        let query = AuditQuery {
            observer_id: Some("obs1".to_string()),
            limit: Some(2),
            ..Default::default()
        };
        let frames: Vec<String> = ledger
            .query(&query)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.frame_id)
            .collect();
        assert_eq!(frames, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_separate_handles_do_not_interleave_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");
        // two handles stand in for the gateway and a frame_worker process
        let gateway = Arc::new(AuditLedger::open(&path).await.unwrap());
        let worker = Arc::new(AuditLedger::open(&path).await.unwrap());
        let stderr = "Traceback line\n".repeat(8_000);

        let mut handles = Vec::new();
        for i in 0..16 {
            let ledger = if i % 2 == 0 { gateway.clone() } else { worker.clone() };
            let stderr = stderr.clone();
            handles.push(tokio::spawn(async move {
                let frame = format!("f{}", i);
                let outcome =
                    RecognitionOutcome::failed(frame.clone(), FailureKind::ProcessFailure, stderr);
                ledger
                    .append(&AuditRecord::from_outcome(&task("obs1", &frame), &outcome))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let records = gateway.read_all().await.unwrap();
        assert_eq!(records.len(), 16);
        assert!(records
            .iter()
            .all(|r| r.status == AuditStatus::Error(stderr.trim().to_string())));
    }
}
