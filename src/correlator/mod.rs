//! ResultCorrelator - Outcome Delivery
//!
//! ## Responsibilities
//!
//! - Connection registration (one delivery channel per websocket)
//! - Correlation of `(observerId, frameId)` to the submitting connection
//! - Outbound envelope construction with the timestamp echoed as received
//!
//! Delivery is best-effort: outcomes without a registered key are dropped
//! after their ledger row has been written.

use crate::gateway::envelope::outcome_envelope;
use crate::models::RecognitionOutcome;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Correlation key: (observer id, frame id)
pub type CorrelationKey = (String, String);

/// Outcome handed to a connection handler
#[derive(Debug, Clone)]
pub struct Delivery {
    pub frame_id: String,
    /// Serialized outbound envelope
    pub envelope: String,
}

/// Pending correlation entry
struct PendingFrame {
    connection_id: Uuid,
    /// Timestamp exactly as the client sent it
    timestamp: Value,
    registered_at: Instant,
}

/// Correlator statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CorrelatorStats {
    pub connections: usize,
    pub pending: usize,
    pub delivered: u64,
    pub dropped: u64,
}

/// ResultCorrelator instance
pub struct ResultCorrelator {
    connections: RwLock<HashMap<Uuid, mpsc::UnboundedSender<Delivery>>>,
    pending: RwLock<HashMap<CorrelationKey, PendingFrame>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ResultCorrelator {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a connection and get its delivery channel
    pub async fn register_connection(&self) -> (Uuid, mpsc::UnboundedReceiver<Delivery>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.connections.write().await.insert(id, tx);
        tracing::info!(connection_id = %id, "Observer connected");

        (id, rx)
    }

    /// Drop a connection and every correlation key it owns
    pub async fn release_connection(&self, connection_id: &Uuid) {
        let removed = self.connections.write().await.remove(connection_id).is_some();

        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|_, p| p.connection_id != *connection_id);
        let released = before - pending.len();

        if removed {
            tracing::info!(
                connection_id = %connection_id,
                released_frames = released,
                "Observer disconnected"
            );
        }
    }

    /// Register a pending frame. Returns false if the key is already pending.
    pub async fn register_pending(
        &self,
        observer_id: &str,
        frame_id: &str,
        connection_id: Uuid,
        timestamp: Value,
    ) -> bool {
        let key = (observer_id.to_string(), frame_id.to_string());
        let mut pending = self.pending.write().await;
        if pending.contains_key(&key) {
            return false;
        }
        pending.insert(
            key,
            PendingFrame {
                connection_id,
                timestamp,
                registered_at: Instant::now(),
            },
        );
        true
    }

    /// Deliver an outcome to the connection that submitted the frame.
    ///
    /// Returns false when the key is unknown or the connection is gone.
    pub async fn deliver(&self, observer_id: &str, outcome: &RecognitionOutcome) -> bool {
        let key = (observer_id.to_string(), outcome.frame_id.clone());
        let entry = self.pending.write().await.remove(&key);

        let Some(entry) = entry else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                observer_id = %observer_id,
                frame_id = %outcome.frame_id,
                "No pending correlation, outcome dropped"
            );
            return false;
        };

        let envelope = outcome_envelope(outcome, &entry.timestamp).to_string();
        let sent = {
            let connections = self.connections.read().await;
            connections
                .get(&entry.connection_id)
                .map(|tx| {
                    tx.send(Delivery {
                        frame_id: outcome.frame_id.clone(),
                        envelope,
                    })
                    .is_ok()
                })
                .unwrap_or(false)
        };

        if sent {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                observer_id = %observer_id,
                frame_id = %outcome.frame_id,
                connection_id = %entry.connection_id,
                waited_ms = entry.registered_at.elapsed().as_millis() as u64,
                "Outcome delivered"
            );
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                observer_id = %observer_id,
                frame_id = %outcome.frame_id,
                "Connection gone, outcome dropped"
            );
        }

        sent
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            connections: self.connection_count().await,
            pending: self.pending_count().await,
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for ResultCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
