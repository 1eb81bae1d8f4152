//! IngressGateway - Observer Frame Intake
//!
//! ## Responsibilities
//!
//! - Envelope validation and normalization
//! - Per-connection admission control (interval + single in-flight frame)
//! - Correlation registration and hand-off to the dispatcher
//!
//! ## Design
//!
//! - One `FrameSession` per websocket, owned by its handler task
//! - Dropped frames produce no reply and no ledger row
//! - In-flight is cleared by the handler when the outcome is delivered

pub mod admission;
pub mod envelope;

pub use admission::{AdmissionPolicy, AdmissionResult, ConnectionContext, RejectReason};
pub use envelope::{parse_frame, EnvelopeError, FrameEnvelope};

use crate::correlator::ResultCorrelator;
use crate::dispatcher::Dispatcher;
use crate::models::FrameTask;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Gateway side of one observer connection
pub struct FrameSession {
    connection_id: Uuid,
    context: ConnectionContext,
    dispatcher: Arc<dyn Dispatcher>,
    correlator: Arc<ResultCorrelator>,
}

impl FrameSession {
    pub fn new(
        connection_id: Uuid,
        policy: AdmissionPolicy,
        dispatcher: Arc<dyn Dispatcher>,
        correlator: Arc<ResultCorrelator>,
    ) -> Self {
        Self {
            connection_id,
            context: ConnectionContext::new(policy),
            dispatcher,
            correlator,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// Handle one inbound text message. Returns an immediate reply, if any.
    pub async fn on_message(&mut self, text: &str, now: Instant) -> Option<String> {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    frame_id = ?e.frame_id,
                    error = %e,
                    "Invalid frame envelope"
                );
                return Some(e.to_envelope().to_string());
            }
        };

        if let AdmissionResult::Rejected(reason) = self.context.check(now) {
            tracing::trace!(
                connection_id = %self.connection_id,
                observer_id = %frame.observer_id,
                frame_id = %frame.frame_id,
                reason = ?reason,
                "Frame dropped"
            );
            return None;
        }

        let registered = self
            .correlator
            .register_pending(
                &frame.observer_id,
                &frame.frame_id,
                self.connection_id,
                frame.timestamp.clone(),
            )
            .await;
        if !registered {
            tracing::debug!(
                connection_id = %self.connection_id,
                observer_id = %frame.observer_id,
                frame_id = %frame.frame_id,
                "Frame already pending on another connection, dropped"
            );
            return None;
        }

        self.context
            .accept(&frame.observer_id, &frame.frame_id, now);

        tracing::debug!(
            connection_id = %self.connection_id,
            observer_id = %frame.observer_id,
            frame_id = %frame.frame_id,
            image_bytes = frame.image.len(),
            "Frame admitted"
        );

        self.dispatcher
            .submit(FrameTask {
                observer_id: frame.observer_id,
                frame_id: frame.frame_id,
                captured_at: frame.captured_at,
                image: frame.image,
            })
            .await;

        None
    }

    /// Outcome for `frame_id` reached this connection
    pub fn on_delivery(&mut self, frame_id: &str) {
        if !self.context.complete(frame_id) {
            tracing::debug!(
                connection_id = %self.connection_id,
                frame_id = %frame_id,
                "Delivered frame was not in flight"
            );
        }
    }
}
