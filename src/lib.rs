//! Facegate Server Library
//!
//! Real-time frame admission and recognition dispatch
//!
//! ## Architecture (5 Components)
//!
//! 1. RecognitionEngine - External recognition process adapter
//! 2. AuditLedger - Append-only CSV outcome log
//! 3. Dispatcher - Direct pool or durable queue + workers
//! 4. Gateway - Envelope validation and per-connection admission
//! 5. ResultCorrelator - Outcome delivery to the submitting connection
//!
//! ## Flow
//!
//! Gateway -> admission -> Dispatcher -> RecognitionEngine -> AuditLedger
//! -> ResultCorrelator -> websocket

pub mod audit_ledger;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod models;
pub mod person_directory;
pub mod recognition_engine;
pub mod state;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
