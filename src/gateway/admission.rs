//! Per-connection admission control
//!
//! A frame is admitted only when the connection has nothing in flight and the
//! minimum interval since the last admitted frame has elapsed. Everything
//! else is dropped without a reply. The in-flight flag has no expiry: it is
//! cleared only by the delivered outcome, and the engine timeout bounds how
//! long that takes once recognition starts.

use std::time::{Duration, Instant};

/// Admission thresholds
#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy {
    /// Minimum spacing between admitted frames
    pub min_interval: Duration,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
        }
    }
}

/// Admission result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionResult {
    Admitted,
    Rejected(RejectReason),
}

/// Why a frame was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Inside the minimum interval
    TooSoon,
    /// Previous frame still being recognized
    InFlight,
}

/// Frame currently owned by the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightFrame {
    pub observer_id: String,
    pub frame_id: String,
    pub since: Instant,
}

/// Connection-owned admission state
#[derive(Debug)]
pub struct ConnectionContext {
    policy: AdmissionPolicy,
    observer_id: Option<String>,
    last_accepted_at: Option<Instant>,
    in_flight: Option<InFlightFrame>,
}

impl ConnectionContext {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self {
            policy,
            observer_id: None,
            last_accepted_at: None,
            in_flight: None,
        }
    }

    /// Observer of the most recently admitted frame
    pub fn observer_id(&self) -> Option<&str> {
        self.observer_id.as_deref()
    }

    pub fn in_flight(&self) -> Option<&InFlightFrame> {
        self.in_flight.as_ref()
    }

    pub fn check(&self, now: Instant) -> AdmissionResult {
        if self.in_flight.is_some() {
            return AdmissionResult::Rejected(RejectReason::InFlight);
        }
        if let Some(last) = self.last_accepted_at {
            if now.saturating_duration_since(last) < self.policy.min_interval {
                return AdmissionResult::Rejected(RejectReason::TooSoon);
            }
        }
        AdmissionResult::Admitted
    }

    /// Mark a frame admitted
    pub fn accept(&mut self, observer_id: &str, frame_id: &str, now: Instant) {
        self.observer_id = Some(observer_id.to_string());
        self.last_accepted_at = Some(now);
        self.in_flight = Some(InFlightFrame {
            observer_id: observer_id.to_string(),
            frame_id: frame_id.to_string(),
            since: now,
        });
    }

    /// Clear the in-flight flag if it belongs to `frame_id`
    pub fn complete(&mut self, frame_id: &str) -> bool {
        match &self.in_flight {
            Some(f) if f.frame_id == frame_id => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AdmissionPolicy {
        AdmissionPolicy {
            min_interval: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_first_frame_admitted() {
        let ctx = ConnectionContext::new(policy());
        assert_eq!(ctx.check(Instant::now()), AdmissionResult::Admitted);
    }

    #[test]
    fn test_in_flight_blocks_until_complete() {
        let t0 = Instant::now();
        let mut ctx = ConnectionContext::new(policy());
        ctx.accept("obs1", "f1", t0);

        let later = t0 + Duration::from_secs(1);
        assert_eq!(
            ctx.check(later),
            AdmissionResult::Rejected(RejectReason::InFlight)
        );

        assert!(!ctx.complete("f0"));
        assert!(ctx.complete("f1"));
        assert_eq!(ctx.check(later), AdmissionResult::Admitted);
    }

    #[test]
    fn test_min_interval() {
        let t0 = Instant::now();
        let mut ctx = ConnectionContext::new(policy());
        ctx.accept("obs1", "f1", t0);
        ctx.complete("f1");

        assert_eq!(
            ctx.check(t0 + Duration::from_millis(100)),
            AdmissionResult::Rejected(RejectReason::TooSoon)
        );
        assert_eq!(
            ctx.check(t0 + Duration::from_millis(500)),
            AdmissionResult::Admitted
        );
    }

    #[test]
    fn test_in_flight_never_expires_on_its_own() {
        let t0 = Instant::now();
        let mut ctx = ConnectionContext::new(policy());
        ctx.accept("obs1", "f1", t0);

        // only the delivered outcome clears the flag
        assert_eq!(
            ctx.check(t0 + Duration::from_secs(3600)),
            AdmissionResult::Rejected(RejectReason::InFlight)
        );
        assert_eq!(ctx.in_flight().unwrap().since, t0);
    }
}
