//! Append-only audit sink for security-relevant session transitions.
//!
//! Records never fail the request that produced them. The default sink writes
//! each event as one structured log line on the `audit` target, where the log
//! pipeline picks it up.

use std::sync::Mutex;

use crate::models::{AuditAction, AuditEvent};

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let outcome = match &event.outcome {
            crate::models::AuditOutcome::Success => "success".to_string(),
            crate::models::AuditOutcome::Failure { kind } => kind.clone(),
        };

        if event.outcome.is_success() {
            tracing::info!(
                target: "audit",
                event_id = %event.event_id,
                action = event.action.as_str(),
                outcome = %outcome,
                subject = event.subject.as_deref().unwrap_or("-"),
                ip = event.ip.as_deref().unwrap_or("-"),
                device_fingerprint = event.device_fingerprint.as_deref().unwrap_or("-"),
                correlation_id = event.correlation_id.as_deref().unwrap_or("-"),
                details = event.details.as_deref().unwrap_or(""),
                timestamp = %event.timestamp,
                "Audit event"
            );
        } else {
            tracing::warn!(
                target: "audit",
                event_id = %event.event_id,
                action = event.action.as_str(),
                outcome = %outcome,
                subject = event.subject.as_deref().unwrap_or("-"),
                ip = event.ip.as_deref().unwrap_or("-"),
                device_fingerprint = event.device_fingerprint.as_deref().unwrap_or("-"),
                correlation_id = event.correlation_id.as_deref().unwrap_or("-"),
                details = event.details.as_deref().unwrap_or(""),
                timestamp = %event.timestamp,
                "Audit event"
            );
        }
    }
}

/// Keeps every event in memory; used by tests to assert on the audit trail.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn events_for(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.action == action)
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
