use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::info;

/// Type of harvest lifecycle event being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditEventType {
    Handshake,
    Commit,
    Validation,
    Reveal,
    Verification,
    Revert,
    Failure,
}

/// Record of a harvest-related event
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub event_type: AuditEventType,
    pub harvest_id: Option<String>,
    pub message: String,
    pub timestamp: String, // RFC3339
}

impl AuditRecord {
    pub fn new(event_type: AuditEventType, harvest_id: Option<&str>, message: impl Into<String>) -> Self {
        AuditRecord {
            event_type,
            harvest_id: harvest_id.map(str::to_string),
            message: message.into(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn event_type_label(&self) -> &'static str {
        match self.event_type {
            AuditEventType::Handshake => "HANDSHAKE",
            AuditEventType::Commit => "COMMIT",
            AuditEventType::Validation => "VALIDATE",
            AuditEventType::Reveal => "REVEAL",
            AuditEventType::Verification => "VERIFY",
            AuditEventType::Revert => "REVERT",
            AuditEventType::Failure => "FAILURE",
        }
    }
}

/// Bounded in-memory audit tracker, oldest records evicted first
pub struct AuditTracker {
    records: Mutex<VecDeque<AuditRecord>>,
    max_entries: usize,
}

impl AuditTracker {
    pub fn new(max_entries: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(max_entries)),
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AuditRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a new event in the audit log
    pub fn log(&self, record: AuditRecord) {
        info!(
            audit = record.event_type_label(),
            harvest = record.harvest_id.as_deref().unwrap_or("-"),
            "{}",
            record.message
        );

        let mut records = self.lock();
        if records.len() == self.max_entries {
            records.pop_front(); // evict oldest
        }
        records.push_back(record);
    }

    /// Most recent records first
    pub fn recent(&self, count: usize) -> Vec<AuditRecord> {
        let records = self.lock();
        records.iter().rev().take(count).cloned().collect()
    }

    /// Latest failure, if any
    pub fn last_failure(&self) -> Option<AuditRecord> {
        let records = self.lock();
        records
            .iter()
            .rev()
            .find(|r| r.event_type == AuditEventType::Failure)
            .cloned()
    }
}

/// Helper to get current timestamp as RFC3339 string
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
