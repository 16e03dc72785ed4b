//! Append-only audit trail of key-schedule activity.
//!
//! Every derivation, slot release, device rejection and session close is
//! recorded against the session that caused it. Records carry kinds, sides
//! and slot ids only, never key material. Sinks receive a copy of each
//! record as it is appended.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::chain::{SecretKind, Side};
use crate::device::DeviceStatus;
use crate::slot::{SessionId, SlotId};

/// Receives a copy of every audit record.
pub trait AuditSink: Send {
    /// Receive one record. Must not fail the operation that produced it.
    fn append(&mut self, record: AuditRecord);
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A secret or key now occupies `slot`.
    Derived {
        kind: SecretKind,
        side: Side,
        slot: SlotId,
    },
    /// A slot went back to the pool.
    Released { slot: SlotId },
    /// The device refused a command.
    Rejected { status: DeviceStatus },
    /// The session closed, releasing `released` slots.
    Closed { released: usize },
}

/// One audit entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// Session the event belongs to.
    pub session: SessionId,
    /// What happened.
    pub event: AuditEvent,
    /// Wall-clock time the record was made.
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// Stamp `event` with the current time.
    pub fn new(session: SessionId, event: AuditEvent) -> Self {
        Self {
            session,
            event,
            timestamp: Utc::now(),
        }
    }
}

/// In-memory log plus forwarding sinks.
#[derive(Default)]
pub struct AuditLog {
    records: Vec<AuditRecord>,
    sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records.len())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl AuditLog {
    /// An empty log with no sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward every later record to `sink`.
    pub fn add_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.sinks.push(sink);
    }

    /// Keep `record` and hand a copy to each sink.
    pub fn append(&mut self, record: AuditRecord) {
        for sink in self.sinks.iter_mut() {
            sink.append(record.clone());
        }
        self.records.push(record);
    }

    /// Number of records kept.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in append order.
    pub fn iter(&self) -> std::slice::Iter<'_, AuditRecord> {
        self.records.iter()
    }

    /// Records belonging to one session.
    pub fn for_session(&self, session: SessionId) -> Vec<AuditRecord> {
        self.records
            .iter()
            .filter(|r| r.session == session)
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Appends records to a file as JSON lines.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    /// Open `path` for appending, creating it if needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        // Write errors are dropped.
        if let Ok(line) = serde_json::to_string(&record) {
            let _ = writeln!(self.file, "{line}");
            let _ = self.file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let record = AuditRecord::new(
            SessionId::new(3),
            AuditEvent::Derived {
                kind: SecretKind::HandshakeSecret,
                side: Side::Neutral,
                slot: SlotId::new(4),
            },
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["session"], 3);
        assert_eq!(json["event"]["type"], "derived");
        assert_eq!(json["event"]["kind"], "HandshakeSecret");
        assert_eq!(json["event"]["slot"], 4);
    }

    #[test]
    fn test_for_session_filters() {
        let mut log = AuditLog::new();
        log.append(AuditRecord::new(SessionId::new(1), AuditEvent::Released { slot: SlotId::new(0) }));
        log.append(AuditRecord::new(SessionId::new(2), AuditEvent::Closed { released: 0 }));
        assert_eq!(log.len(), 2);
        assert_eq!(log.for_session(SessionId::new(2)).len(), 1);
    }
}
