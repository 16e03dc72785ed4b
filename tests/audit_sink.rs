//! Tests for the pluggable AuditSink / forward sink functionality.

use std::sync::{Arc, Mutex};

use tlsvault::audit::{AuditEvent, AuditRecord, AuditSink, FileAuditSink};
use tlsvault::emulator::SoftElement;
use tlsvault::{CipherSuite, SecretKind, Side, Vault};

const SUITE: CipherSuite = CipherSuite::Tls13Aes128GcmSha256;

/// A test sink that collects records into a shared Vec.
struct SharedVecSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl SharedVecSink {
    fn new(records: Arc<Mutex<Vec<AuditRecord>>>) -> Self {
        Self { records }
    }
}

impl AuditSink for SharedVecSink {
    fn append(&mut self, record: AuditRecord) {
        self.records.lock().unwrap().push(record);
    }
}

#[test]
fn test_forward_sink_receives_records() {
    let vault = Vault::new(SoftElement::new());
    let records = Arc::new(Mutex::new(Vec::new()));
    vault.add_audit_sink(Box::new(SharedVecSink::new(Arc::clone(&records))));

    let mut session = vault.begin_handshake(Side::Client, SUITE).unwrap();
    let early = session.derive_early_secret().unwrap();
    session.close();

    // Primary log: derived, released, closed.
    let log = vault.audit_records();
    assert_eq!(log.len(), 3);
    assert_eq!(
        log[0].event,
        AuditEvent::Derived {
            kind: SecretKind::EarlySecret,
            side: Side::Neutral,
            slot: early,
        }
    );
    assert_eq!(log[1].event, AuditEvent::Released { slot: early });
    assert_eq!(log[2].event, AuditEvent::Closed { released: 1 });

    // Forward sink also received every record.
    let collected = records.lock().unwrap();
    assert_eq!(collected.len(), 3);
    assert!(collected.iter().all(|r| r.session == session.id()));
}

#[test]
fn test_records_never_carry_key_material() {
    let vault = Vault::new(SoftElement::new());
    let records = Arc::new(Mutex::new(Vec::new()));
    vault.add_audit_sink(Box::new(SharedVecSink::new(Arc::clone(&records))));

    let mut session = vault.begin_handshake(Side::Server, SUITE).unwrap();
    session.derive_early_secret().unwrap();
    let hash = SUITE.digest().empty_hash();
    session.hkdf_expand(b"tls13 derived", Side::Neutral, &hash, 32).unwrap();

    for record in records.lock().unwrap().iter() {
        let json = serde_json::to_value(record).unwrap();
        let event = json["event"].as_object().unwrap();
        for key in event.keys() {
            assert!(
                ["type", "kind", "side", "slot", "status", "released"].contains(&key.as_str()),
                "unexpected audit field {key}"
            );
        }
    }
}

#[test]
fn test_file_sink_writes_json_lines() {
    let path = std::env::temp_dir().join(format!("tlsvault_audit_{}.jsonl", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let vault = Vault::new(SoftElement::new());
    vault.add_audit_sink(Box::new(FileAuditSink::new(&path).unwrap()));
    {
        let mut session = vault.begin_handshake(Side::Client, SUITE).unwrap();
        session.derive_early_secret().unwrap();
    }

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<_> = contents.lines().collect();
    assert_eq!(lines.len(), 3);
    let last: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
    assert_eq!(last["event"]["type"], "closed");
    let _ = std::fs::remove_file(&path);
}
