//! # tlsvault
//!
//! TLS 1.3 (and simplified TLS 1.2) key schedule and record protection
//! offloaded to a secure element.
//!
//! Key material never reaches host memory. Secrets live in a small, fixed
//! pool of hardware key slots; the host only tracks which slot holds which
//! node of the key schedule, derives children by issuing device commands
//! that reference slots, and frees a slot as soon as its secret has produced
//! every child it owes.
//!
//! ```text
//! TLS stack
//!   │  hkdf_extract / hkdf_expand / derive_* / seal_record / finished_mac
//!   ▼
//! Session ──► Router ──► Engine ──► SlotPool
//!   │                      │
//!   └── SecretChain        └──► SecureElement::send_command
//! ```
//!
//! A [`Vault`] owns the device and the slot pool and is shared by every
//! session on that device; all device traffic is serialised through its
//! lock.

pub mod audit;
pub mod chain;
pub mod command;
pub mod config;
pub mod device;
pub mod emulator;
pub(crate) mod engine;
pub mod error;
pub mod record;
pub mod router;
pub mod session;
pub mod slot;
pub mod suite;

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

pub use chain::{Phase, SecretKind, Side};
pub use config::VaultConfig;
pub use device::SecureElement;
pub use error::{AllocError, CipherError, ConfigError, CryptoError, MacError, RouterError};
pub use record::{RecordCipher, RecordNonce, SealedRecord};
pub use session::{ProvisionedKey, PskKind, Session, SessionState};
pub use slot::{SessionId, SlotId};
pub use suite::{CipherSuite, NamedGroup};

use audit::{AuditEvent, AuditLog, AuditRecord, AuditSink};
use command::Command;
use error::DeviceError;
use slot::SlotPool;

/// Device, slot pool and audit log behind one lock.
pub(crate) struct Shared {
    pub(crate) device: Box<dyn SecureElement>,
    pub(crate) pool: SlotPool,
    pub(crate) audit: AuditLog,
    pub(crate) config: VaultConfig,
    /// Slot whose key currently owns the device's MAC context.
    pub(crate) mac_owner: Option<SlotId>,
    next_session: u64,
}

impl Shared {
    /// Encode and send one command.
    pub(crate) fn send(&mut self, command: &Command) -> Result<Vec<u8>, DeviceError> {
        let (opcode, payload) = command.encode()?;
        self.device.send_command(opcode, &payload)
    }

    /// Free a slot and log it. Freeing a free slot is a no-op.
    pub(crate) fn release(&mut self, session: SessionId, slot: SlotId) {
        if let Ok(true) = self.pool.free(slot) {
            self.audit_event(session, AuditEvent::Released { slot });
        }
    }

    pub(crate) fn audit_event(&mut self, session: SessionId, event: AuditEvent) {
        self.audit.append(AuditRecord::new(session, event));
    }
}

/// Handle to one secure element and its slot pool.
///
/// Cheap to clone; clones share the device.
#[derive(Clone)]
pub struct Vault {
    inner: Arc<Mutex<Shared>>,
}

impl Vault {
    /// A vault with the default hardware layout.
    pub fn new(device: impl SecureElement + 'static) -> Self {
        Self::build(Box::new(device), VaultConfig::default())
    }

    /// A vault with a custom layout. Fails if the layout is inconsistent.
    pub fn with_config(device: impl SecureElement + 'static, config: VaultConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(Box::new(device), config))
    }

    fn build(device: Box<dyn SecureElement>, config: VaultConfig) -> Self {
        let shared = Shared {
            device,
            pool: SlotPool::new(config.slot_base, config.slot_capacity),
            audit: AuditLog::new(),
            config,
            mac_owner: None,
            next_session: 1,
        };
        Self {
            inner: Arc::new(Mutex::new(shared)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.lock()
    }

    /// Copy of the active configuration.
    pub fn config(&self) -> VaultConfig {
        self.lock().config.clone()
    }

    /// Start a new session for `side` negotiating `suite`.
    pub fn begin_handshake(&self, side: Side, suite: CipherSuite) -> Result<Session, CryptoError> {
        if side == Side::Neutral {
            return Err(CryptoError::Unsupported("session side must be client or server"));
        }
        let id = {
            let mut shared = self.lock();
            let id = SessionId::new(shared.next_session);
            shared.next_session += 1;
            id
        };
        Ok(Session::new(self.clone(), id, side, suite))
    }

    /// Record protection over slots of any session on this vault.
    pub fn record_cipher(&self) -> RecordCipher {
        RecordCipher::new(self.clone())
    }

    /// The PSK object named in the configuration.
    pub fn default_psk(&self) -> ProvisionedKey {
        ProvisionedKey::new(self.lock().config.default_psk_object)
    }

    /// Random bytes from the device.
    pub fn random(&self, len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut shared = self.lock();
        let chunk = shared.config.chunk_size.min(usize::from(u16::MAX));
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let want = (len - out.len()).min(chunk);
            let bytes = shared.send(&Command::GetRandom { len: want as u16 })?;
            if bytes.len() != want {
                return Err(DeviceError::Malformed.into());
            }
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    /// Allocated slots across all sessions.
    pub fn allocated_slots(&self) -> usize {
        self.lock().pool.allocated()
    }

    /// Slots currently allocated to `session`.
    pub fn slots_owned_by(&self, session: SessionId) -> Vec<SlotId> {
        self.lock().pool.allocated_to(session)
    }

    /// Forward every future audit record to `sink` as well.
    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        self.lock().audit.add_sink(sink);
    }

    /// Snapshot of the in-memory audit log.
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.lock().audit.iter().cloned().collect()
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.lock();
        f.debug_struct("Vault")
            .field("config", &shared.config)
            .field("allocated", &shared.pool.allocated())
            .field("audit", &shared.audit)
            .finish()
    }
}
