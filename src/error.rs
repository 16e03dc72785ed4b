//! Error types for tlsvault.
//!
//! Each component reports its own failure modes so a caller can tell a
//! handshake sequencing violation from a hardware rejection. Messages name
//! *what* failed (secret kind, side, status word) and never carry key
//! material.

use thiserror::Error;

use crate::chain::{SecretKind, Side};
use crate::device::DeviceStatus;
use crate::router::Direction;
use crate::session::SessionState;

/// Slot allocator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Every slot in the pool is allocated. Fatal to the in-flight
    /// handshake: the caller must `close()` the session.
    #[error("key slots exhausted")]
    SlotsExhausted,

    /// The id lies outside the pool. A programming error.
    #[error("invalid slot id {0}")]
    InvalidSlot(u16),
}

/// Failures reported by the device boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The device answered with a non-success status word.
    #[error("device rejected command: {0}")]
    Rejected(DeviceStatus),

    /// The transport could not complete the exchange.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A payload could not be decoded.
    #[error("malformed command or response")]
    Malformed,
}

/// Label router failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// The label, direction, side and session state do not name exactly
    /// one transition of the key schedule.
    #[error("no key-schedule route for {label:?} ({direction:?}, {side:?}, {state:?}, psk={psk})")]
    UnmappedLabel {
        label: String,
        direction: Direction,
        side: Side,
        state: SessionState,
        psk: bool,
    },

    /// The label is not one of the TLS 1.3 key-schedule labels.
    #[error("unknown key-schedule label {0:?}")]
    UnknownLabel(String),
}

/// Secret-chain bookkeeping violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// The node still owes children or is referenced by an open MAC.
    #[error("{kind:?}/{side:?} has {remaining} unresolved dependent(s)")]
    UnresolvedDependents {
        kind: SecretKind,
        side: Side,
        remaining: usize,
    },

    /// A derivation would overwrite a node that is still in use.
    #[error("{kind:?}/{side:?} already occupies a slot")]
    Occupied { kind: SecretKind, side: Side },

    /// The node holds no slot.
    #[error("{kind:?}/{side:?} is not recorded")]
    NotRecorded { kind: SecretKind, side: Side },
}

/// Key-schedule failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// The device refused a derivation. Never retried.
    #[error("device rejected derivation: {0}")]
    DeviceRejected(DeviceStatus),

    #[error("transport failure: {0}")]
    Transport(String),

    /// The parent secret of a requested step holds no slot: the TLS stack
    /// asked for the schedule out of order.
    #[error("parent secret {kind:?}/{side:?} is not available")]
    MissingParent { kind: SecretKind, side: Side },

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("session is closed")]
    SessionClosed,

    #[error("operation requires state {expected:?}, session is {actual:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    /// A slot handed in by the caller is not allocated to this session.
    #[error("slot {0} is not owned by this session")]
    ForeignSlot(u16),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// A peer signature does not verify. The session stays open; the TLS
    /// stack decides whether to abort the handshake.
    #[error("signature does not verify")]
    SignatureInvalid,
}

impl CryptoError {
    /// Hardware-originated failures close the session.
    pub(crate) fn is_hardware(&self) -> bool {
        matches!(self, Self::DeviceRejected(_) | Self::Transport(_))
    }
}

impl From<DeviceError> for CryptoError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Rejected(status) => Self::DeviceRejected(status),
            DeviceError::Transport(msg) => Self::Transport(msg),
            DeviceError::Malformed => Self::Transport("malformed device response".into()),
        }
    }
}

/// Record cipher failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("device rejected cipher operation: {0}")]
    DeviceRejected(DeviceStatus),

    #[error("transport failure: {0}")]
    Transport(String),

    /// The slot is not allocated in the pool.
    #[error("slot {0} holds no live key")]
    UnknownSlot(u16),

    #[error("nonce length {actual} invalid, expected {expected}")]
    InvalidNonce { expected: usize, actual: usize },

    #[error("tag length {0} invalid for algorithm")]
    InvalidTag(usize),

    /// Tag or MAC check failed. No plaintext is released.
    #[error("record authentication failed")]
    AuthenticationFailed,

    /// The session has no traffic key for this direction.
    #[error("no traffic key for {0:?}")]
    NoTrafficKey(Side),

    #[error("session is closed")]
    SessionClosed,
}

impl From<DeviceError> for CipherError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Rejected(status) => Self::DeviceRejected(status),
            DeviceError::Transport(msg) => Self::Transport(msg),
            DeviceError::Malformed => Self::Transport("malformed device response".into()),
        }
    }
}

/// Finished-MAC failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MacError {
    #[error("device rejected MAC operation: {0}")]
    DeviceRejected(DeviceStatus),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("slot {0} holds no live key")]
    UnknownSlot(u16),

    /// The device's single MAC context is held by another accumulator.
    #[error("MAC context busy")]
    Busy,

    /// The computed MAC differs from the expected value.
    #[error("MAC mismatch")]
    Mismatch,

    /// No finished key has been derived for this side.
    #[error("no finished key for {0:?}")]
    NoFinishedKey(Side),

    /// The session closed underneath the accumulator.
    #[error("session is closed")]
    SessionClosed,

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl From<DeviceError> for MacError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Rejected(status) => Self::DeviceRejected(status),
            DeviceError::Transport(msg) => Self::Transport(msg),
            DeviceError::Malformed => Self::Transport("malformed device response".into()),
        }
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
