//! The boundary to the secure element.
//!
//! The vault never sees key bytes. Everything it asks of the hardware goes
//! through [`SecureElement::send_command`]: an opcode plus an opaque
//! payload, answered by a response payload or a status code. Framing,
//! reset/ready handshaking and timeouts belong to the transport behind the
//! trait.
//!
//! ```text
//! Session / Engine / RecordCipher
//!     ↓  Command::encode()
//! SecureElement::send_command(opcode, payload)
//!     ↓
//! transport (SPI / I2C)  or  emulator::SoftElement
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// A hardware command channel.
///
/// Calls block until the device answers. Implementations must not retry:
/// a repeated key-derivation command against stateful hardware would
/// desynchronise the key schedule.
pub trait SecureElement: Send {
    /// Send one command and wait for its response payload.
    fn send_command(&mut self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, DeviceError>;
}

impl<T: SecureElement + ?Sized> SecureElement for Box<T> {
    fn send_command(&mut self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, DeviceError> {
        (**self).send_command(opcode, payload)
    }
}

/// Command classes understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    /// TLS key exchange and secret derivation.
    KeyExchange = 0x10,
    /// Bulk encrypt/decrypt.
    Cipher = 0x20,
    /// Compute or verify a MAC.
    Mac = 0x30,
    /// Random bytes from the device RNG.
    GetRandom = 0x50,
    /// ECDSA sign with a provisioned key.
    Sign = 0x60,
    /// ECDSA verify with a host-supplied public key.
    Verify = 0x61,
}

impl Opcode {
    /// Parse a wire byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Self::KeyExchange),
            0x20 => Some(Self::Cipher),
            0x30 => Some(Self::Mac),
            0x50 => Some(Self::GetRandom),
            0x60 => Some(Self::Sign),
            0x61 => Some(Self::Verify),
            _ => None,
        }
    }
}

/// The closed set of failure classes a device reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusKind {
    NotFound,
    AccessDenied,
    CryptoFailure,
    AlgorithmNotSupported,
    WrongParams,
    BufferTooSmall,
    /// A status word outside the documented set. The raw code is kept.
    Unknown,
}

/// A non-success status returned by the device.
///
/// The raw status word is preserved for diagnostics alongside its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceStatus {
    kind: StatusKind,
    code: u16,
}

impl DeviceStatus {
    pub const NOT_FOUND: u16 = 0x6A88;
    pub const ACCESS_DENIED: u16 = 0x6982;
    pub const CRYPTO_FAILURE: u16 = 0x6F01;
    pub const ALGORITHM_NOT_SUPPORTED: u16 = 0x6A81;
    pub const WRONG_PARAMS: u16 = 0x6A80;
    pub const BUFFER_TOO_SMALL: u16 = 0x6700;

    /// Build a status with the canonical code for `kind`.
    pub fn new(kind: StatusKind) -> Self {
        let code = match kind {
            StatusKind::NotFound => Self::NOT_FOUND,
            StatusKind::AccessDenied => Self::ACCESS_DENIED,
            StatusKind::CryptoFailure => Self::CRYPTO_FAILURE,
            StatusKind::AlgorithmNotSupported => Self::ALGORITHM_NOT_SUPPORTED,
            StatusKind::WrongParams => Self::WRONG_PARAMS,
            StatusKind::BufferTooSmall => Self::BUFFER_TOO_SMALL,
            StatusKind::Unknown => 0x6F00,
        };
        Self { kind, code }
    }

    /// Classify a raw status word.
    pub fn from_code(code: u16) -> Self {
        let kind = match code {
            Self::NOT_FOUND => StatusKind::NotFound,
            Self::ACCESS_DENIED => StatusKind::AccessDenied,
            Self::CRYPTO_FAILURE => StatusKind::CryptoFailure,
            Self::ALGORITHM_NOT_SUPPORTED => StatusKind::AlgorithmNotSupported,
            Self::WRONG_PARAMS => StatusKind::WrongParams,
            Self::BUFFER_TOO_SMALL => StatusKind::BufferTooSmall,
            _ => StatusKind::Unknown,
        };
        Self { kind, code }
    }

    /// Failure class.
    pub fn kind(&self) -> StatusKind {
        self.kind
    }

    /// Raw status word as the device sent it.
    pub fn code(&self) -> u16 {
        self.code
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:04X})", self.kind, self.code)
    }
}
