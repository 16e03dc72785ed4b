//! Cipher suites, digests and key-exchange groups.
//!
//! These are the negotiated parameters the TLS stack hands to the vault.
//! They decide digest length for the key schedule, key and IV sizes for
//! traffic keys, and which record algorithm the device is asked to run.

use ring::digest;
use serde::{Deserialize, Serialize};

/// Hash function driving HKDF, the TLS 1.2 PRF and finished MACs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Digest {
    Sha256,
    Sha384,
}

impl Digest {
    /// Output length in bytes.
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
        }
    }

    /// `Hash("")`, the context used by the `"derived"` and binder labels.
    pub fn empty_hash(self) -> Vec<u8> {
        digest::digest(self.ring_algorithm(), &[]).as_ref().to_vec()
    }

    /// Hash arbitrary bytes. Used by callers to build transcript hashes.
    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        digest::digest(self.ring_algorithm(), data).as_ref().to_vec()
    }

    fn ring_algorithm(self) -> &'static digest::Algorithm {
        match self {
            Self::Sha256 => &digest::SHA256,
            Self::Sha384 => &digest::SHA384,
        }
    }

    pub(crate) fn wire(self) -> u8 {
        match self {
            Self::Sha256 => 0x01,
            Self::Sha384 => 0x02,
        }
    }

    pub(crate) fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Sha256),
            0x02 => Some(Self::Sha384),
            _ => None,
        }
    }
}

/// Record protection algorithm run inside the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordAlgorithm {
    AesGcm,
    AesCcm,
    /// AES-CBC with an HMAC over the record (TLS 1.2 only).
    AesCbcHmac(Digest),
}

impl RecordAlgorithm {
    /// False for CBC with a record MAC.
    pub fn is_aead(self) -> bool {
        !matches!(self, Self::AesCbcHmac(_))
    }

    /// Length of the per-record nonce/IV the caller must supply.
    pub fn nonce_len(self) -> usize {
        match self {
            Self::AesGcm | Self::AesCcm => 12,
            Self::AesCbcHmac(_) => 16,
        }
    }

    /// Whether `len` is an acceptable tag length for this algorithm.
    pub fn accepts_tag_len(self, len: usize) -> bool {
        match self {
            Self::AesGcm => len == 16,
            Self::AesCcm => len == 8 || len == 16,
            Self::AesCbcHmac(d) => len == d.output_len(),
        }
    }

    pub(crate) fn wire(self) -> u8 {
        match self {
            Self::AesGcm => 0x01,
            Self::AesCcm => 0x02,
            Self::AesCbcHmac(Digest::Sha256) => 0x03,
            Self::AesCbcHmac(Digest::Sha384) => 0x04,
        }
    }

    pub(crate) fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::AesGcm),
            0x02 => Some(Self::AesCcm),
            0x03 => Some(Self::AesCbcHmac(Digest::Sha256)),
            0x04 => Some(Self::AesCbcHmac(Digest::Sha384)),
            _ => None,
        }
    }
}

/// Protocol version a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tls12,
    Tls13,
}

/// Cipher suites the offload engine can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherSuite {
    Tls13Aes128GcmSha256,
    Tls13Aes256GcmSha384,
    Tls13Aes128CcmSha256,
    Tls13Aes128Ccm8Sha256,
    EcdheEcdsaAes128GcmSha256,
    EcdheEcdsaAes256GcmSha384,
    EcdheEcdsaAes128CbcSha256,
    EcdheEcdsaAes256CbcSha384,
}

impl CipherSuite {
    /// IANA cipher suite identifier.
    pub fn id(self) -> u16 {
        match self {
            Self::Tls13Aes128GcmSha256 => 0x1301,
            Self::Tls13Aes256GcmSha384 => 0x1302,
            Self::Tls13Aes128CcmSha256 => 0x1304,
            Self::Tls13Aes128Ccm8Sha256 => 0x1305,
            Self::EcdheEcdsaAes128GcmSha256 => 0xC02B,
            Self::EcdheEcdsaAes256GcmSha384 => 0xC02C,
            Self::EcdheEcdsaAes128CbcSha256 => 0xC023,
            Self::EcdheEcdsaAes256CbcSha384 => 0xC024,
        }
    }

    /// Suite for an IANA identifier, if supported.
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0x1301 => Some(Self::Tls13Aes128GcmSha256),
            0x1302 => Some(Self::Tls13Aes256GcmSha384),
            0x1304 => Some(Self::Tls13Aes128CcmSha256),
            0x1305 => Some(Self::Tls13Aes128Ccm8Sha256),
            0xC02B => Some(Self::EcdheEcdsaAes128GcmSha256),
            0xC02C => Some(Self::EcdheEcdsaAes256GcmSha384),
            0xC023 => Some(Self::EcdheEcdsaAes128CbcSha256),
            0xC024 => Some(Self::EcdheEcdsaAes256CbcSha384),
            _ => None,
        }
    }

    /// TLS version the suite belongs to.
    pub fn protocol(self) -> Protocol {
        match self {
            Self::Tls13Aes128GcmSha256
            | Self::Tls13Aes256GcmSha384
            | Self::Tls13Aes128CcmSha256
            | Self::Tls13Aes128Ccm8Sha256 => Protocol::Tls13,
            _ => Protocol::Tls12,
        }
    }

    /// Hash used by the key schedule and PRF.
    pub fn digest(self) -> Digest {
        match self {
            Self::Tls13Aes256GcmSha384
            | Self::EcdheEcdsaAes256GcmSha384
            | Self::EcdheEcdsaAes256CbcSha384 => Digest::Sha384,
            _ => Digest::Sha256,
        }
    }

    /// Record protection algorithm.
    pub fn algorithm(self) -> RecordAlgorithm {
        match self {
            Self::Tls13Aes128GcmSha256
            | Self::Tls13Aes256GcmSha384
            | Self::EcdheEcdsaAes128GcmSha256
            | Self::EcdheEcdsaAes256GcmSha384 => RecordAlgorithm::AesGcm,
            Self::Tls13Aes128CcmSha256 | Self::Tls13Aes128Ccm8Sha256 => RecordAlgorithm::AesCcm,
            Self::EcdheEcdsaAes128CbcSha256 => RecordAlgorithm::AesCbcHmac(Digest::Sha256),
            Self::EcdheEcdsaAes256CbcSha384 => RecordAlgorithm::AesCbcHmac(Digest::Sha384),
        }
    }

    /// Traffic key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Self::Tls13Aes256GcmSha384
            | Self::EcdheEcdsaAes256GcmSha384
            | Self::EcdheEcdsaAes256CbcSha384 => 32,
            _ => 16,
        }
    }

    /// Length of the IV taken from the key schedule.
    ///
    /// TLS 1.3 derives a full 12-byte static IV; TLS 1.2 AEAD suites take
    /// a 4-byte fixed IV and CBC suites a full block.
    pub fn iv_len(self) -> usize {
        match (self.protocol(), self.algorithm()) {
            (Protocol::Tls13, _) => 12,
            (Protocol::Tls12, RecordAlgorithm::AesCbcHmac(_)) => 16,
            (Protocol::Tls12, _) => 4,
        }
    }

    /// AEAD tag length, or the record MAC length for CBC.
    pub fn tag_len(self) -> usize {
        match self {
            Self::Tls13Aes128Ccm8Sha256 => 8,
            _ => match self.algorithm() {
                RecordAlgorithm::AesCbcHmac(d) => d.output_len(),
                _ => 16,
            },
        }
    }

    /// Record MAC key length (zero for AEAD suites).
    pub fn mac_key_len(self) -> usize {
        match self.algorithm() {
            RecordAlgorithm::AesCbcHmac(d) => d.output_len(),
            _ => 0,
        }
    }
}

/// Key-exchange groups the device can generate shares for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamedGroup {
    Secp256r1,
    X25519,
}

impl NamedGroup {
    /// IANA named group identifier.
    pub fn id(self) -> u16 {
        match self {
            Self::Secp256r1 => 0x0017,
            Self::X25519 => 0x001D,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0x0017 => Some(Self::Secp256r1),
            0x001D => Some(Self::X25519),
            _ => None,
        }
    }

    /// Length of an encoded public share.
    pub fn share_len(self) -> usize {
        match self {
            Self::Secp256r1 => 65,
            Self::X25519 => 32,
        }
    }
}
