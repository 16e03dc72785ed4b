//! Record protection and finished MACs by slot reference.
//!
//! Both services address keys by [`SlotId`] only. Data moves to the device
//! as an init / update* / finish command sequence, each update carrying at
//! most `chunk_size` bytes. The device has one cipher context and one MAC
//! context; a MAC accumulator holds the MAC context from `compute_finished_mac`
//! until `finish`/`verify` (or drop), and a second one is refused with `Busy`.
//!
//! AEAD records come back as ciphertext plus a detached tag. CBC records
//! are MAC-then-encrypt: the MAC and padding sit inside the ciphertext, so
//! the tag is empty on both seal and open.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::command::{CipherMode, Command};
use crate::device::StatusKind;
use crate::error::{CipherError, DeviceError, MacError};
use crate::slot::SlotId;
use crate::suite::{Digest, RecordAlgorithm};
use crate::{Shared, Vault};

const CBC_BLOCK: usize = 16;

/// Nonce input for one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordNonce {
    /// Record sequence number, XORed by the device into the static IV held
    /// in the key slot (TLS 1.3).
    Sequence(u64),
    /// A complete nonce, for keys whose slot carries no IV (TLS 1.2).
    Explicit(Vec<u8>),
}

/// Ciphertext and tag of one protected record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedRecord {
    /// Encrypted payload. For CBC this is the whole padded record.
    pub ciphertext: Vec<u8>,
    /// Detached AEAD tag; empty for CBC.
    pub tag: Vec<u8>,
}

/// Encrypt/decrypt service over the vault's device.
#[derive(Clone)]
pub struct RecordCipher {
    vault: Vault,
}

impl RecordCipher {
    pub(crate) fn new(vault: Vault) -> Self {
        Self { vault }
    }

    /// Encrypt `plaintext` under the key in `slot`. `tag_len` is the AEAD
    /// tag length, or the record MAC length for CBC.
    pub fn encrypt(
        &self,
        slot: SlotId,
        algorithm: RecordAlgorithm,
        nonce: &RecordNonce,
        aad: &[u8],
        plaintext: &[u8],
        tag_len: usize,
    ) -> Result<SealedRecord, CipherError> {
        check_params(algorithm, nonce, tag_len)?;
        let mut shared = self.vault.lock();
        let mut out = run(&mut shared, slot, algorithm, CipherMode::Encrypt, nonce, aad, plaintext, tag_len, &[])?;
        match algorithm {
            RecordAlgorithm::AesCbcHmac(_) => {
                // At least one padding byte after the MAC, whole blocks.
                if out.len() % CBC_BLOCK != 0 || out.len() < plaintext.len() + tag_len + 1 {
                    return Err(DeviceError::Malformed.into());
                }
                Ok(SealedRecord {
                    ciphertext: out,
                    tag: Vec::new(),
                })
            }
            RecordAlgorithm::AesGcm | RecordAlgorithm::AesCcm => {
                if out.len() != plaintext.len() + tag_len {
                    return Err(DeviceError::Malformed.into());
                }
                let tag = out.split_off(plaintext.len());
                Ok(SealedRecord {
                    ciphertext: out,
                    tag,
                })
            }
        }
    }

    /// Decrypt and authenticate. No plaintext is returned unless the tag
    /// (or the CBC record MAC) verifies. CBC takes an empty `tag`.
    pub fn decrypt(
        &self,
        slot: SlotId,
        algorithm: RecordAlgorithm,
        nonce: &RecordNonce,
        aad: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let tag_len = match algorithm {
            RecordAlgorithm::AesCbcHmac(digest) => {
                if !tag.is_empty() {
                    return Err(CipherError::InvalidTag(tag.len()));
                }
                digest.output_len()
            }
            RecordAlgorithm::AesGcm | RecordAlgorithm::AesCcm => tag.len(),
        };
        check_params(algorithm, nonce, tag_len)?;
        let mut shared = self.vault.lock();
        run(&mut shared, slot, algorithm, CipherMode::Decrypt, nonce, aad, ciphertext, tag_len, tag)
    }

    /// Open a MAC accumulator keyed by the finished key in `slot`.
    pub fn compute_finished_mac(&self, slot: SlotId, digest: Digest) -> Result<MacSession, MacError> {
        let mut shared = self.vault.lock();
        if shared.mac_owner.is_some() {
            return Err(MacError::Busy);
        }
        if !shared.pool.is_allocated(slot) {
            return Err(MacError::UnknownSlot(slot.object_id()));
        }
        shared.send(&Command::MacInit {
            key: slot.object_id(),
            digest,
        })?;
        shared.mac_owner = Some(slot);
        Ok(MacSession {
            vault: self.vault.clone(),
            slot,
            open: true,
        })
    }
}

fn check_params(algorithm: RecordAlgorithm, nonce: &RecordNonce, tag_len: usize) -> Result<(), CipherError> {
    if let RecordNonce::Explicit(bytes) = nonce {
        if bytes.len() != algorithm.nonce_len() {
            return Err(CipherError::InvalidNonce {
                expected: algorithm.nonce_len(),
                actual: bytes.len(),
            });
        }
    }
    if !algorithm.accepts_tag_len(tag_len) {
        return Err(CipherError::InvalidTag(tag_len));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run(
    shared: &mut Shared,
    slot: SlotId,
    algorithm: RecordAlgorithm,
    mode: CipherMode,
    nonce: &RecordNonce,
    aad: &[u8],
    data: &[u8],
    tag_len: usize,
    tag: &[u8],
) -> Result<Vec<u8>, CipherError> {
    if !shared.pool.is_allocated(slot) {
        return Err(CipherError::UnknownSlot(slot.object_id()));
    }
    let chunk_size = shared.config.chunk_size;
    let init = Command::CipherInit {
        key: slot.object_id(),
        algorithm,
        mode,
        nonce: nonce.clone(),
        aad: aad.to_vec(),
        tag_len: tag_len as u8,
        tag: tag.to_vec(),
    };
    let result = shared.send(&init).and_then(|_| {
        for chunk in data.chunks(chunk_size) {
            shared.send(&Command::CipherUpdate { data: chunk.to_vec() })?;
        }
        shared.send(&Command::CipherFinish)
    });
    result.map_err(|err| match err {
        DeviceError::Rejected(status)
            if mode == CipherMode::Decrypt && status.kind() == StatusKind::CryptoFailure =>
        {
            CipherError::AuthenticationFailed
        }
        other => {
            warn!(target: "tlsvault::record", %slot, ?mode, err = %other, "cipher command failed");
            CipherError::from(other)
        }
    })
}

/// A three-phase HMAC over the device's single MAC context.
///
/// Dropping an unfinished session frees the context.
pub struct MacSession {
    vault: Vault,
    slot: SlotId,
    open: bool,
}

impl MacSession {
    /// Slot of the key the MAC runs under.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Feed `data` in `chunk_size` pieces.
    pub fn update(&mut self, data: &[u8]) -> Result<(), MacError> {
        let mut shared = self.vault.lock();
        let chunk_size = shared.config.chunk_size;
        for chunk in data.chunks(chunk_size) {
            shared.send(&Command::MacUpdate { data: chunk.to_vec() })?;
        }
        Ok(())
    }

    /// Finish and return the tag.
    pub fn finish(mut self) -> Result<Vec<u8>, MacError> {
        self.complete(None)
    }

    /// Finish and have the device compare against `expected`.
    pub fn verify(mut self, expected: &[u8]) -> Result<(), MacError> {
        self.complete(Some(expected.to_vec())).map(|_| ())
    }

    fn complete(&mut self, expected: Option<Vec<u8>>) -> Result<Vec<u8>, MacError> {
        let verifying = expected.is_some();
        let mut shared = self.vault.lock();
        self.open = false;
        shared.mac_owner = None;
        shared
            .send(&Command::MacFinish { expected })
            .map_err(|err| match err {
                DeviceError::Rejected(status) if verifying && status.kind() == StatusKind::CryptoFailure => {
                    MacError::Mismatch
                }
                other => MacError::from(other),
            })
    }
}

impl Drop for MacSession {
    fn drop(&mut self) {
        if self.open {
            let mut shared = self.vault.lock();
            if shared.mac_owner == Some(self.slot) {
                shared.mac_owner = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::SoftElement;
    use crate::slot::SessionId;

    #[test]
    fn test_unknown_slot_rejected() {
        let vault = Vault::new(SoftElement::new());
        let cipher = vault.record_cipher();
        let err = cipher
            .encrypt(
                SlotId::new(3),
                RecordAlgorithm::AesGcm,
                &RecordNonce::Sequence(0),
                b"",
                b"data",
                16,
            )
            .unwrap_err();
        assert_eq!(err, CipherError::UnknownSlot(3));
    }

    #[test]
    fn test_parameter_checks_precede_device() {
        let vault = Vault::new(SoftElement::new());
        let cipher = vault.record_cipher();
        let slot = SlotId::new(0);
        let err = cipher
            .encrypt(
                slot,
                RecordAlgorithm::AesGcm,
                &RecordNonce::Explicit(vec![0; 8]),
                b"",
                b"data",
                16,
            )
            .unwrap_err();
        assert_eq!(err, CipherError::InvalidNonce { expected: 12, actual: 8 });

        let err = cipher
            .decrypt(slot, RecordAlgorithm::AesGcm, &RecordNonce::Sequence(0), b"", b"x", &[0; 8])
            .unwrap_err();
        assert_eq!(err, CipherError::InvalidTag(8));
    }

    #[test]
    fn test_cbc_open_refuses_detached_tag() {
        let vault = Vault::new(SoftElement::new());
        let cipher = vault.record_cipher();
        let err = cipher
            .decrypt(
                SlotId::new(0),
                RecordAlgorithm::AesCbcHmac(Digest::Sha256),
                &RecordNonce::Explicit(vec![0; 16]),
                b"",
                &[0; 48],
                &[0; 32],
            )
            .unwrap_err();
        assert_eq!(err, CipherError::InvalidTag(32));
    }

    #[test]
    fn test_mac_context_is_exclusive() {
        let vault = Vault::new(SoftElement::new());
        let slot = vault.lock().pool.allocate(SessionId::new(99)).unwrap();
        let cipher = vault.record_cipher();
        // No HMAC key in the slot: the device reports NotFound.
        assert!(matches!(
            cipher.compute_finished_mac(slot, Digest::Sha256),
            Err(MacError::DeviceRejected(_))
        ));
        assert!(vault.lock().mac_owner.is_none());

        vault.lock().mac_owner = Some(slot);
        assert!(matches!(
            cipher.compute_finished_mac(slot, Digest::Sha256),
            Err(MacError::Busy)
        ));
    }
}
