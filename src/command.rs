//! Typed commands for the device channel.
//!
//! Each command encodes to an [`Opcode`] plus payload. A payload opens with
//! a one-byte sub-operation, followed by fixed fields: object ids and
//! lengths as big-endian `u16`, optional object ids as a presence byte plus
//! id, and byte strings with a `u16` length prefix. A byte string longer
//! than `u16::MAX` cannot be framed and fails to encode. Object ids are
//! opaque to the transport.
//!
//! `decode` is the inverse and is what a device (or a test double standing
//! in for one) uses to interpret a payload.

use crate::device::Opcode;
use crate::error::DeviceError;
use crate::record::RecordNonce;
use crate::suite::{Digest, NamedGroup, RecordAlgorithm};

/// What an expand step writes into its destination object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpandTarget {
    Secret,
    /// AES key; the object keeps room for a static IV.
    Key,
    /// Static IV, stored into an existing key object.
    Iv,
    HmacKey,
}

impl ExpandTarget {
    fn wire(self) -> u8 {
        match self {
            Self::Secret => 0x01,
            Self::Key => 0x02,
            Self::Iv => 0x03,
            Self::HmacKey => 0x04,
        }
    }

    fn from_wire(byte: u8) -> Result<Self, DeviceError> {
        match byte {
            0x01 => Ok(Self::Secret),
            0x02 => Ok(Self::Key),
            0x03 => Ok(Self::Iv),
            0x04 => Ok(Self::HmacKey),
            _ => Err(DeviceError::Malformed),
        }
    }
}

/// Direction of a record cipher operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

/// One request to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// HKDF-Extract. `None` salt or IKM means all zeros.
    ExtractSecret {
        digest: Digest,
        salt: Option<u16>,
        ikm: Option<u16>,
        dest: u16,
    },
    /// HKDF-Expand-Label; the device adds the `"tls13 "` prefix.
    ExpandSecret {
        digest: Digest,
        source: u16,
        dest: u16,
        target: ExpandTarget,
        label: Vec<u8>,
        context: Vec<u8>,
        len: u16,
    },
    /// Generate an ephemeral private key; the response is the public share.
    GenerateKeyShare { group: NamedGroup, dest: u16 },
    CreateSharedSecret {
        group: NamedGroup,
        private: u16,
        dest: u16,
        peer: Vec<u8>,
    },
    /// PRF(premaster, "master secret", seed).
    Tls12MasterSecret {
        digest: Digest,
        premaster: u16,
        dest: u16,
        seed: Vec<u8>,
    },
    /// PRF(master, "key expansion", seed); keys stay on the device, the
    /// response carries the client and server IVs.
    Tls12KeyBlock {
        digest: Digest,
        master: u16,
        client_dest: u16,
        server_dest: u16,
        mac_key_len: u8,
        key_len: u8,
        iv_len: u8,
        seed: Vec<u8>,
    },
    /// PRF(master, label, hash)[..12].
    Tls12VerifyData {
        digest: Digest,
        master: u16,
        label: Vec<u8>,
        hash: Vec<u8>,
    },
    /// Open the cipher context on the key object `key`.
    CipherInit {
        key: u16,
        algorithm: RecordAlgorithm,
        mode: CipherMode,
        nonce: RecordNonce,
        aad: Vec<u8>,
        tag_len: u8,
        /// Expected tag when decrypting; empty when encrypting.
        tag: Vec<u8>,
    },
    /// Feed one chunk to the open cipher context.
    CipherUpdate { data: Vec<u8> },
    /// Encrypt: responds with ciphertext then tag (AEAD), or the padded
    /// MAC-then-encrypt record (CBC). Decrypt: plaintext, or
    /// `CryptoFailure` if the record does not authenticate.
    CipherFinish,
    /// Open the MAC context keyed by the HMAC key object `key`.
    MacInit { key: u16, digest: Digest },
    /// Feed one chunk to the open MAC context.
    MacUpdate { data: Vec<u8> },
    /// With `expected`, the device compares and answers with an empty
    /// payload or `CryptoFailure`.
    MacFinish { expected: Option<Vec<u8>> },
    GetRandom { len: u16 },
    /// ECDSA over a prehashed message with the signing key object `key`.
    /// Responds with the plain `r || s` signature.
    Sign { key: u16, hash: Vec<u8> },
    /// Check a plain `r || s` signature with an uncompressed SEC1 public
    /// key. Answers with an empty payload or `CryptoFailure`.
    Verify {
        public_key: Vec<u8>,
        hash: Vec<u8>,
        signature: Vec<u8>,
    },
}

mod sub {
    pub const EXTRACT: u8 = 0x01;
    pub const EXPAND: u8 = 0x02;
    pub const KEY_SHARE: u8 = 0x03;
    pub const SHARED_SECRET: u8 = 0x04;
    pub const TLS12_MASTER: u8 = 0x05;
    pub const TLS12_KEY_BLOCK: u8 = 0x06;
    pub const TLS12_VERIFY: u8 = 0x07;

    pub const INIT: u8 = 0x01;
    pub const UPDATE: u8 = 0x02;
    pub const FINISH: u8 = 0x03;
}

impl Command {
    /// Command class this command is sent under.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::ExtractSecret { .. }
            | Self::ExpandSecret { .. }
            | Self::GenerateKeyShare { .. }
            | Self::CreateSharedSecret { .. }
            | Self::Tls12MasterSecret { .. }
            | Self::Tls12KeyBlock { .. }
            | Self::Tls12VerifyData { .. } => Opcode::KeyExchange,
            Self::CipherInit { .. } | Self::CipherUpdate { .. } | Self::CipherFinish => Opcode::Cipher,
            Self::MacInit { .. } | Self::MacUpdate { .. } | Self::MacFinish { .. } => Opcode::Mac,
            Self::GetRandom { .. } => Opcode::GetRandom,
            Self::Sign { .. } => Opcode::Sign,
            Self::Verify { .. } => Opcode::Verify,
        }
    }

    /// Opcode and payload bytes. Fails with `Malformed` if a byte string
    /// does not fit its length prefix.
    pub fn encode(&self) -> Result<(Opcode, Vec<u8>), DeviceError> {
        let mut w = Writer::default();
        match self {
            Self::ExtractSecret { digest, salt, ikm, dest } => {
                w.u8(sub::EXTRACT);
                w.u8(digest.wire());
                w.opt_u16(*salt);
                w.opt_u16(*ikm);
                w.u16(*dest);
            }
            Self::ExpandSecret { digest, source, dest, target, label, context, len } => {
                w.u8(sub::EXPAND);
                w.u8(digest.wire());
                w.u16(*source);
                w.u16(*dest);
                w.u8(target.wire());
                w.bytes(label)?;
                w.bytes(context)?;
                w.u16(*len);
            }
            Self::GenerateKeyShare { group, dest } => {
                w.u8(sub::KEY_SHARE);
                w.u16(group.id());
                w.u16(*dest);
            }
            Self::CreateSharedSecret { group, private, dest, peer } => {
                w.u8(sub::SHARED_SECRET);
                w.u16(group.id());
                w.u16(*private);
                w.u16(*dest);
                w.bytes(peer)?;
            }
            Self::Tls12MasterSecret { digest, premaster, dest, seed } => {
                w.u8(sub::TLS12_MASTER);
                w.u8(digest.wire());
                w.u16(*premaster);
                w.u16(*dest);
                w.bytes(seed)?;
            }
            Self::Tls12KeyBlock {
                digest,
                master,
                client_dest,
                server_dest,
                mac_key_len,
                key_len,
                iv_len,
                seed,
            } => {
                w.u8(sub::TLS12_KEY_BLOCK);
                w.u8(digest.wire());
                w.u16(*master);
                w.u16(*client_dest);
                w.u16(*server_dest);
                w.u8(*mac_key_len);
                w.u8(*key_len);
                w.u8(*iv_len);
                w.bytes(seed)?;
            }
            Self::Tls12VerifyData { digest, master, label, hash } => {
                w.u8(sub::TLS12_VERIFY);
                w.u8(digest.wire());
                w.u16(*master);
                w.bytes(label)?;
                w.bytes(hash)?;
            }
            Self::CipherInit { key, algorithm, mode, nonce, aad, tag_len, tag } => {
                w.u8(sub::INIT);
                w.u16(*key);
                w.u8(algorithm.wire());
                w.u8(match mode {
                    CipherMode::Encrypt => 0x01,
                    CipherMode::Decrypt => 0x02,
                });
                match nonce {
                    RecordNonce::Sequence(seq) => {
                        w.u8(0x01);
                        w.u64(*seq);
                    }
                    RecordNonce::Explicit(bytes) => {
                        w.u8(0x02);
                        w.bytes(bytes)?;
                    }
                }
                w.bytes(aad)?;
                w.u8(*tag_len);
                w.bytes(tag)?;
            }
            Self::CipherUpdate { data } | Self::MacUpdate { data } => {
                w.u8(sub::UPDATE);
                w.bytes(data)?;
            }
            Self::CipherFinish => w.u8(sub::FINISH),
            Self::MacInit { key, digest } => {
                w.u8(sub::INIT);
                w.u16(*key);
                w.u8(digest.wire());
            }
            Self::MacFinish { expected } => {
                w.u8(sub::FINISH);
                match expected {
                    Some(tag) => {
                        w.u8(1);
                        w.bytes(tag)?;
                    }
                    None => w.u8(0),
                }
            }
            Self::GetRandom { len } => {
                w.u8(sub::INIT);
                w.u16(*len);
            }
            Self::Sign { key, hash } => {
                w.u8(sub::INIT);
                w.u16(*key);
                w.bytes(hash)?;
            }
            Self::Verify {
                public_key,
                hash,
                signature,
            } => {
                w.u8(sub::INIT);
                w.bytes(public_key)?;
                w.bytes(hash)?;
                w.bytes(signature)?;
            }
        }
        Ok((self.opcode(), w.0))
    }

    /// Parse a payload received under `opcode`.
    pub fn decode(opcode: Opcode, payload: &[u8]) -> Result<Self, DeviceError> {
        let mut r = Reader(payload);
        let op = r.u8()?;
        let cmd = match (opcode, op) {
            (Opcode::KeyExchange, sub::EXTRACT) => Self::ExtractSecret {
                digest: r.digest()?,
                salt: r.opt_u16()?,
                ikm: r.opt_u16()?,
                dest: r.u16()?,
            },
            (Opcode::KeyExchange, sub::EXPAND) => Self::ExpandSecret {
                digest: r.digest()?,
                source: r.u16()?,
                dest: r.u16()?,
                target: ExpandTarget::from_wire(r.u8()?)?,
                label: r.bytes()?,
                context: r.bytes()?,
                len: r.u16()?,
            },
            (Opcode::KeyExchange, sub::KEY_SHARE) => Self::GenerateKeyShare {
                group: r.group()?,
                dest: r.u16()?,
            },
            (Opcode::KeyExchange, sub::SHARED_SECRET) => Self::CreateSharedSecret {
                group: r.group()?,
                private: r.u16()?,
                dest: r.u16()?,
                peer: r.bytes()?,
            },
            (Opcode::KeyExchange, sub::TLS12_MASTER) => Self::Tls12MasterSecret {
                digest: r.digest()?,
                premaster: r.u16()?,
                dest: r.u16()?,
                seed: r.bytes()?,
            },
            (Opcode::KeyExchange, sub::TLS12_KEY_BLOCK) => Self::Tls12KeyBlock {
                digest: r.digest()?,
                master: r.u16()?,
                client_dest: r.u16()?,
                server_dest: r.u16()?,
                mac_key_len: r.u8()?,
                key_len: r.u8()?,
                iv_len: r.u8()?,
                seed: r.bytes()?,
            },
            (Opcode::KeyExchange, sub::TLS12_VERIFY) => Self::Tls12VerifyData {
                digest: r.digest()?,
                master: r.u16()?,
                label: r.bytes()?,
                hash: r.bytes()?,
            },
            (Opcode::Cipher, sub::INIT) => {
                let key = r.u16()?;
                let algorithm = RecordAlgorithm::from_wire(r.u8()?).ok_or(DeviceError::Malformed)?;
                let mode = match r.u8()? {
                    0x01 => CipherMode::Encrypt,
                    0x02 => CipherMode::Decrypt,
                    _ => return Err(DeviceError::Malformed),
                };
                let nonce = match r.u8()? {
                    0x01 => RecordNonce::Sequence(r.u64()?),
                    0x02 => RecordNonce::Explicit(r.bytes()?),
                    _ => return Err(DeviceError::Malformed),
                };
                Self::CipherInit {
                    key,
                    algorithm,
                    mode,
                    nonce,
                    aad: r.bytes()?,
                    tag_len: r.u8()?,
                    tag: r.bytes()?,
                }
            }
            (Opcode::Cipher, sub::UPDATE) => Self::CipherUpdate { data: r.bytes()? },
            (Opcode::Cipher, sub::FINISH) => Self::CipherFinish,
            (Opcode::Mac, sub::INIT) => Self::MacInit {
                key: r.u16()?,
                digest: r.digest()?,
            },
            (Opcode::Mac, sub::UPDATE) => Self::MacUpdate { data: r.bytes()? },
            (Opcode::Mac, sub::FINISH) => Self::MacFinish {
                expected: match r.u8()? {
                    0 => None,
                    1 => Some(r.bytes()?),
                    _ => return Err(DeviceError::Malformed),
                },
            },
            (Opcode::GetRandom, sub::INIT) => Self::GetRandom { len: r.u16()? },
            (Opcode::Sign, sub::INIT) => Self::Sign {
                key: r.u16()?,
                hash: r.bytes()?,
            },
            (Opcode::Verify, sub::INIT) => Self::Verify {
                public_key: r.bytes()?,
                hash: r.bytes()?,
                signature: r.bytes()?,
            },
            _ => return Err(DeviceError::Malformed),
        };
        if !r.0.is_empty() {
            return Err(DeviceError::Malformed);
        }
        Ok(cmd)
    }
}

// ---------------------------------------------------------------------------
// Payload primitives
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn opt_u16(&mut self, v: Option<u16>) {
        match v {
            Some(id) => {
                self.u8(1);
                self.u16(id);
            }
            None => self.u8(0),
        }
    }

    fn bytes(&mut self, v: &[u8]) -> Result<(), DeviceError> {
        let len = u16::try_from(v.len()).map_err(|_| DeviceError::Malformed)?;
        self.u16(len);
        self.0.extend_from_slice(v);
        Ok(())
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DeviceError> {
        if self.0.len() < n {
            return Err(DeviceError::Malformed);
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DeviceError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DeviceError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64, DeviceError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn opt_u16(&mut self) -> Result<Option<u16>, DeviceError> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.u16()?)),
            _ => Err(DeviceError::Malformed),
        }
    }

    fn bytes(&mut self) -> Result<Vec<u8>, DeviceError> {
        let len = usize::from(self.u16()?);
        Ok(self.take(len)?.to_vec())
    }

    fn digest(&mut self) -> Result<Digest, DeviceError> {
        Digest::from_wire(self.u8()?).ok_or(DeviceError::Malformed)
    }

    fn group(&mut self) -> Result<NamedGroup, DeviceError> {
        NamedGroup::from_id(self.u16()?).ok_or(DeviceError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_layout() {
        let cmd = Command::ExpandSecret {
            digest: Digest::Sha256,
            source: 0x0003,
            dest: 0x0007,
            target: ExpandTarget::Secret,
            label: b"derived".to_vec(),
            context: vec![0xAA; 2],
            len: 32,
        };
        let (op, payload) = cmd.encode().unwrap();
        assert_eq!(op, Opcode::KeyExchange);
        assert_eq!(
            payload,
            [
                &[0x02, 0x01, 0x00, 0x03, 0x00, 0x07, 0x01, 0x00, 0x07][..],
                &b"derived"[..],
                &[0x00, 0x02, 0xAA, 0xAA, 0x00, 0x20][..],
            ]
            .concat()
        );
        assert_eq!(Command::decode(op, &payload).unwrap(), cmd);
    }

    #[test]
    fn test_cipher_init_with_sequence_nonce() {
        let cmd = Command::CipherInit {
            key: 2,
            algorithm: RecordAlgorithm::AesGcm,
            mode: CipherMode::Decrypt,
            nonce: RecordNonce::Sequence(7),
            aad: vec![0x17, 0x03, 0x03],
            tag_len: 16,
            tag: vec![0u8; 16],
        };
        let (op, payload) = cmd.encode().unwrap();
        assert_eq!(op, Opcode::Cipher);
        assert_eq!(Command::decode(op, &payload).unwrap(), cmd);
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let (op, payload) = Command::GetRandom { len: 32 }.encode().unwrap();
        assert_eq!(
            Command::decode(op, &payload[..payload.len() - 1]),
            Err(DeviceError::Malformed)
        );
        assert_eq!(Command::decode(Opcode::Mac, &payload), Err(DeviceError::Malformed));
    }

    #[test]
    fn test_oversized_chunk_fails_to_encode() {
        let fits = Command::CipherUpdate {
            data: vec![0; usize::from(u16::MAX)],
        };
        let (_, payload) = fits.encode().unwrap();
        assert_eq!(payload.len(), 3 + usize::from(u16::MAX));

        let too_long = Command::MacUpdate {
            data: vec![0; usize::from(u16::MAX) + 1],
        };
        assert_eq!(too_long.encode(), Err(DeviceError::Malformed));
    }

    #[test]
    fn test_verify_layout() {
        let cmd = Command::Verify {
            public_key: vec![0x04; 65],
            hash: vec![0x11; 32],
            signature: vec![0x22; 64],
        };
        let (op, payload) = cmd.encode().unwrap();
        assert_eq!(op, Opcode::Verify);
        assert_eq!(payload.len(), 1 + (2 + 65) + (2 + 32) + (2 + 64));
        assert_eq!(Command::decode(op, &payload).unwrap(), cmd);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let (op, mut payload) = Command::CipherFinish.encode().unwrap();
        payload.push(0);
        assert_eq!(Command::decode(op, &payload), Err(DeviceError::Malformed));
    }
}
