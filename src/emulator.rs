//! A software secure element.
//!
//! `SoftElement` answers the same command set as the hardware, with real
//! cryptography from `ring` (HKDF, TLS 1.2 PRF, AES-GCM, HMAC, randomness)
//! and from `x25519-dalek` / `p256` (ECDHE, ECDSA). Material lives in a map
//! keyed by object id and is zeroised when overwritten or dropped. Like the
//! hardware it holds one cipher context and one MAC context at a time.
//!
//! A freed pool slot keeps its material until the next write to that
//! object, the way the hardware's temporary objects do; the pool never
//! hands out a slot without the write that overwrites it.
//!
//! It exists for tests, benchmarks and development without a board
//! attached. AES-CCM and CBC records are reported as unsupported.

use std::collections::HashMap;

use p256::ecdh::diffie_hellman;
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::hkdf;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::trace;
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::command::{CipherMode, Command, ExpandTarget};
use crate::device::{DeviceStatus, Opcode, SecureElement, StatusKind};
use crate::error::DeviceError;
use crate::record::RecordNonce;
use crate::suite::{Digest, NamedGroup, RecordAlgorithm};

const GCM_NONCE_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const VERIFY_DATA_LEN: usize = 12;
const TLS12_MASTER_LEN: usize = 48;

#[derive(Zeroize, ZeroizeOnDrop)]
struct KeyBytes(Vec<u8>);

enum Material {
    Secret(KeyBytes),
    AesKey { key: KeyBytes, iv: KeyBytes },
    HmacKey(KeyBytes),
    X25519(StaticSecret),
    P256(p256::SecretKey),
    SigningKey(SigningKey),
}

struct CipherContext {
    key: KeyBytes,
    mode: CipherMode,
    nonce: [u8; GCM_NONCE_LEN],
    aad: Vec<u8>,
    tag: Vec<u8>,
    data: KeyBytes,
}

struct MacContext {
    key: KeyBytes,
    digest: Digest,
    data: Vec<u8>,
}

/// Software stand-in for the secure element.
pub struct SoftElement {
    objects: HashMap<u16, Material>,
    cipher: Option<CipherContext>,
    mac: Option<MacContext>,
    rng: SystemRandom,
}

impl Default for SoftElement {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftElement {
    /// An element with no provisioned objects.
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            cipher: None,
            mac: None,
            rng: SystemRandom::new(),
        }
    }

    /// Provision a secret object, as a manufacturing step would load a PSK.
    pub fn provision_secret(&mut self, object_id: u16, secret: &[u8]) {
        self.objects
            .insert(object_id, Material::Secret(KeyBytes(secret.to_vec())));
    }

    /// Builder form of [`provision_secret`](Self::provision_secret).
    pub fn with_secret(mut self, object_id: u16, secret: &[u8]) -> Self {
        self.provision_secret(object_id, secret);
        self
    }

    /// Provision a P-256 signing key at `object_id`. Returns the public key
    /// as an uncompressed SEC1 point, as a certificate would carry it.
    pub fn provision_signing_key(&mut self, object_id: u16) -> Vec<u8> {
        let key = SigningKey::random(&mut OsRng);
        let public = VerifyingKey::from(&key).to_encoded_point(false).as_bytes().to_vec();
        self.objects.insert(object_id, Material::SigningKey(key));
        public
    }

    /// Number of objects holding material.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn execute(&mut self, command: Command) -> Result<Vec<u8>, DeviceError> {
        match command {
            Command::ExtractSecret { digest, salt, ikm, dest } => {
                let zeros = vec![0u8; digest.output_len()];
                let salt = match salt {
                    Some(id) => self.secret(id)?.to_vec(),
                    None => zeros.clone(),
                };
                let ikm = match ikm {
                    Some(id) => self.secret(id)?.to_vec(),
                    None => zeros,
                };
                let prk = hmac::sign(&hmac::Key::new(hmac_algorithm(digest), &salt), &ikm);
                self.store(dest, Material::Secret(KeyBytes(prk.as_ref().to_vec())));
                Ok(Vec::new())
            }
            Command::ExpandSecret {
                digest,
                source,
                dest,
                target,
                label,
                context,
                len,
            } => {
                let out = expand_label(digest, self.secret(source)?, &label, &context, usize::from(len))?;
                match target {
                    ExpandTarget::Secret => self.store(dest, Material::Secret(out)),
                    ExpandTarget::HmacKey => self.store(dest, Material::HmacKey(out)),
                    ExpandTarget::Key => {
                        aes_algorithm(out.0.len())?;
                        self.store(
                            dest,
                            Material::AesKey {
                                key: out,
                                iv: KeyBytes(Vec::new()),
                            },
                        );
                    }
                    ExpandTarget::Iv => match self.objects.get_mut(&dest) {
                        Some(Material::AesKey { iv, .. }) => *iv = out,
                        Some(_) => return Err(reject(StatusKind::WrongParams)),
                        None => return Err(reject(StatusKind::NotFound)),
                    },
                }
                Ok(Vec::new())
            }
            Command::GenerateKeyShare { group, dest } => {
                let (material, share) = match group {
                    NamedGroup::X25519 => {
                        let secret = StaticSecret::random_from_rng(OsRng);
                        let public = x25519_dalek::PublicKey::from(&secret);
                        (Material::X25519(secret), public.as_bytes().to_vec())
                    }
                    NamedGroup::Secp256r1 => {
                        let secret = p256::SecretKey::random(&mut OsRng);
                        let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                        (Material::P256(secret), public)
                    }
                };
                self.store(dest, material);
                Ok(share)
            }
            Command::CreateSharedSecret {
                group,
                private,
                dest,
                peer,
            } => {
                let shared = match (group, self.objects.get(&private)) {
                    (_, None) => return Err(reject(StatusKind::NotFound)),
                    (NamedGroup::X25519, Some(Material::X25519(secret))) => {
                        let peer: [u8; 32] = peer
                            .as_slice()
                            .try_into()
                            .map_err(|_| reject(StatusKind::WrongParams))?;
                        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer));
                        if shared.as_bytes() == &[0u8; 32] {
                            return Err(reject(StatusKind::CryptoFailure));
                        }
                        KeyBytes(shared.as_bytes().to_vec())
                    }
                    (NamedGroup::Secp256r1, Some(Material::P256(secret))) => {
                        let peer = p256::PublicKey::from_sec1_bytes(&peer)
                            .map_err(|_| reject(StatusKind::WrongParams))?;
                        let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
                        KeyBytes(shared.raw_secret_bytes().to_vec())
                    }
                    _ => return Err(reject(StatusKind::WrongParams)),
                };
                self.store(dest, Material::Secret(shared));
                Ok(Vec::new())
            }
            Command::Tls12MasterSecret {
                digest,
                premaster,
                dest,
                seed,
            } => {
                let master = prf(digest, self.secret(premaster)?, b"master secret", &seed, TLS12_MASTER_LEN);
                self.store(dest, Material::Secret(master));
                Ok(Vec::new())
            }
            Command::Tls12KeyBlock {
                digest,
                master,
                client_dest,
                server_dest,
                mac_key_len,
                key_len,
                iv_len,
                seed,
            } => {
                let (mac, key, iv) = (usize::from(mac_key_len), usize::from(key_len), usize::from(iv_len));
                aes_algorithm(key)?;
                let block = prf(digest, self.secret(master)?, b"key expansion", &seed, 2 * (mac + key + iv));
                // client MAC, server MAC, client key, server key, client IV, server IV
                let keys = &block.0[2 * mac..];
                let client_key = KeyBytes(keys[..key].to_vec());
                let server_key = KeyBytes(keys[key..2 * key].to_vec());
                let ivs = keys[2 * key..].to_vec();
                let empty = || KeyBytes(Vec::new());
                self.store(client_dest, Material::AesKey { key: client_key, iv: empty() });
                self.store(server_dest, Material::AesKey { key: server_key, iv: empty() });
                Ok(ivs)
            }
            Command::Tls12VerifyData {
                digest,
                master,
                label,
                hash,
            } => {
                let out = prf(digest, self.secret(master)?, &label, &hash, VERIFY_DATA_LEN);
                Ok(out.0.clone())
            }
            Command::CipherInit {
                key,
                algorithm,
                mode,
                nonce,
                aad,
                tag_len,
                tag,
            } => {
                if algorithm != RecordAlgorithm::AesGcm {
                    return Err(reject(StatusKind::AlgorithmNotSupported));
                }
                if usize::from(tag_len) != GCM_TAG_LEN {
                    return Err(reject(StatusKind::WrongParams));
                }
                let (key, static_iv) = match self.objects.get(&key) {
                    Some(Material::AesKey { key, iv }) => (KeyBytes(key.0.clone()), iv),
                    Some(_) => return Err(reject(StatusKind::WrongParams)),
                    None => return Err(reject(StatusKind::NotFound)),
                };
                let nonce = record_nonce(&static_iv.0, &nonce)?;
                self.cipher = Some(CipherContext {
                    key,
                    mode,
                    nonce,
                    aad,
                    tag,
                    data: KeyBytes(Vec::new()),
                });
                Ok(Vec::new())
            }
            Command::CipherUpdate { data } => {
                let ctx = self.cipher.as_mut().ok_or_else(|| reject(StatusKind::WrongParams))?;
                ctx.data.0.extend_from_slice(&data);
                Ok(Vec::new())
            }
            Command::CipherFinish => {
                let ctx = self.cipher.take().ok_or_else(|| reject(StatusKind::WrongParams))?;
                run_gcm(ctx)
            }
            Command::MacInit { key, digest } => {
                let key = match self.objects.get(&key) {
                    Some(Material::HmacKey(k)) => KeyBytes(k.0.clone()),
                    Some(_) => return Err(reject(StatusKind::WrongParams)),
                    None => return Err(reject(StatusKind::NotFound)),
                };
                self.mac = Some(MacContext {
                    key,
                    digest,
                    data: Vec::new(),
                });
                Ok(Vec::new())
            }
            Command::MacUpdate { data } => {
                let ctx = self.mac.as_mut().ok_or_else(|| reject(StatusKind::WrongParams))?;
                ctx.data.extend_from_slice(&data);
                Ok(Vec::new())
            }
            Command::MacFinish { expected } => {
                let ctx = self.mac.take().ok_or_else(|| reject(StatusKind::WrongParams))?;
                let key = hmac::Key::new(hmac_algorithm(ctx.digest), &ctx.key.0);
                match expected {
                    Some(tag) => {
                        hmac::verify(&key, &ctx.data, &tag).map_err(|_| reject(StatusKind::CryptoFailure))?;
                        Ok(Vec::new())
                    }
                    None => Ok(hmac::sign(&key, &ctx.data).as_ref().to_vec()),
                }
            }
            Command::GetRandom { len } => {
                let mut buf = vec![0u8; usize::from(len)];
                self.rng
                    .fill(&mut buf)
                    .map_err(|_| reject(StatusKind::CryptoFailure))?;
                Ok(buf)
            }
            Command::Sign { key, hash } => {
                let key = match self.objects.get(&key) {
                    Some(Material::SigningKey(k)) => k,
                    Some(_) => return Err(reject(StatusKind::WrongParams)),
                    None => return Err(reject(StatusKind::NotFound)),
                };
                let signature: Signature = key
                    .sign_prehash(&hash)
                    .map_err(|_| reject(StatusKind::WrongParams))?;
                Ok(signature.to_bytes().to_vec())
            }
            Command::Verify {
                public_key,
                hash,
                signature,
            } => {
                let key = VerifyingKey::from_sec1_bytes(&public_key).map_err(|_| reject(StatusKind::WrongParams))?;
                let signature = Signature::from_slice(&signature).map_err(|_| reject(StatusKind::CryptoFailure))?;
                key.verify_prehash(&hash, &signature)
                    .map_err(|_| reject(StatusKind::CryptoFailure))?;
                Ok(Vec::new())
            }
        }
    }

    fn secret(&self, object_id: u16) -> Result<&[u8], DeviceError> {
        match self.objects.get(&object_id) {
            Some(Material::Secret(bytes)) => Ok(&bytes.0),
            Some(_) => Err(reject(StatusKind::WrongParams)),
            None => Err(reject(StatusKind::NotFound)),
        }
    }

    fn store(&mut self, object_id: u16, material: Material) {
        self.objects.insert(object_id, material);
    }
}

impl SecureElement for SoftElement {
    fn send_command(&mut self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let command = Command::decode(opcode, payload)?;
        trace!(target: "tlsvault::emulator", ?opcode, len = payload.len(), "command");
        self.execute(command)
    }
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

fn reject(kind: StatusKind) -> DeviceError {
    DeviceError::Rejected(DeviceStatus::new(kind))
}

fn hmac_algorithm(digest: Digest) -> hmac::Algorithm {
    match digest {
        Digest::Sha256 => hmac::HMAC_SHA256,
        Digest::Sha384 => hmac::HMAC_SHA384,
    }
}

fn hkdf_algorithm(digest: Digest) -> hkdf::Algorithm {
    match digest {
        Digest::Sha256 => hkdf::HKDF_SHA256,
        Digest::Sha384 => hkdf::HKDF_SHA384,
    }
}

fn aes_algorithm(key_len: usize) -> Result<&'static aead::Algorithm, DeviceError> {
    match key_len {
        16 => Ok(&aead::AES_128_GCM),
        32 => Ok(&aead::AES_256_GCM),
        _ => Err(reject(StatusKind::WrongParams)),
    }
}

struct OutputLen(usize);

impl hkdf::KeyType for OutputLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Expand-Label (RFC 8446 §7.1).
fn expand_label(
    digest: Digest,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    len: usize,
) -> Result<KeyBytes, DeviceError> {
    const PREFIX: &[u8] = b"tls13 ";
    if PREFIX.len() + label.len() > 255 || context.len() > 255 {
        return Err(reject(StatusKind::WrongParams));
    }
    let mut info = Vec::with_capacity(4 + PREFIX.len() + label.len() + context.len());
    info.extend_from_slice(&(len as u16).to_be_bytes());
    info.push((PREFIX.len() + label.len()) as u8);
    info.extend_from_slice(PREFIX);
    info.extend_from_slice(label);
    info.push(context.len() as u8);
    info.extend_from_slice(context);

    let prk = hkdf::Prk::new_less_safe(hkdf_algorithm(digest), secret);
    let info = [info.as_slice()];
    let okm = prk
        .expand(&info, OutputLen(len))
        .map_err(|_| reject(StatusKind::WrongParams))?;
    let mut out = KeyBytes(vec![0u8; len]);
    okm.fill(&mut out.0)
        .map_err(|_| reject(StatusKind::CryptoFailure))?;
    Ok(out)
}

/// TLS 1.2 PRF: P_hash(secret, label || seed).
fn prf(digest: Digest, secret: &[u8], label: &[u8], seed: &[u8], len: usize) -> KeyBytes {
    let key = hmac::Key::new(hmac_algorithm(digest), secret);
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    let mut out = KeyBytes(Vec::with_capacity(len));
    let mut a = hmac::sign(&key, &label_seed);
    while out.0.len() < len {
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(a.as_ref());
        ctx.update(&label_seed);
        let block = ctx.sign();
        let take = (len - out.0.len()).min(block.as_ref().len());
        out.0.extend_from_slice(&block.as_ref()[..take]);
        a = hmac::sign(&key, a.as_ref());
    }
    out
}

/// Per-record nonce: static IV XOR the left-padded sequence number, or an
/// explicit nonce when the key carries no IV.
fn record_nonce(static_iv: &[u8], nonce: &RecordNonce) -> Result<[u8; GCM_NONCE_LEN], DeviceError> {
    let mut out = [0u8; GCM_NONCE_LEN];
    match nonce {
        RecordNonce::Sequence(seq) => {
            if static_iv.len() != GCM_NONCE_LEN {
                return Err(reject(StatusKind::WrongParams));
            }
            out.copy_from_slice(static_iv);
            for (o, s) in out[GCM_NONCE_LEN - 8..].iter_mut().zip(seq.to_be_bytes()) {
                *o ^= s;
            }
        }
        RecordNonce::Explicit(bytes) => {
            if bytes.len() != GCM_NONCE_LEN {
                return Err(reject(StatusKind::WrongParams));
            }
            out.copy_from_slice(bytes);
        }
    }
    Ok(out)
}

fn run_gcm(mut ctx: CipherContext) -> Result<Vec<u8>, DeviceError> {
    let algorithm = aes_algorithm(ctx.key.0.len())?;
    let unbound = UnboundKey::new(algorithm, &ctx.key.0).map_err(|_| reject(StatusKind::WrongParams))?;
    let key = LessSafeKey::new(unbound);
    let nonce = Nonce::assume_unique_for_key(ctx.nonce);
    let aad = Aad::from(ctx.aad.as_slice());

    match ctx.mode {
        CipherMode::Encrypt => {
            let tag = key
                .seal_in_place_separate_tag(nonce, aad, &mut ctx.data.0)
                .map_err(|_| reject(StatusKind::CryptoFailure))?;
            let mut out = ctx.data.0.clone();
            out.extend_from_slice(tag.as_ref());
            Ok(out)
        }
        CipherMode::Decrypt => {
            if ctx.tag.len() != GCM_TAG_LEN {
                return Err(reject(StatusKind::WrongParams));
            }
            ctx.data.0.extend_from_slice(&ctx.tag);
            let plain = key
                .open_in_place(nonce, aad, &mut ctx.data.0)
                .map_err(|_| reject(StatusKind::CryptoFailure))?;
            Ok(plain.to_vec())
        }
    }
}
