//! Simplified TLS 1.2: PRF master secret, key block, verify data.

use tlsvault::command::{CipherMode, Command};
use tlsvault::device::{DeviceStatus, Opcode, StatusKind};
use tlsvault::emulator::SoftElement;
use tlsvault::error::DeviceError;
use tlsvault::suite::RecordAlgorithm;
use tlsvault::{
    CipherError, CipherSuite, CryptoError, NamedGroup, RecordNonce, SecretKind, SecureElement, Session, SessionState,
    Side, Vault,
};

const SUITE: CipherSuite = CipherSuite::EcdheEcdsaAes128GcmSha256;
const CLIENT_RANDOM: [u8; 32] = [0x11; 32];
const SERVER_RANDOM: [u8; 32] = [0x22; 32];

fn pair(vault: &Vault, suite: CipherSuite) -> (Session, Session) {
    let mut client = vault.begin_handshake(Side::Client, suite).unwrap();
    let mut server = vault.begin_handshake(Side::Server, suite).unwrap();
    let client_share = client.generate_key_share(NamedGroup::Secp256r1).unwrap();
    let server_share = server.generate_key_share(NamedGroup::Secp256r1).unwrap();
    let c = client.compute_shared_secret(&server_share).unwrap();
    let s = server.compute_shared_secret(&client_share).unwrap();
    client.derive_tls12_keys(c, &CLIENT_RANDOM, &SERVER_RANDOM).unwrap();
    server.derive_tls12_keys(s, &CLIENT_RANDOM, &SERVER_RANDOM).unwrap();
    (client, server)
}

fn nonce(fixed: &[u8], explicit: u64) -> RecordNonce {
    let mut bytes = fixed.to_vec();
    bytes.extend_from_slice(&explicit.to_be_bytes());
    RecordNonce::Explicit(bytes)
}

#[test]
fn test_key_block_and_records() {
    let vault = Vault::new(SoftElement::new());
    let (mut client, mut server) = pair(&vault, SUITE);

    assert_eq!(client.state(), SessionState::ApplicationKeysReady);
    let ivs = client.tls12_ivs().unwrap().clone();
    assert_eq!(ivs.client.len(), 4);
    assert_eq!(ivs.server.len(), 4);
    assert_eq!(server.tls12_ivs(), Some(&ivs));

    // The premaster secret is gone; the master secret still owes verify data.
    assert!(client.slot_of(SecretKind::SharedSecret, Side::Neutral).is_none());
    assert!(client.slot_of(SecretKind::MasterSecret, Side::Neutral).is_some());

    // TLS 1.2 GCM: 4-byte fixed IV plus 8-byte explicit nonce.
    let sealed = client
        .seal_record(nonce(&ivs.client, 1), b"seq+hdr", b"GET / HTTP/1.1")
        .unwrap();
    let opened = server
        .open_record(nonce(&ivs.client, 1), b"seq+hdr", &sealed.ciphertext, &sealed.tag)
        .unwrap();
    assert_eq!(opened, b"GET / HTTP/1.1");

    // Sequence nonces need a static IV in the key slot, which TLS 1.2 keys lack.
    assert!(matches!(
        client.seal_record(RecordNonce::Sequence(1), b"", b"x"),
        Err(CipherError::DeviceRejected(_))
    ));
}

#[test]
fn test_verify_data_matches_and_releases_master() {
    let vault = Vault::new(SoftElement::new());
    let (mut client, mut server) = pair(&vault, SUITE);
    let hash = SUITE.digest().hash(b"all handshake messages");

    let client_vd = client.tls12_verify_data(Side::Client, &hash).unwrap();
    assert_eq!(client_vd.len(), 12);
    assert_eq!(server.tls12_verify_data(Side::Client, &hash).unwrap(), client_vd);

    let server_vd = client.tls12_verify_data(Side::Server, &hash).unwrap();
    assert_ne!(server_vd, client_vd);

    // Both verify data produced: only the two write keys remain.
    assert!(client.slot_of(SecretKind::MasterSecret, Side::Neutral).is_none());
    assert_eq!(vault.slots_owned_by(client.id()).len(), 2);

    assert_eq!(
        client.tls12_verify_data(Side::Client, &hash),
        Err(CryptoError::MissingParent {
            kind: SecretKind::MasterSecret,
            side: Side::Neutral,
        })
    );
}

#[test]
fn test_cbc_suite_key_block_layout() {
    let suite = CipherSuite::EcdheEcdsaAes256CbcSha384;
    let vault = Vault::new(SoftElement::new());
    let (client, _server) = pair(&vault, suite);
    let ivs = client.tls12_ivs().unwrap();
    assert_eq!(ivs.client.len(), 16);
    assert_eq!(ivs.server.len(), 16);
    assert_ne!(ivs.client, ivs.server);
}

#[test]
fn test_tls12_keys_need_tls12_suite() {
    let vault = Vault::new(SoftElement::new());
    let mut session = vault
        .begin_handshake(Side::Client, CipherSuite::Tls13Aes128GcmSha256)
        .unwrap();
    let slot = session.reserve_slot().unwrap();
    assert!(matches!(
        session.derive_tls12_keys(slot, &CLIENT_RANDOM, &SERVER_RANDOM),
        Err(CryptoError::Unsupported(_))
    ));
}

#[test]
fn test_foreign_premaster_is_refused() {
    let vault = Vault::new(SoftElement::new());
    let mut owner = vault.begin_handshake(Side::Client, SUITE).unwrap();
    let mut thief = vault.begin_handshake(Side::Server, SUITE).unwrap();
    let slot = owner.reserve_slot().unwrap();

    assert_eq!(
        thief.derive_tls12_keys(slot, &CLIENT_RANDOM, &SERVER_RANDOM),
        Err(CryptoError::ForeignSlot(slot.object_id()))
    );
    assert_eq!(thief.state(), SessionState::Idle);
    assert_eq!(vault.slots_owned_by(owner.id()), vec![slot]);
}

/// Software element plus a stand-in CBC record engine. The "encryption" is
/// a fixed XOR mask over `plaintext || mac || padding`, enough to check the
/// record layout the vault hands back.
struct CbcElement {
    inner: SoftElement,
    record: Option<(CipherMode, usize, Vec<u8>)>,
}

const MASK: u8 = 0xA5;
const MAC_BYTE: u8 = 0x3C;

impl CbcElement {
    fn new() -> Self {
        Self {
            inner: SoftElement::new(),
            record: None,
        }
    }

    fn finish(mode: CipherMode, mac_len: usize, data: Vec<u8>) -> Result<Vec<u8>, DeviceError> {
        let failure = || DeviceError::Rejected(DeviceStatus::new(StatusKind::CryptoFailure));
        match mode {
            CipherMode::Encrypt => {
                let mut out = data;
                out.extend(std::iter::repeat(MAC_BYTE).take(mac_len));
                let pad = 16 - out.len() % 16;
                out.extend(std::iter::repeat((pad - 1) as u8).take(pad));
                Ok(out.into_iter().map(|b| b ^ MASK).collect())
            }
            CipherMode::Decrypt => {
                let plain: Vec<u8> = data.into_iter().map(|b| b ^ MASK).collect();
                if plain.is_empty() || plain.len() % 16 != 0 {
                    return Err(failure());
                }
                let pad = usize::from(plain[plain.len() - 1]) + 1;
                let body = plain.len().checked_sub(pad + mac_len).ok_or_else(failure)?;
                if plain[body..body + mac_len].iter().any(|&b| b != MAC_BYTE) {
                    return Err(failure());
                }
                Ok(plain[..body].to_vec())
            }
        }
    }
}

impl SecureElement for CbcElement {
    fn send_command(&mut self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, DeviceError> {
        match Command::decode(opcode, payload)? {
            Command::CipherInit {
                algorithm: RecordAlgorithm::AesCbcHmac(_),
                mode,
                tag_len,
                ..
            } => {
                self.record = Some((mode, usize::from(tag_len), Vec::new()));
                Ok(Vec::new())
            }
            Command::CipherUpdate { data } if self.record.is_some() => {
                if let Some((_, _, buf)) = self.record.as_mut() {
                    buf.extend_from_slice(&data);
                }
                Ok(Vec::new())
            }
            Command::CipherFinish if self.record.is_some() => match self.record.take() {
                Some((mode, mac_len, data)) => Self::finish(mode, mac_len, data),
                None => Ok(Vec::new()),
            },
            _ => self.inner.send_command(opcode, payload),
        }
    }
}

#[test]
fn test_cbc_record_carries_mac_and_padding_in_ciphertext() {
    let suite = CipherSuite::EcdheEcdsaAes128CbcSha256;
    let vault = Vault::new(CbcElement::new());
    let (mut client, mut server) = pair(&vault, suite);
    let iv = RecordNonce::Explicit(vec![0x07; 16]);

    // 14 bytes of data, 32 of MAC and 2 of padding: three blocks.
    let sealed = client.seal_record(iv.clone(), b"seq+hdr", b"GET / HTTP/1.1").unwrap();
    assert_eq!(sealed.ciphertext.len(), 48);
    assert!(sealed.tag.is_empty());
    assert_eq!(client.state(), SessionState::ApplicationKeysReady);

    let opened = server
        .open_record(iv.clone(), b"seq+hdr", &sealed.ciphertext, &sealed.tag)
        .unwrap();
    assert_eq!(opened, b"GET / HTTP/1.1");

    // A detached tag has no place in a CBC record.
    assert_eq!(
        server.open_record(iv.clone(), b"seq+hdr", &sealed.ciphertext, &[0; 32]),
        Err(CipherError::InvalidTag(32))
    );

    // A damaged MAC fails authentication and leaves the session open.
    let mut tampered = sealed.ciphertext.clone();
    tampered[20] ^= 0x01;
    assert_eq!(
        server.open_record(iv, b"seq+hdr", &tampered, &[]),
        Err(CipherError::AuthenticationFailed)
    );
    assert_eq!(server.state(), SessionState::ApplicationKeysReady);
}
