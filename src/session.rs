//! Per-connection key schedule driver.
//!
//! A [`Session`] is what the TLS stack talks to. It owns the session's
//! [`SecretChain`], tracks [`SessionState`] and the active traffic phase,
//! and runs each request through the router and the engine while holding
//! the vault lock.
//!
//! State only moves forward, and only on successful derivations:
//!
//! ```text
//! Idle → EarlySecretReady → HandshakeSecretReady → MasterSecretReady → ApplicationKeysReady
//!   └──────────────────────────── any hardware failure / close() ─────────────────────────► Closed
//! ```
//!
//! Derivation methods do not check the state order themselves: asking for
//! a step whose parent is absent fails with `MissingParent` from the chain.
//! Non-hardware errors leave the session as it was; device rejections and
//! transport failures close it, whether they come from a derivation, a
//! record operation, a Finished MAC or a signature. `close()` releases
//! every slot the session holds and never fails. Dropping a session closes
//! it.
//!
//! Handshake traffic keys outlive the application derivation: each
//! direction switches to its application key at a different point, so the
//! TLS stack retires them per side with [`Session::retire_handshake_key`].
//! The resumption master secret retires whatever is left.

use p256::ecdsa::Signature;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::AuditEvent;
use crate::chain::{Phase, Product, SecretChain, SecretKind, Side};
use crate::engine::Engine;
use crate::error::{CipherError, CryptoError, DeviceError, MacError};
use crate::record::{MacSession, RecordNonce, SealedRecord};
use crate::router::{self, ExtractInput, Ikm, Label, Route, RouteContext, Salt};
use crate::slot::{SessionId, SlotId};
use crate::suite::{CipherSuite, NamedGroup, Protocol};
use crate::Vault;

/// Where a session is in the key schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Nothing derived yet.
    Idle,
    /// Early secret (plain or PSK) is live.
    EarlySecretReady,
    HandshakeSecretReady,
    MasterSecretReady,
    /// Both application traffic keys and IVs exist.
    ApplicationKeysReady,
    /// Terminal. Every slot has been released.
    Closed,
}

/// A provisioned (non-pool) device object holding a pre-shared key or a
/// signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProvisionedKey(u16);

impl ProvisionedKey {
    /// Name the device object `object_id`. Nothing is checked until use.
    pub fn new(object_id: u16) -> Self {
        Self(object_id)
    }

    /// Raw device object id.
    pub fn object_id(self) -> u16 {
        self.0
    }
}

/// Selects the binder label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PskKind {
    /// Externally provisioned: `"ext binder"`.
    External,
    /// From an earlier session ticket: `"res binder"`.
    Resumption,
}

/// Slots produced by [`Session::derive_traffic_secrets`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSlots {
    /// Client traffic secret.
    pub client_secret: SlotId,
    /// Server traffic secret.
    pub server_secret: SlotId,
    /// Client write key, with its static IV in the same object.
    pub client_key: SlotId,
    /// Server write key, with its static IV in the same object.
    pub server_key: SlotId,
}

/// Fixed IVs from the TLS 1.2 key block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tls12Ivs {
    /// Client write IV.
    pub client: Vec<u8>,
    /// Server write IV.
    pub server: Vec<u8>,
}

/// One endpoint's key schedule on the vault.
///
/// Every slot it derives is owned by its [`SessionId`] and released by
/// [`Session::close`] or on drop.
pub struct Session {
    vault: Vault,
    id: SessionId,
    side: Side,
    suite: CipherSuite,
    state: SessionState,
    history: Vec<SessionState>,
    chain: SecretChain,
    psk: Option<(ProvisionedKey, PskKind)>,
    traffic_phase: Phase,
    group: Option<NamedGroup>,
    tls12_ivs: Option<Tls12Ivs>,
}

impl Session {
    pub(crate) fn new(vault: Vault, id: SessionId, side: Side, suite: CipherSuite) -> Self {
        debug!(target: "tlsvault::session", session = %id, ?side, suite = suite.id(), "begin handshake");
        Self {
            vault,
            id,
            side,
            suite,
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
            chain: SecretChain::new(suite.protocol()),
            psk: None,
            traffic_phase: Phase::Handshake,
            group: None,
            tls12_ivs: None,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Owner id of every slot this session allocates.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Which endpoint this session is.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Negotiated cipher suite.
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Current schedule state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state the session has been in, in order.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Phase whose traffic secrets a generic `"key"`/`"iv"` expands from.
    pub fn traffic_phase(&self) -> Phase {
        self.traffic_phase
    }

    /// Override which traffic secrets a generic `"key"`/`"iv"` expands
    /// from. Record keys are unaffected; see [`Session::seal_record`].
    pub fn set_traffic_phase(&mut self, phase: Phase) {
        self.traffic_phase = phase;
    }

    /// Whether a PSK was set for this handshake.
    pub fn psk_active(&self) -> bool {
        self.psk.is_some()
    }

    /// Slot currently holding `kind` for `side`, if live.
    pub fn slot_of(&self, kind: SecretKind, side: Side) -> Option<SlotId> {
        self.chain.slot_of(kind, side)
    }

    /// Read-only view of the secret chain.
    pub fn chain(&self) -> &SecretChain {
        &self.chain
    }

    /// TLS 1.2 fixed IVs, once the key block exists.
    pub fn tls12_ivs(&self) -> Option<&Tls12Ivs> {
        self.tls12_ivs.as_ref()
    }

    fn route_context(&self) -> RouteContext {
        RouteContext {
            state: self.state,
            psk: self.psk.is_some(),
            traffic_phase: self.traffic_phase,
        }
    }

    // -----------------------------------------------------------------------
    // Key exchange
    // -----------------------------------------------------------------------

    /// Use a provisioned PSK for this handshake. Only before the early secret.
    pub fn set_psk(&mut self, key: ProvisionedKey, kind: PskKind) -> Result<(), CryptoError> {
        self.expect_state(SessionState::Idle)?;
        self.psk = Some((key, kind));
        Ok(())
    }

    /// Generate an ephemeral key pair on the device; returns the public share.
    pub fn generate_key_share(&mut self, group: NamedGroup) -> Result<Vec<u8>, CryptoError> {
        let share = self.run(|e| e.key_share(group))?;
        self.group = Some(group);
        Ok(share)
    }

    /// ECDH with the peer's share. The ephemeral key's slot is released and
    /// the shared secret's slot returned.
    pub fn compute_shared_secret(&mut self, peer_share: &[u8]) -> Result<SlotId, CryptoError> {
        let group = self.group.ok_or(CryptoError::MissingParent {
            kind: SecretKind::EphemeralKey,
            side: Side::Neutral,
        })?;
        self.run(|e| e.shared_secret(group, peer_share))
    }

    /// Allocate a bare slot owned by this session, e.g. for a shared
    /// secret another component writes. Released by `close()`.
    pub fn reserve_slot(&mut self) -> Result<SlotId, CryptoError> {
        self.ensure_open()?;
        let slot = self.vault.lock().pool.allocate(self.id)?;
        Ok(slot)
    }

    // -----------------------------------------------------------------------
    // TLS 1.3 schedule
    // -----------------------------------------------------------------------

    /// HKDF-Extract(0, 0), or HKDF-Extract(0, PSK) in PSK mode.
    pub fn derive_early_secret(&mut self) -> Result<SlotId, CryptoError> {
        self.expect_state(SessionState::Idle)?;
        let ikm = if self.psk.is_some() { Ikm::Psk } else { Ikm::Zero };
        self.hkdf_extract(ExtractInput::new(Salt::Zero, ikm))
    }

    /// Binder key from the PSK early secret.
    pub fn derive_binder_key(&mut self) -> Result<SlotId, CryptoError> {
        self.ensure_open()?;
        let label = match self.psk {
            Some((_, PskKind::Resumption)) => Label::ResumptionBinder,
            _ => Label::ExternalBinder,
        };
        let route = router::route_expand(label, Side::Neutral, &self.route_context())?;
        let digest = self.suite.digest();
        self.run(|e| e.expand(&route, label, &digest.empty_hash(), digest.output_len()))
    }

    /// `"derived"` from the early secret, then HKDF-Extract with the
    /// shared secret in `shared_secret` as IKM.
    pub fn derive_handshake_secret(&mut self, shared_secret: SlotId) -> Result<SlotId, CryptoError> {
        let early = if self.psk.is_some() {
            SecretKind::HsEarlySecret
        } else {
            SecretKind::EarlySecret
        };
        let derived = Route::new(SecretKind::DerivedSecret, Phase::Handshake, &[early], Product::Secret);
        let extract = Route::new(
            SecretKind::HandshakeSecret,
            Phase::Handshake,
            &[SecretKind::DerivedSecret, SecretKind::SharedSecret],
            Product::Secret,
        );
        let digest = self.suite.digest();
        let slot = self.run(|e| {
            e.adopt(SecretKind::SharedSecret, shared_secret)?;
            e.expand(&derived, Label::Derived, &digest.empty_hash(), digest.output_len())?;
            e.extract(&extract, None)
        })?;
        self.advance(SessionState::HandshakeSecretReady);
        Ok(slot)
    }

    /// `"derived"` from the handshake secret, then HKDF-Extract with a zero IKM.
    pub fn derive_master_secret(&mut self) -> Result<SlotId, CryptoError> {
        let derived = Route::new(
            SecretKind::DerivedSecret,
            Phase::Application,
            &[SecretKind::HandshakeSecret],
            Product::Secret,
        );
        let extract = Route::new(
            SecretKind::MasterSecret,
            Phase::Application,
            &[SecretKind::DerivedSecret],
            Product::Secret,
        );
        let digest = self.suite.digest();
        let slot = self.run(|e| {
            e.expand(&derived, Label::Derived, &digest.empty_hash(), digest.output_len())?;
            e.extract(&extract, None)
        })?;
        self.advance(SessionState::MasterSecretReady);
        Ok(slot)
    }

    /// Both traffic secrets of `phase`, then each side's record key and
    /// static IV. Application phase moves the session to
    /// `ApplicationKeysReady`; the handshake keys stay live until retired.
    pub fn derive_traffic_secrets(&mut self, phase: Phase, transcript_hash: &[u8]) -> Result<TrafficSlots, CryptoError> {
        let (parent, labels) = match phase {
            Phase::Handshake => (
                SecretKind::HandshakeSecret,
                [Label::ClientHandshakeTraffic, Label::ServerHandshakeTraffic],
            ),
            Phase::Application => (
                SecretKind::MasterSecret,
                [Label::ClientApplicationTraffic, Label::ServerApplicationTraffic],
            ),
        };
        let digest = self.suite.digest();
        let (key_len, iv_len) = (self.suite.key_len(), self.suite.iv_len());

        let slots = self.run(|e| {
            let mut out = Vec::with_capacity(4);
            for (side, label) in [Side::Client, Side::Server].into_iter().zip(labels) {
                let (secret, _) = router::traffic_nodes(side, phase);
                let route = Route::new(secret, phase, &[parent], Product::Secret);
                out.push(e.expand(&route, label, transcript_hash, digest.output_len())?);
            }
            for side in [Side::Client, Side::Server] {
                let (secret, key) = router::traffic_nodes(side, phase);
                let key_route = Route::new(key, phase, &[secret], Product::Key);
                out.push(e.expand(&key_route, Label::Key, &[], key_len)?);
                let iv_route = Route::new(key, phase, &[secret], Product::Iv);
                e.expand(&iv_route, Label::Iv, &[], iv_len)?;
            }
            Ok(TrafficSlots {
                client_secret: out[0],
                server_secret: out[1],
                client_key: out[2],
                server_key: out[3],
            })
        })?;
        self.traffic_phase = phase;
        if phase == Phase::Application {
            self.advance(SessionState::ApplicationKeysReady);
        }
        Ok(slots)
    }

    /// Finished key for `side`. In PSK mode before the handshake secret,
    /// the client finished key is the binder finished key.
    pub fn derive_finished_key(&mut self, side: Side) -> Result<SlotId, CryptoError> {
        self.ensure_open()?;
        let route = router::route_expand(Label::Finished, side, &self.route_context())?;
        let digest = self.suite.digest();
        self.run(|e| e.expand(&route, Label::Finished, &[], digest.output_len()))
    }

    /// Exporter master secret from the master secret.
    pub fn export_master_secret(&mut self, transcript_hash: &[u8]) -> Result<SlotId, CryptoError> {
        self.master_child(SecretKind::ExporterMasterSecret, Label::ExporterMaster, transcript_hash)
    }

    /// Resumption master secret from the master secret. The handshake is
    /// over at this point, so any handshake key still live is retired.
    pub fn derive_resumption_master_secret(&mut self, transcript_hash: &[u8]) -> Result<SlotId, CryptoError> {
        let slot = self.master_child(SecretKind::ResumptionMasterSecret, Label::ResumptionMaster, transcript_hash)?;
        self.run(|e| {
            e.retire_handshake_key(Side::Client)?;
            e.retire_handshake_key(Side::Server)
        })?;
        Ok(slot)
    }

    /// Free `side`'s handshake traffic key once that direction has moved
    /// to application keys. Returns whether a key was live.
    ///
    /// A server typically retires its own key after sending Finished and
    /// the client's after verifying the client Finished.
    pub fn retire_handshake_key(&mut self, side: Side) -> Result<bool, CryptoError> {
        self.run(|e| e.retire_handshake_key(side))
    }

    fn master_child(&mut self, kind: SecretKind, label: Label, hash: &[u8]) -> Result<SlotId, CryptoError> {
        let route = Route::new(kind, Phase::Application, &[SecretKind::MasterSecret], Product::Secret);
        let digest = self.suite.digest();
        self.run(|e| e.expand(&route, label, hash, digest.output_len()))
    }

    /// `"traffic upd"`: next-generation application traffic secret for
    /// `side` in a fresh slot, then its key and IV. The previous secret and
    /// key are released.
    pub fn update_traffic_secret(&mut self, side: Side) -> Result<SlotId, CryptoError> {
        self.expect_state(SessionState::ApplicationKeysReady)?;
        let route = router::route_expand(Label::TrafficUpdate, side, &self.route_context())?;
        let (secret, key) = router::traffic_nodes(side, Phase::Application);
        let digest = self.suite.digest();
        let (key_len, iv_len) = (self.suite.key_len(), self.suite.iv_len());
        self.run(|e| {
            let slot = e.expand(&route, Label::TrafficUpdate, &[], digest.output_len())?;
            let key_route = Route::new(key, Phase::Application, &[secret], Product::Key);
            e.expand(&key_route, Label::Key, &[], key_len)?;
            let iv_route = Route::new(key, Phase::Application, &[secret], Product::Iv);
            e.expand(&iv_route, Label::Iv, &[], iv_len)?;
            Ok(slot)
        })
    }

    // -----------------------------------------------------------------------
    // Generic entry points
    // -----------------------------------------------------------------------

    /// HKDF-Extract as a TLS stack asks for it.
    pub fn hkdf_extract(&mut self, input: ExtractInput) -> Result<SlotId, CryptoError> {
        self.ensure_open()?;
        let route = router::route_extract(input, &self.route_context())?;
        let psk = match input.ikm {
            Ikm::Psk => self.psk.map(|(key, _)| key),
            _ => None,
        };
        let slot = self.run(|e| e.extract(&route, psk))?;
        match route.child {
            SecretKind::EarlySecret | SecretKind::HsEarlySecret => self.advance(SessionState::EarlySecretReady),
            SecretKind::HandshakeSecret => self.advance(SessionState::HandshakeSecretReady),
            SecretKind::MasterSecret => self.advance(SessionState::MasterSecretReady),
            _ => {}
        }
        Ok(slot)
    }

    /// HKDF-Expand-Label as a TLS stack asks for it. `label` may carry the
    /// `"tls13 "` prefix. Returns the slot written (the key's slot for `"iv"`).
    pub fn hkdf_expand(&mut self, label: &[u8], side: Side, context: &[u8], len: usize) -> Result<SlotId, CryptoError> {
        self.ensure_open()?;
        let label = Label::parse(label)?;
        let route = router::route_expand(label, side, &self.route_context())?;
        let expected = match route.product {
            Product::Key => self.suite.key_len(),
            Product::Iv => self.suite.iv_len(),
            _ => self.suite.digest().output_len(),
        };
        if len != expected {
            return Err(CryptoError::Unsupported("output length does not match the suite"));
        }
        let slot = self.run(|e| e.expand(&route, label, context, len))?;

        use SecretKind::*;
        match route.child {
            ClientHandshakeTrafficSecret | ServerHandshakeTrafficSecret => self.traffic_phase = Phase::Handshake,
            ClientApplicationTrafficSecret | ServerApplicationTrafficSecret => {
                self.traffic_phase = Phase::Application
            }
            ClientApplicationKey | ServerApplicationKey if self.application_keys_complete() => {
                self.advance(SessionState::ApplicationKeysReady)
            }
            _ => {}
        }
        Ok(slot)
    }

    /// Both application keys exist and both traffic secrets have produced
    /// their key and IV.
    fn application_keys_complete(&self) -> bool {
        use SecretKind::*;
        self.chain.slot_of(ClientApplicationKey, Side::Client).is_some()
            && self.chain.slot_of(ServerApplicationKey, Side::Server).is_some()
            && self.chain.remaining(ClientApplicationTrafficSecret, Side::Client) == 0
            && self.chain.remaining(ServerApplicationTrafficSecret, Side::Server) == 0
    }

    // -----------------------------------------------------------------------
    // Records and finished MACs
    // -----------------------------------------------------------------------

    /// Protect a record with this endpoint's write key: the handshake key
    /// while it is live, the application key after it has been retired.
    pub fn seal_record(&mut self, nonce: RecordNonce, aad: &[u8], plaintext: &[u8]) -> Result<SealedRecord, CipherError> {
        let slot = self.traffic_key(self.side)?;
        let result = self
            .vault
            .record_cipher()
            .encrypt(slot, self.suite.algorithm(), &nonce, aad, plaintext, self.suite.tag_len());
        self.close_on_cipher_fault(result)
    }

    /// Open a record protected with the peer's write key, chosen the same
    /// way as in [`Session::seal_record`].
    pub fn open_record(
        &mut self,
        nonce: RecordNonce,
        aad: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let slot = self.traffic_key(self.side.peer())?;
        let result = self
            .vault
            .record_cipher()
            .decrypt(slot, self.suite.algorithm(), &nonce, aad, ciphertext, tag);
        self.close_on_cipher_fault(result)
    }

    fn traffic_key(&self, side: Side) -> Result<SlotId, CipherError> {
        if self.state == SessionState::Closed {
            return Err(CipherError::SessionClosed);
        }
        [Phase::Handshake, Phase::Application]
            .into_iter()
            .find_map(|phase| {
                let (_, key) = router::traffic_nodes(side, phase);
                self.chain.slot_of(key, side)
            })
            .ok_or(CipherError::NoTrafficKey(side))
    }

    fn close_on_cipher_fault<T>(&mut self, result: Result<T, CipherError>) -> Result<T, CipherError> {
        if let Err(err @ (CipherError::DeviceRejected(_) | CipherError::Transport(_))) = &result {
            warn!(target: "tlsvault::session", session = %self.id, %err, "record hardware failure, closing session");
            self.close();
        }
        result
    }

    /// Start the Finished MAC for `side`. The finished key is consumed when
    /// the MAC is finished or verified.
    pub fn finished_mac(&mut self, side: Side) -> Result<FinishedMac<'_>, MacError> {
        if self.state == SessionState::Closed {
            return Err(MacError::SessionClosed);
        }
        let kind = match side {
            Side::Client => SecretKind::ClientFinishedKey,
            Side::Server => SecretKind::ServerFinishedKey,
            Side::Neutral => return Err(MacError::NoFinishedKey(side)),
        };
        let slot = self
            .chain
            .acquire(kind, side)
            .map_err(|_| MacError::NoFinishedKey(side))?;
        match self.vault.record_cipher().compute_finished_mac(slot, self.suite.digest()) {
            Ok(mac) => Ok(FinishedMac {
                session: self,
                kind,
                side,
                mac: Some(mac),
            }),
            Err(err) => {
                self.chain.release(kind, side);
                self.close_on_mac_fault(Err(err))
            }
        }
    }

    fn close_on_mac_fault<T>(&mut self, result: Result<T, MacError>) -> Result<T, MacError> {
        if let Err(err @ (MacError::DeviceRejected(_) | MacError::Transport(_))) = &result {
            warn!(target: "tlsvault::session", session = %self.id, %err, "MAC hardware failure, closing session");
            self.close();
        }
        result
    }

    // -----------------------------------------------------------------------
    // Signatures
    // -----------------------------------------------------------------------

    /// CertificateVerify signature over `transcript_hash` with the
    /// provisioned P-256 key `key`. Returns the DER encoding TLS carries.
    pub fn sign_handshake(&mut self, key: ProvisionedKey, transcript_hash: &[u8]) -> Result<Vec<u8>, CryptoError> {
        check_hash_len(transcript_hash)?;
        self.run(|e| {
            let raw = e.sign(key, transcript_hash)?;
            let signature = Signature::from_slice(&raw).map_err(|_| DeviceError::Malformed)?;
            Ok(signature.to_der().as_bytes().to_vec())
        })
    }

    /// Check the peer's DER-encoded P-256 signature over `hash` on the
    /// device. `public_key` is the uncompressed SEC1 point from the peer
    /// certificate. A signature that does not verify leaves the session
    /// open.
    pub fn verify_peer_signature(
        &mut self,
        public_key: &[u8],
        hash: &[u8],
        der_signature: &[u8],
    ) -> Result<(), CryptoError> {
        self.ensure_open()?;
        check_hash_len(hash)?;
        let signature = Signature::from_der(der_signature).map_err(|_| CryptoError::SignatureInvalid)?;
        let raw = signature.to_bytes();
        self.run(|e| e.verify(public_key, hash, &raw))
    }

    // -----------------------------------------------------------------------
    // TLS 1.2
    // -----------------------------------------------------------------------

    /// Master secret from the premaster secret in `premaster`, then the
    /// write keys. Returns the fixed IVs; the keys stay on the device.
    pub fn derive_tls12_keys(
        &mut self,
        premaster: SlotId,
        client_random: &[u8; 32],
        server_random: &[u8; 32],
    ) -> Result<Tls12Ivs, CryptoError> {
        if self.suite.protocol() != Protocol::Tls12 {
            return Err(CryptoError::Unsupported("suite is not TLS 1.2"));
        }
        self.expect_state(SessionState::Idle)?;
        let master_seed = [&client_random[..], &server_random[..]].concat();
        let block_seed = [&server_random[..], &client_random[..]].concat();
        let suite = self.suite;
        let (client, server) = self.run(|e| {
            e.adopt(SecretKind::SharedSecret, premaster)?;
            e.tls12_master(master_seed)?;
            e.tls12_key_block(suite, block_seed)
        })?;
        self.advance(SessionState::MasterSecretReady);
        self.advance(SessionState::ApplicationKeysReady);
        self.traffic_phase = Phase::Application;
        let ivs = Tls12Ivs { client, server };
        self.tls12_ivs = Some(ivs.clone());
        Ok(ivs)
    }

    /// 12-byte Finished verify data for `side`. The master secret is
    /// released once both sides' verify data has been produced.
    pub fn tls12_verify_data(&mut self, side: Side, handshake_hash: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.run(|e| e.tls12_verify_data(side, handshake_hash))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Release every slot this session holds and move to `Closed`.
    /// Idempotent; returns how many slots this call released.
    pub fn close(&mut self) -> usize {
        if self.state == SessionState::Closed {
            return 0;
        }
        let mut shared = self.vault.lock();
        let mut slots = self.chain.drain();
        slots.extend(shared.pool.allocated_to(self.id));
        slots.sort();
        slots.dedup();

        if shared.mac_owner.is_some_and(|s| slots.contains(&s)) {
            shared.mac_owner = None;
        }
        let mut released = 0;
        for slot in slots {
            if let Ok(true) = shared.pool.free(slot) {
                shared.audit_event(self.id, AuditEvent::Released { slot });
                released += 1;
            }
        }
        shared.audit_event(self.id, AuditEvent::Closed { released });
        drop(shared);

        self.state = SessionState::Closed;
        self.history.push(SessionState::Closed);
        info!(target: "tlsvault::session", session = %self.id, released, "session closed");
        released
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn run<T>(&mut self, f: impl FnOnce(&mut Engine<'_>) -> Result<T, CryptoError>) -> Result<T, CryptoError> {
        self.ensure_open()?;
        let result = {
            let mut shared = self.vault.lock();
            let mut engine = Engine::new(&mut shared, &mut self.chain, self.id, self.suite.digest());
            f(&mut engine)
        };
        if let Err(err) = &result {
            if err.is_hardware() {
                warn!(
                    target: "tlsvault::session",
                    session = %self.id,
                    state = ?self.state,
                    %err,
                    "hardware failure, closing session"
                );
                self.close();
            }
        }
        result
    }

    fn ensure_open(&self) -> Result<(), CryptoError> {
        if self.state == SessionState::Closed {
            return Err(CryptoError::SessionClosed);
        }
        Ok(())
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), CryptoError> {
        self.ensure_open()?;
        if self.state != expected {
            return Err(CryptoError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn advance(&mut self, to: SessionState) {
        if to > self.state && self.state != SessionState::Closed {
            debug!(target: "tlsvault::session", session = %self.id, from = ?self.state, ?to, "state");
            self.state = to;
            self.history.push(to);
        }
    }
}

/// TLS transcript hashes are SHA-256 or SHA-384.
fn check_hash_len(hash: &[u8]) -> Result<(), CryptoError> {
    match hash.len() {
        32 | 48 => Ok(()),
        _ => Err(CryptoError::Unsupported("hash must be 32 or 48 bytes")),
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("suite", &self.suite)
            .field("state", &self.state)
            .field("traffic_phase", &self.traffic_phase)
            .field("psk", &self.psk)
            .finish()
    }
}

/// A Finished MAC in progress.
///
/// Borrows the session so the finished key cannot be released under it.
pub struct FinishedMac<'s> {
    session: &'s mut Session,
    kind: SecretKind,
    side: Side,
    mac: Option<MacSession>,
}

impl FinishedMac<'_> {
    /// Feed transcript bytes. A hardware fault ends the MAC and closes the
    /// session.
    pub fn update(&mut self, data: &[u8]) -> Result<(), MacError> {
        let mac = self.mac.as_mut().ok_or(MacError::SessionClosed)?;
        let result = mac.update(data);
        if result.is_err() {
            if let Some(mac) = self.mac.take() {
                drop(mac);
                self.session.chain.release(self.kind, self.side);
            }
        }
        self.session.close_on_mac_fault(result)
    }

    /// Finish and return the MAC.
    pub fn finish(mut self) -> Result<Vec<u8>, MacError> {
        let mac = self.mac.take().ok_or(MacError::SessionClosed)?;
        let result = mac.finish();
        self.consume();
        self.session.close_on_mac_fault(result)
    }

    /// Have the device compare the MAC with `expected`. A mismatch is
    /// reported as [`MacError::Mismatch`] and leaves the session open.
    pub fn verify(mut self, expected: &[u8]) -> Result<(), MacError> {
        let mac = self.mac.take().ok_or(MacError::SessionClosed)?;
        let result = mac.verify(expected);
        self.consume();
        self.session.close_on_mac_fault(result)
    }

    fn consume(&mut self) {
        let session = &mut *self.session;
        session.chain.release(self.kind, self.side);
        if let Ok(slot) = session.chain.retire(self.kind, self.side) {
            session.vault.lock().release(session.id, slot);
        }
    }
}

impl Drop for FinishedMac<'_> {
    fn drop(&mut self) {
        if let Some(mac) = self.mac.take() {
            drop(mac);
            self.session.chain.release(self.kind, self.side);
        }
    }
}
