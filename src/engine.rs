//! One derivation step at a time.
//!
//! The engine binds a session's [`SecretChain`] to the shared pool and
//! device for the duration of one call. Every step follows the same order:
//!
//! 1. resolve parent slots from the chain (`MissingParent` if absent)
//! 2. allocate the destination slot, if the product needs one
//! 3. issue the device command; on failure give the fresh slot back
//! 4. record the child, freeing any displaced generation
//! 5. strike the child from each parent's owed list and free parents that
//!    are fully resolved
//!
//! Freeing is driven by the chain's owed lists and holds. The only nodes a
//! caller retires by name are handshake keys and consumed finished keys.

use tracing::{debug, warn};

use crate::audit::AuditEvent;
use crate::chain::{Phase, Product, Production, SecretChain, SecretKind, Side};
use crate::command::{Command, ExpandTarget};
use crate::device::StatusKind;
use crate::error::{CryptoError, DeviceError};
use crate::router::{Label, Route};
use crate::session::ProvisionedKey;
use crate::slot::{SessionId, SlotId};
use crate::suite::{CipherSuite, Digest, NamedGroup};
use crate::Shared;

/// Plain `r || s` length for P-256.
const SIGNATURE_LEN: usize = 64;

/// What a step left behind.
pub(crate) struct StepOutput {
    /// Slot the step wrote into, if any.
    pub slot: Option<SlotId>,
    /// Response payload from the device.
    pub response: Vec<u8>,
}

/// A session's chain bound to the locked device for one call.
pub(crate) struct Engine<'a> {
    shared: &'a mut Shared,
    chain: &'a mut SecretChain,
    session: SessionId,
    digest: Digest,
}

impl<'a> Engine<'a> {
    pub(crate) fn new(
        shared: &'a mut Shared,
        chain: &'a mut SecretChain,
        session: SessionId,
        digest: Digest,
    ) -> Self {
        Self {
            shared,
            chain,
            session,
            digest,
        }
    }

    /// HKDF-Extract. The salt is the route's `DerivedSecret` parent (zeros
    /// if none); the IKM is its `SharedSecret` parent, the provisioned PSK,
    /// or zeros.
    pub(crate) fn extract(&mut self, route: &Route, psk: Option<ProvisionedKey>) -> Result<SlotId, CryptoError> {
        let parents = self.resolve(route)?;
        let pick = |kind: SecretKind| {
            route
                .parents
                .iter()
                .position(|&(k, _)| k == kind)
                .map(|i| parents[i].object_id())
        };
        let salt = pick(SecretKind::DerivedSecret);
        let ikm = pick(SecretKind::SharedSecret).or(psk.map(ProvisionedKey::object_id));
        let digest = self.digest;
        let out = self.step(route, &parents, |dest| Command::ExtractSecret {
            digest,
            salt,
            ikm,
            dest: dest.map_or(0, SlotId::object_id),
        })?;
        out.slot.ok_or(CryptoError::Unsupported("extract without destination"))
    }

    /// HKDF-Expand-Label of the route's single parent.
    pub(crate) fn expand(
        &mut self,
        route: &Route,
        label: Label,
        context: &[u8],
        len: usize,
    ) -> Result<SlotId, CryptoError> {
        let target = match route.product {
            Product::Secret => ExpandTarget::Secret,
            Product::Key => ExpandTarget::Key,
            Product::Iv => ExpandTarget::Iv,
            Product::HmacKey => ExpandTarget::HmacKey,
            Product::Bytes => return Err(CryptoError::Unsupported("expand to host bytes")),
        };
        let parents = self.resolve(route)?;
        let source = parents
            .first()
            .copied()
            .ok_or(CryptoError::Unsupported("expand without parent"))?;
        let digest = self.digest;
        let out = self.step(route, &parents, |dest| Command::ExpandSecret {
            digest,
            source: source.object_id(),
            dest: dest.map_or(0, SlotId::object_id),
            target,
            label: label.as_bytes().to_vec(),
            context: context.to_vec(),
            len: len as u16,
        })?;
        out.slot.ok_or(CryptoError::Unsupported("expand without destination"))
    }

    /// Generate an ephemeral key in a fresh slot and return its public share.
    pub(crate) fn key_share(&mut self, group: NamedGroup) -> Result<Vec<u8>, CryptoError> {
        let route = Route::new(SecretKind::EphemeralKey, Phase::Handshake, &[], Product::Secret);
        let out = self.step(&route, &[], |dest| Command::GenerateKeyShare {
            group,
            dest: dest.map_or(0, SlotId::object_id),
        })?;
        if out.response.len() != group.share_len() {
            return Err(DeviceError::Malformed.into());
        }
        Ok(out.response)
    }

    /// ECDH against the peer's share; the ephemeral key is released.
    pub(crate) fn shared_secret(&mut self, group: NamedGroup, peer: &[u8]) -> Result<SlotId, CryptoError> {
        let route = Route::new(
            SecretKind::SharedSecret,
            Phase::Handshake,
            &[SecretKind::EphemeralKey],
            Product::Secret,
        );
        let parents = self.resolve(&route)?;
        let private = parents[0].object_id();
        let out = self.step(&route, &parents, |dest| Command::CreateSharedSecret {
            group,
            private,
            dest: dest.map_or(0, SlotId::object_id),
            peer: peer.to_vec(),
        })?;
        out.slot.ok_or(CryptoError::Unsupported("shared secret without destination"))
    }

    /// Record a caller-supplied slot as `kind`. The slot must belong to
    /// this session and not already back another node.
    pub(crate) fn adopt(&mut self, kind: SecretKind, slot: SlotId) -> Result<(), CryptoError> {
        if self.chain.slot_of(kind, Side::Neutral) == Some(slot) {
            return Ok(());
        }
        if self.shared.pool.owner_of(slot) != Some(self.session) || self.chain.holds_slot(slot) {
            warn!(target: "tlsvault::engine", session = %self.session, %slot, "foreign slot");
            return Err(CryptoError::ForeignSlot(slot.object_id()));
        }
        let displaced = self
            .chain
            .record_derivation(kind, Side::Neutral, Phase::Handshake, None, slot)?;
        if let Some(old) = displaced {
            self.shared.release(self.session, old);
        }
        debug!(target: "tlsvault::engine", session = %self.session, ?kind, %slot, "adopted");
        Ok(())
    }

    /// TLS 1.2 master secret from the premaster secret.
    pub(crate) fn tls12_master(&mut self, seed: Vec<u8>) -> Result<SlotId, CryptoError> {
        let route = Route::new(
            SecretKind::MasterSecret,
            Phase::Handshake,
            &[SecretKind::SharedSecret],
            Product::Secret,
        );
        let parents = self.resolve(&route)?;
        let premaster = parents[0].object_id();
        let digest = self.digest;
        let out = self.step(&route, &parents, |dest| Command::Tls12MasterSecret {
            digest,
            premaster,
            dest: dest.map_or(0, SlotId::object_id),
            seed,
        })?;
        out.slot.ok_or(CryptoError::Unsupported("master secret without destination"))
    }

    /// TLS 1.2 key expansion: both write keys into fresh slots; returns the
    /// client and server fixed IVs.
    pub(crate) fn tls12_key_block(
        &mut self,
        suite: CipherSuite,
        seed: Vec<u8>,
    ) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let master_node = (SecretKind::MasterSecret, Side::Neutral);
        let master = self
            .chain
            .slot_of(master_node.0, master_node.1)
            .ok_or(CryptoError::MissingParent {
                kind: master_node.0,
                side: master_node.1,
            })?;
        let client_kind = SecretKind::ClientApplicationKey;
        let server_kind = SecretKind::ServerApplicationKey;
        self.chain.check_vacant(client_kind, Side::Client)?;
        self.chain.check_vacant(server_kind, Side::Server)?;

        let client = self.allocate()?;
        let server = match self.allocate() {
            Ok(slot) => slot,
            Err(err) => {
                self.shared.release(self.session, client);
                return Err(err);
            }
        };
        let command = Command::Tls12KeyBlock {
            digest: self.digest,
            master: master.object_id(),
            client_dest: client.object_id(),
            server_dest: server.object_id(),
            mac_key_len: suite.mac_key_len() as u8,
            key_len: suite.key_len() as u8,
            iv_len: suite.iv_len() as u8,
            seed,
        };
        let response = match self.send(&command, SecretKind::ClientApplicationKey) {
            Ok(r) if r.len() == 2 * suite.iv_len() => r,
            other => {
                self.shared.release(self.session, client);
                self.shared.release(self.session, server);
                return Err(match other {
                    Err(err) => err,
                    Ok(_) => DeviceError::Malformed.into(),
                });
            }
        };

        for (kind, side, slot) in [
            (client_kind, Side::Client, client),
            (server_kind, Side::Server, server),
        ] {
            self.record(kind, side, Phase::Application, Some(master), slot)?;
            self.resolve_parent(master_node, Production::new(kind, Product::Key))?;
        }
        let (client_iv, server_iv) = response.split_at(suite.iv_len());
        Ok((client_iv.to_vec(), server_iv.to_vec()))
    }

    /// TLS 1.2 Finished verify data for one side.
    pub(crate) fn tls12_verify_data(&mut self, side: Side, hash: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (kind, label): (SecretKind, &[u8]) = match side {
            Side::Client => (SecretKind::ClientFinishedKey, b"client finished"),
            Side::Server => (SecretKind::ServerFinishedKey, b"server finished"),
            Side::Neutral => return Err(CryptoError::Unsupported("verify data for neutral side")),
        };
        let route = Route::new(kind, Phase::Handshake, &[SecretKind::MasterSecret], Product::Bytes);
        let parents = self.resolve(&route)?;
        let master = parents[0].object_id();
        let digest = self.digest;
        let out = self.step(&route, &parents, |_| Command::Tls12VerifyData {
            digest,
            master,
            label: label.to_vec(),
            hash: hash.to_vec(),
        })?;
        Ok(out.response)
    }

    /// Retire a node (the chain refuses if dependents remain) and free its slot.
    pub(crate) fn consume(&mut self, kind: SecretKind, side: Side) -> Result<(), CryptoError> {
        let slot = self.chain.retire(kind, side)?;
        self.shared.release(self.session, slot);
        Ok(())
    }

    /// Free `side`'s handshake traffic key. Returns whether one was live.
    pub(crate) fn retire_handshake_key(&mut self, side: Side) -> Result<bool, CryptoError> {
        let kind = match side {
            Side::Client => SecretKind::ClientHandshakeKey,
            Side::Server => SecretKind::ServerHandshakeKey,
            Side::Neutral => return Err(CryptoError::Unsupported("handshake key for neutral side")),
        };
        if self.chain.slot_of(kind, side).is_none() {
            return Ok(false);
        }
        self.consume(kind, side)?;
        debug!(target: "tlsvault::engine", session = %self.session, ?side, "handshake key retired");
        Ok(true)
    }

    /// ECDSA over `hash` with a provisioned signing key. Returns the plain
    /// `r || s` the device produces.
    pub(crate) fn sign(&mut self, key: ProvisionedKey, hash: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let command = Command::Sign {
            key: key.object_id(),
            hash: hash.to_vec(),
        };
        let raw = self
            .shared
            .send(&command)
            .map_err(|err| self.device_fault(err, "sign"))?;
        if raw.len() != SIGNATURE_LEN {
            return Err(DeviceError::Malformed.into());
        }
        Ok(raw)
    }

    /// Have the device check a plain `r || s` signature over `hash`. A
    /// signature that does not verify is `SignatureInvalid`, not a fault.
    pub(crate) fn verify(&mut self, public_key: &[u8], hash: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let command = Command::Verify {
            public_key: public_key.to_vec(),
            hash: hash.to_vec(),
            signature: signature.to_vec(),
        };
        match self.shared.send(&command) {
            Ok(_) => Ok(()),
            Err(DeviceError::Rejected(status)) if status.kind() == StatusKind::CryptoFailure => {
                Err(CryptoError::SignatureInvalid)
            }
            Err(err) => Err(self.device_fault(err, "verify")),
        }
    }

    // -----------------------------------------------------------------------
    // Step machinery
    // -----------------------------------------------------------------------

    fn resolve(&self, route: &Route) -> Result<Vec<SlotId>, CryptoError> {
        route
            .parents
            .iter()
            .map(|&(kind, side)| {
                self.chain
                    .slot_of(kind, side)
                    .ok_or(CryptoError::MissingParent { kind, side })
            })
            .collect()
    }

    fn step(
        &mut self,
        route: &Route,
        parents: &[SlotId],
        build: impl FnOnce(Option<SlotId>) -> Command,
    ) -> Result<StepOutput, CryptoError> {
        // The IV lands in the key's own slot.
        let existing = match route.product {
            Product::Iv => Some(self.chain.slot_of(route.child, route.side).ok_or(
                CryptoError::MissingParent {
                    kind: route.child,
                    side: route.side,
                },
            )?),
            _ => None,
        };
        let fresh = if route.product.needs_slot() {
            self.chain.check_vacant(route.child, route.side)?;
            Some(self.allocate()?)
        } else {
            None
        };
        let dest = fresh.or(existing);

        let command = build(dest);
        let response = match self.send(&command, route.child) {
            Ok(r) => r,
            Err(err) => {
                if let Some(slot) = fresh {
                    self.shared.release(self.session, slot);
                }
                return Err(err);
            }
        };

        if let Some(slot) = fresh {
            self.record(route.child, route.side, route.phase, parents.first().copied(), slot)?;
        }
        let production = Production::new(route.child, route.product);
        for &parent in &route.parents {
            if parent != (route.child, route.side) {
                self.resolve_parent(parent, production)?;
            }
        }
        debug!(
            target: "tlsvault::engine",
            session = %self.session,
            child = ?route.child,
            side = ?route.side,
            product = ?route.product,
            parents = ?parents,
            dest = ?dest,
            "derived"
        );
        Ok(StepOutput {
            slot: dest,
            response,
        })
    }

    fn allocate(&mut self) -> Result<SlotId, CryptoError> {
        self.shared.pool.allocate(self.session).map_err(|err| {
            warn!(target: "tlsvault::engine", session = %self.session, %err, "allocation failed");
            CryptoError::from(err)
        })
    }

    fn send(&mut self, command: &Command, child: SecretKind) -> Result<Vec<u8>, CryptoError> {
        self.shared.send(command).map_err(|err| {
            warn!(target: "tlsvault::engine", session = %self.session, ?child, %err, "device command failed");
            self.audit_rejection(&err);
            CryptoError::from(err)
        })
    }

    fn device_fault(&mut self, err: DeviceError, operation: &'static str) -> CryptoError {
        warn!(target: "tlsvault::engine", session = %self.session, operation, %err, "device command failed");
        self.audit_rejection(&err);
        CryptoError::from(err)
    }

    fn audit_rejection(&mut self, err: &DeviceError) {
        if let DeviceError::Rejected(status) = err {
            self.shared
                .audit_event(self.session, AuditEvent::Rejected { status: *status });
        }
    }

    fn record(
        &mut self,
        kind: SecretKind,
        side: Side,
        phase: Phase,
        parent: Option<SlotId>,
        slot: SlotId,
    ) -> Result<(), CryptoError> {
        match self.chain.record_derivation(kind, side, phase, parent, slot) {
            Ok(displaced) => {
                if let Some(old) = displaced {
                    self.shared.release(self.session, old);
                }
                self.shared
                    .audit_event(self.session, AuditEvent::Derived { kind, side, slot });
                Ok(())
            }
            Err(err) => {
                self.shared.release(self.session, slot);
                Err(err.into())
            }
        }
    }

    fn resolve_parent(&mut self, (kind, side): (SecretKind, Side), production: Production) -> Result<(), CryptoError> {
        if self.chain.note_produced(kind, side, production) {
            self.consume(kind, side)?;
        }
        Ok(())
    }
}
