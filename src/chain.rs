//! The key-schedule graph and its slot bookkeeping.
//!
//! Every secret the device holds on a session's behalf is a node of this
//! graph, keyed by `(SecretKind, Side)`. A node records the slot that holds
//! the secret and which of its declared children are still owed. When the
//! last owed child has been produced and nothing holds the node open, the
//! node can be retired and its slot returned to the pool.
//!
//! ```text
//!  0 ─► Early ──"derived"──► Derived(H) ──┐
//!                                          ├─► Handshake ─┬─ "c hs traffic" ─► CHTS ─┬─ key / iv ─► CHK
//!       Ephemeral ─► Shared ──────────────┘               ├─ "s hs traffic" ─► SHTS  └─ finished ─► CFK
//!                                                         └─ "derived" ─► Derived(A) ─► Master ─┬─ c/s ap traffic
//!                                                                                                ├─ exp master
//!                                                                                                └─ res master
//! ```
//!
//! The chain never talks to the pool itself. `retire` validates and clears
//! a node and hands back the slot; the caller frees it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ChainError;
use crate::slot::SlotId;
use crate::suite::Protocol;

/// Which endpoint's secret a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Client,
    Server,
    Neutral,
}

impl Side {
    /// The other endpoint. `Neutral` maps to itself.
    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
            Self::Neutral => Self::Neutral,
        }
    }
}

/// Handshake or application traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Handshake,
    Application,
}

/// Secrets of the TLS 1.3 schedule, plus the two ECDHE intermediates the
/// device also keeps in slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecretKind {
    EarlySecret,
    HsEarlySecret,
    HandshakeSecret,
    MasterSecret,
    DerivedSecret,
    BinderKey,
    ClientHandshakeTrafficSecret,
    ServerHandshakeTrafficSecret,
    ClientApplicationTrafficSecret,
    ServerApplicationTrafficSecret,
    ClientHandshakeKey,
    ServerHandshakeKey,
    ClientApplicationKey,
    ServerApplicationKey,
    ClientFinishedKey,
    ServerFinishedKey,
    ExporterMasterSecret,
    ResumptionMasterSecret,
    /// Ephemeral ECDHE private key.
    EphemeralKey,
    /// ECDHE output, or the TLS 1.2 premaster secret.
    SharedSecret,
}

use SecretKind::*;

impl SecretKind {
    /// The endpoint this kind belongs to.
    pub fn side(self) -> Side {
        match self {
            ClientHandshakeTrafficSecret
            | ClientApplicationTrafficSecret
            | ClientHandshakeKey
            | ClientApplicationKey
            | ClientFinishedKey => Side::Client,
            ServerHandshakeTrafficSecret
            | ServerApplicationTrafficSecret
            | ServerHandshakeKey
            | ServerApplicationKey
            | ServerFinishedKey => Side::Server,
            _ => Side::Neutral,
        }
    }

    /// Kinds this one may be derived from in the TLS 1.3 schedule.
    ///
    /// A handshake-phase `DerivedSecret` comes from `HsEarlySecret` instead
    /// of `EarlySecret` when a PSK is in use, and the client finished key
    /// doubles as the binder finished key in PSK mode. Application traffic
    /// secrets list themselves: `"traffic upd"` derives a secret from its
    /// predecessor generation.
    pub fn predecessors(self, psk: bool) -> &'static [SecretKind] {
        match self {
            EarlySecret | HsEarlySecret | EphemeralKey => &[],
            SharedSecret => &[EphemeralKey],
            DerivedSecret if psk => &[HsEarlySecret, HandshakeSecret],
            DerivedSecret => &[EarlySecret, HandshakeSecret],
            BinderKey => &[HsEarlySecret],
            HandshakeSecret => &[DerivedSecret, SharedSecret],
            MasterSecret => &[DerivedSecret],
            ClientHandshakeTrafficSecret | ServerHandshakeTrafficSecret => &[HandshakeSecret],
            ClientApplicationTrafficSecret => &[MasterSecret, ClientApplicationTrafficSecret],
            ServerApplicationTrafficSecret => &[MasterSecret, ServerApplicationTrafficSecret],
            ExporterMasterSecret | ResumptionMasterSecret => &[MasterSecret],
            ClientHandshakeKey => &[ClientHandshakeTrafficSecret],
            ServerHandshakeKey => &[ServerHandshakeTrafficSecret],
            ClientApplicationKey => &[ClientApplicationTrafficSecret],
            ServerApplicationKey => &[ServerApplicationTrafficSecret],
            ClientFinishedKey if psk => &[BinderKey, ClientHandshakeTrafficSecret],
            ClientFinishedKey => &[ClientHandshakeTrafficSecret],
            ServerFinishedKey => &[ServerHandshakeTrafficSecret],
        }
    }

    pub(crate) fn retention(self) -> Retention {
        match self {
            ClientApplicationTrafficSecret
            | ServerApplicationTrafficSecret
            | ClientApplicationKey
            | ServerApplicationKey
            | ExporterMasterSecret
            | ResumptionMasterSecret => Retention::Session,
            ClientFinishedKey | ServerFinishedKey => Retention::Consumed,
            ClientHandshakeKey | ServerHandshakeKey => Retention::Explicit,
            _ => Retention::Children,
        }
    }

    /// Children this node owes before its slot may be released.
    fn declared_children(self, phase: Phase, protocol: Protocol) -> Vec<Production> {
        let p = Production::new;
        match (self, protocol) {
            (EarlySecret, _) => vec![p(DerivedSecret, Product::Secret)],
            (HsEarlySecret, _) => vec![p(BinderKey, Product::Secret), p(DerivedSecret, Product::Secret)],
            (BinderKey, _) => vec![p(ClientFinishedKey, Product::HmacKey)],
            (DerivedSecret, _) => match phase {
                Phase::Handshake => vec![p(HandshakeSecret, Product::Secret)],
                Phase::Application => vec![p(MasterSecret, Product::Secret)],
            },
            (EphemeralKey, _) => vec![p(SharedSecret, Product::Secret)],
            (SharedSecret, Protocol::Tls13) => vec![p(HandshakeSecret, Product::Secret)],
            (SharedSecret, Protocol::Tls12) => vec![p(MasterSecret, Product::Secret)],
            (HandshakeSecret, _) => vec![
                p(ClientHandshakeTrafficSecret, Product::Secret),
                p(ServerHandshakeTrafficSecret, Product::Secret),
                p(DerivedSecret, Product::Secret),
            ],
            (MasterSecret, Protocol::Tls13) => vec![
                p(ClientApplicationTrafficSecret, Product::Secret),
                p(ServerApplicationTrafficSecret, Product::Secret),
                p(ExporterMasterSecret, Product::Secret),
                p(ResumptionMasterSecret, Product::Secret),
            ],
            (MasterSecret, Protocol::Tls12) => vec![
                p(ClientApplicationKey, Product::Key),
                p(ServerApplicationKey, Product::Key),
                p(ClientFinishedKey, Product::Bytes),
                p(ServerFinishedKey, Product::Bytes),
            ],
            (ClientHandshakeTrafficSecret, _) => vec![
                p(ClientHandshakeKey, Product::Key),
                p(ClientHandshakeKey, Product::Iv),
                p(ClientFinishedKey, Product::HmacKey),
            ],
            (ServerHandshakeTrafficSecret, _) => vec![
                p(ServerHandshakeKey, Product::Key),
                p(ServerHandshakeKey, Product::Iv),
                p(ServerFinishedKey, Product::HmacKey),
            ],
            (ClientApplicationTrafficSecret, _) => vec![
                p(ClientApplicationKey, Product::Key),
                p(ClientApplicationKey, Product::Iv),
            ],
            (ServerApplicationTrafficSecret, _) => vec![
                p(ServerApplicationKey, Product::Key),
                p(ServerApplicationKey, Product::Iv),
            ],
            _ => Vec::new(),
        }
    }
}

/// What a derivation step writes on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Product {
    /// A secret in a fresh slot.
    Secret,
    /// A record key in a fresh slot.
    Key,
    /// The static IV, written into the existing key slot.
    Iv,
    /// An HMAC key in a fresh slot.
    HmacKey,
    /// Bytes returned to the host; no slot.
    Bytes,
}

impl Product {
    /// Whether the step writes into a freshly allocated slot.
    pub fn needs_slot(self) -> bool {
        matches!(self, Self::Secret | Self::Key | Self::HmacKey)
    }
}

/// One edge of the graph: a child kind together with what is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Production {
    /// Child node the edge leads to.
    pub kind: SecretKind,
    /// What the step writes for that child.
    pub product: Product,
}

impl Production {
    /// Edge to `kind` producing `product`.
    pub fn new(kind: SecretKind, product: Product) -> Self {
        Self { kind, product }
    }
}

/// When a node's slot is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retention {
    /// Once every declared child has been produced.
    Children,
    /// After one MAC operation completes.
    Consumed,
    /// When the session retires it. Handshake keys stay live after the
    /// application keys exist: the Finished records still need them.
    Explicit,
    /// At session close.
    Session,
}

#[derive(Debug, Clone)]
struct SecretNode {
    phase: Phase,
    slot: SlotId,
    parent: Option<SlotId>,
    owed: Vec<Production>,
    holds: u32,
}

/// Per-session view of the key schedule.
#[derive(Debug, Clone)]
pub struct SecretChain {
    protocol: Protocol,
    nodes: HashMap<(SecretKind, Side), SecretNode>,
}

impl SecretChain {
    /// An empty chain for a session running `protocol`.
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            nodes: HashMap::new(),
        }
    }

    /// Protocol whose schedule decides the owed children.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Register that `child` now lives in `child_slot`.
    ///
    /// If an earlier generation of the node is still recorded and may be
    /// displaced (a traffic update, a re-derived key), its slot is returned
    /// for the caller to free.
    pub fn record_derivation(
        &mut self,
        child: SecretKind,
        side: Side,
        phase: Phase,
        parent_slot: Option<SlotId>,
        child_slot: SlotId,
    ) -> Result<Option<SlotId>, ChainError> {
        self.check_vacant(child, side)?;
        let node = SecretNode {
            phase,
            slot: child_slot,
            parent: parent_slot,
            owed: child.declared_children(phase, self.protocol),
            holds: 0,
        };
        Ok(self.nodes.insert((child, side), node).map(|old| old.slot))
    }

    /// Fails with `Occupied` if recording `kind` would discard a node that
    /// still owes children or is held open.
    pub fn check_vacant(&self, kind: SecretKind, side: Side) -> Result<(), ChainError> {
        match self.nodes.get(&(kind, side)) {
            Some(node)
                if node.holds > 0
                    || (kind.retention() == Retention::Children && !node.owed.is_empty()) =>
            {
                Err(ChainError::Occupied { kind, side })
            }
            _ => Ok(()),
        }
    }

    /// Slot holding the node, if it is live.
    pub fn slot_of(&self, kind: SecretKind, side: Side) -> Option<SlotId> {
        self.nodes.get(&(kind, side)).map(|n| n.slot)
    }

    /// Phase the node was derived in.
    pub fn phase_of(&self, kind: SecretKind, side: Side) -> Option<Phase> {
        self.nodes.get(&(kind, side)).map(|n| n.phase)
    }

    /// The slot a node was derived from, if it had one.
    pub fn parent_of(&self, kind: SecretKind, side: Side) -> Option<SlotId> {
        self.nodes.get(&(kind, side)).and_then(|n| n.parent)
    }

    /// Number of declared children the node still owes.
    pub fn remaining(&self, kind: SecretKind, side: Side) -> usize {
        self.nodes.get(&(kind, side)).map_or(0, |n| n.owed.len())
    }

    /// Strike `production` from the parent's owed list. Returns true when
    /// the parent is now fully resolved and its slot should be released.
    pub fn note_produced(&mut self, parent: SecretKind, side: Side, production: Production) -> bool {
        let Some(node) = self.nodes.get_mut(&(parent, side)) else {
            return false;
        };
        if let Some(i) = node.owed.iter().position(|p| *p == production) {
            node.owed.remove(i);
        }
        parent.retention() == Retention::Children && node.owed.is_empty() && node.holds == 0
    }

    /// Clear a node and hand back its slot for the caller to free.
    ///
    /// Refuses while the node still owes children or is held by an open
    /// MAC; retiring it then would strand those dependents.
    pub fn retire(&mut self, kind: SecretKind, side: Side) -> Result<SlotId, ChainError> {
        let node = self
            .nodes
            .get(&(kind, side))
            .ok_or(ChainError::NotRecorded { kind, side })?;
        let remaining = node.owed.len() + node.holds as usize;
        if remaining > 0 {
            return Err(ChainError::UnresolvedDependents {
                kind,
                side,
                remaining,
            });
        }
        let slot = node.slot;
        self.nodes.remove(&(kind, side));
        Ok(slot)
    }

    /// Pin a node while a MAC operation references it.
    pub fn acquire(&mut self, kind: SecretKind, side: Side) -> Result<SlotId, ChainError> {
        let node = self
            .nodes
            .get_mut(&(kind, side))
            .ok_or(ChainError::NotRecorded { kind, side })?;
        node.holds += 1;
        Ok(node.slot)
    }

    /// Drop one hold taken by [`acquire`](Self::acquire).
    pub fn release(&mut self, kind: SecretKind, side: Side) {
        if let Some(node) = self.nodes.get_mut(&(kind, side)) {
            node.holds = node.holds.saturating_sub(1);
        }
    }

    /// Whether `slot` is held by any node.
    pub fn holds_slot(&self, slot: SlotId) -> bool {
        self.nodes.values().any(|n| n.slot == slot)
    }

    /// Live nodes, in no particular order.
    pub fn live(&self) -> impl Iterator<Item = (SecretKind, Side, SlotId)> + '_ {
        self.nodes.iter().map(|(&(k, s), n)| (k, s, n.slot))
    }

    /// True once no node holds a slot.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop every node unconditionally and return their slots. Used by
    /// session close only.
    pub(crate) fn drain(&mut self) -> Vec<SlotId> {
        let mut slots: Vec<SlotId> = self.nodes.drain().map(|(_, n)| n.slot).collect();
        slots.sort();
        slots.dedup();
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(n: u16) -> SlotId {
        SlotId::new(n)
    }

    #[test]
    fn test_record_and_lookup() {
        let mut chain = SecretChain::new(Protocol::Tls13);
        assert_eq!(chain.slot_of(EarlySecret, Side::Neutral), None);
        let displaced = chain
            .record_derivation(EarlySecret, Side::Neutral, Phase::Handshake, None, slot(3))
            .unwrap();
        assert_eq!(displaced, None);
        assert_eq!(chain.slot_of(EarlySecret, Side::Neutral), Some(slot(3)));
        assert_eq!(chain.remaining(EarlySecret, Side::Neutral), 1);
    }

    #[test]
    fn test_derived_secret_resolves_after_its_child() {
        let mut chain = SecretChain::new(Protocol::Tls13);
        chain
            .record_derivation(DerivedSecret, Side::Neutral, Phase::Handshake, Some(slot(0)), slot(1))
            .unwrap();
        let err = chain.retire(DerivedSecret, Side::Neutral).unwrap_err();
        assert_eq!(
            err,
            ChainError::UnresolvedDependents {
                kind: DerivedSecret,
                side: Side::Neutral,
                remaining: 1
            }
        );

        let done = chain.note_produced(
            DerivedSecret,
            Side::Neutral,
            Production::new(HandshakeSecret, Product::Secret),
        );
        assert!(done);
        assert_eq!(chain.retire(DerivedSecret, Side::Neutral), Ok(slot(1)));
        assert_eq!(chain.slot_of(DerivedSecret, Side::Neutral), None);
    }

    #[test]
    fn test_application_phase_derived_owes_master() {
        let mut chain = SecretChain::new(Protocol::Tls13);
        chain
            .record_derivation(DerivedSecret, Side::Neutral, Phase::Application, None, slot(1))
            .unwrap();
        let wrong = Production::new(HandshakeSecret, Product::Secret);
        assert!(!chain.note_produced(DerivedSecret, Side::Neutral, wrong));
        let right = Production::new(MasterSecret, Product::Secret);
        assert!(chain.note_produced(DerivedSecret, Side::Neutral, right));
    }

    #[test]
    fn test_traffic_secret_owes_key_iv_and_finished() {
        let mut chain = SecretChain::new(Protocol::Tls13);
        let chts = ClientHandshakeTrafficSecret;
        chain
            .record_derivation(chts, Side::Client, Phase::Handshake, None, slot(4))
            .unwrap();
        assert_eq!(chain.remaining(chts, Side::Client), 3);
        assert!(!chain.note_produced(chts, Side::Client, Production::new(ClientHandshakeKey, Product::Key)));
        assert!(!chain.note_produced(chts, Side::Client, Production::new(ClientHandshakeKey, Product::Iv)));
        assert!(chain.note_produced(chts, Side::Client, Production::new(ClientFinishedKey, Product::HmacKey)));
    }

    #[test]
    fn test_occupied_node_refuses_overwrite() {
        let mut chain = SecretChain::new(Protocol::Tls13);
        chain
            .record_derivation(HandshakeSecret, Side::Neutral, Phase::Handshake, None, slot(2))
            .unwrap();
        let err = chain
            .record_derivation(HandshakeSecret, Side::Neutral, Phase::Handshake, None, slot(5))
            .unwrap_err();
        assert_eq!(
            err,
            ChainError::Occupied {
                kind: HandshakeSecret,
                side: Side::Neutral
            }
        );
    }

    #[test]
    fn test_session_node_is_displaced() {
        let mut chain = SecretChain::new(Protocol::Tls13);
        let cats = ClientApplicationTrafficSecret;
        chain
            .record_derivation(cats, Side::Client, Phase::Application, None, slot(6))
            .unwrap();
        let old = chain
            .record_derivation(cats, Side::Client, Phase::Application, Some(slot(6)), slot(7))
            .unwrap();
        assert_eq!(old, Some(slot(6)));
        assert_eq!(chain.slot_of(cats, Side::Client), Some(slot(7)));
    }

    #[test]
    fn test_hold_blocks_retire() {
        let mut chain = SecretChain::new(Protocol::Tls13);
        chain
            .record_derivation(ServerFinishedKey, Side::Server, Phase::Handshake, None, slot(9))
            .unwrap();
        chain.acquire(ServerFinishedKey, Side::Server).unwrap();
        assert!(chain.retire(ServerFinishedKey, Side::Server).is_err());
        assert!(chain.check_vacant(ServerFinishedKey, Side::Server).is_err());
        chain.release(ServerFinishedKey, Side::Server);
        assert_eq!(chain.retire(ServerFinishedKey, Side::Server), Ok(slot(9)));
    }

    #[test]
    fn test_tls12_master_owes_keys_and_verify_data() {
        let mut chain = SecretChain::new(Protocol::Tls12);
        chain
            .record_derivation(MasterSecret, Side::Neutral, Phase::Handshake, None, slot(1))
            .unwrap();
        assert_eq!(chain.remaining(MasterSecret, Side::Neutral), 4);
    }

    #[test]
    fn test_predecessor_count_bounded() {
        let all = [
            EarlySecret, HsEarlySecret, HandshakeSecret, MasterSecret, DerivedSecret, BinderKey,
            ClientHandshakeTrafficSecret, ServerHandshakeTrafficSecret,
            ClientApplicationTrafficSecret, ServerApplicationTrafficSecret,
            ClientHandshakeKey, ServerHandshakeKey, ClientApplicationKey, ServerApplicationKey,
            ClientFinishedKey, ServerFinishedKey, ExporterMasterSecret, ResumptionMasterSecret,
            EphemeralKey, SharedSecret,
        ];
        for kind in all {
            for psk in [false, true] {
                assert!(kind.predecessors(psk).len() <= 2, "{kind:?}");
            }
        }
        assert_eq!(DerivedSecret.predecessors(true)[0], HsEarlySecret);
        assert_eq!(DerivedSecret.predecessors(false)[0], EarlySecret);
    }

    #[test]
    fn test_drain_returns_every_slot() {
        let mut chain = SecretChain::new(Protocol::Tls13);
        chain
            .record_derivation(EarlySecret, Side::Neutral, Phase::Handshake, None, slot(0))
            .unwrap();
        chain
            .record_derivation(SharedSecret, Side::Neutral, Phase::Handshake, None, slot(1))
            .unwrap();
        assert_eq!(chain.drain(), vec![slot(0), slot(1)]);
        assert!(chain.is_empty());
    }
}
