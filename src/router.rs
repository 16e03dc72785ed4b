//! Maps generic HKDF calls from a TLS stack onto the key-schedule graph.
//!
//! A TLS stack only ever asks for "extract with this salt and IKM" or
//! "expand this secret with this label". The router turns such a request,
//! together with the session's state, PSK mode and traffic phase, into
//! exactly one [`Route`]: the node to produce, the nodes it is produced
//! from and what the device writes. Anything outside the closed label set,
//! or a label that makes no sense in the current state, is an error.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chain::{Phase, Product, SecretKind, Side};
use crate::error::RouterError;
use crate::session::SessionState;

const LABEL_PREFIX: &[u8] = b"tls13 ";

/// Whether a request is an HKDF-Extract or an HKDF-Expand-Label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Extract,
    Expand,
}

/// The closed set of TLS 1.3 expand labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Derived,
    ClientHandshakeTraffic,
    ServerHandshakeTraffic,
    ClientApplicationTraffic,
    ServerApplicationTraffic,
    ExporterMaster,
    ResumptionMaster,
    ExternalBinder,
    ResumptionBinder,
    Key,
    Iv,
    Finished,
    TrafficUpdate,
}

impl Label {
    /// Every label, in schedule order.
    pub const ALL: [Label; 13] = [
        Label::Derived,
        Label::ClientHandshakeTraffic,
        Label::ServerHandshakeTraffic,
        Label::ClientApplicationTraffic,
        Label::ServerApplicationTraffic,
        Label::ExporterMaster,
        Label::ResumptionMaster,
        Label::ExternalBinder,
        Label::ResumptionBinder,
        Label::Key,
        Label::Iv,
        Label::Finished,
        Label::TrafficUpdate,
    ];

    /// Wire form without the `"tls13 "` prefix.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Derived => b"derived",
            Self::ClientHandshakeTraffic => b"c hs traffic",
            Self::ServerHandshakeTraffic => b"s hs traffic",
            Self::ClientApplicationTraffic => b"c ap traffic",
            Self::ServerApplicationTraffic => b"s ap traffic",
            Self::ExporterMaster => b"exp master",
            Self::ResumptionMaster => b"res master",
            Self::ExternalBinder => b"ext binder",
            Self::ResumptionBinder => b"res binder",
            Self::Key => b"key",
            Self::Iv => b"iv",
            Self::Finished => b"finished",
            Self::TrafficUpdate => b"traffic upd",
        }
    }

    /// Exact match on the bare label or its `"tls13 "`-prefixed form.
    pub fn parse(bytes: &[u8]) -> Result<Self, RouterError> {
        let bare = bytes.strip_prefix(LABEL_PREFIX).unwrap_or(bytes);
        Self::ALL
            .into_iter()
            .find(|l| l.as_bytes() == bare)
            .ok_or_else(|| RouterError::UnknownLabel(String::from_utf8_lossy(bytes).into_owned()))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Salt of an extract request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Salt {
    /// All-zero salt.
    Zero,
    /// The current `DerivedSecret`.
    Derived,
}

/// Input keying material of an extract request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ikm {
    Zero,
    /// The provisioned pre-shared key.
    Psk,
    /// The ECDHE shared secret.
    SharedSecret,
}

/// The shape of an HKDF-Extract call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtractInput {
    pub salt: Salt,
    pub ikm: Ikm,
}

impl ExtractInput {
    pub fn new(salt: Salt, ikm: Ikm) -> Self {
        Self { salt, ikm }
    }
}

/// Session facts the router decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteContext {
    /// State of the asking session.
    pub state: SessionState,
    /// Whether the handshake runs in PSK mode.
    pub psk: bool,
    /// Phase a bare `"key"`/`"iv"` refers to.
    pub traffic_phase: Phase,
}

/// One transition of the key schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Node the step writes.
    pub child: SecretKind,
    pub side: Side,
    /// Phase recorded on the child node.
    pub phase: Phase,
    /// Nodes read by the step, in command order (salt before IKM).
    pub parents: Vec<(SecretKind, Side)>,
    /// What lands on the device.
    pub product: Product,
}

impl Route {
    pub(crate) fn new(
        child: SecretKind,
        phase: Phase,
        parents: &[SecretKind],
        product: Product,
    ) -> Self {
        Self {
            child,
            side: child.side(),
            phase,
            parents: parents.iter().map(|&k| (k, k.side())).collect(),
            product,
        }
    }

    /// The node the step reads first, if any.
    pub fn primary_parent(&self) -> Option<SecretKind> {
        self.parents.first().map(|&(k, _)| k)
    }
}

/// Route an HKDF-Extract call.
pub fn route_extract(input: ExtractInput, ctx: &RouteContext) -> Result<Route, RouterError> {
    use SessionState::*;

    let route = match (input.salt, input.ikm, ctx.state, ctx.psk) {
        (Salt::Zero, Ikm::Zero, Idle, false) => {
            Route::new(SecretKind::EarlySecret, Phase::Handshake, &[], Product::Secret)
        }
        (Salt::Zero, Ikm::Psk, Idle, true) => {
            Route::new(SecretKind::HsEarlySecret, Phase::Handshake, &[], Product::Secret)
        }
        (Salt::Derived, Ikm::SharedSecret, EarlySecretReady, _) => Route::new(
            SecretKind::HandshakeSecret,
            Phase::Handshake,
            &[SecretKind::DerivedSecret, SecretKind::SharedSecret],
            Product::Secret,
        ),
        (Salt::Derived, Ikm::Zero, HandshakeSecretReady, _) => Route::new(
            SecretKind::MasterSecret,
            Phase::Application,
            &[SecretKind::DerivedSecret],
            Product::Secret,
        ),
        _ => {
            return Err(unmapped(
                format!("extract({:?}, {:?})", input.salt, input.ikm),
                Direction::Extract,
                Side::Neutral,
                ctx,
            ))
        }
    };
    Ok(route)
}

/// Route an HKDF-Expand-Label call.
///
/// `side` names whose secret is meant. Labels that carry their own side
/// (`"c hs traffic"`) must be called with that side; neutral secrets with
/// `Side::Neutral`; `"key"`, `"iv"`, `"finished"` and `"traffic upd"`
/// with the endpoint whose traffic secret is expanded.
pub fn route_expand(label: Label, side: Side, ctx: &RouteContext) -> Result<Route, RouterError> {
    use SecretKind::*;
    use SessionState::*;

    let fail = || unmapped(label.to_string(), Direction::Expand, side, ctx);
    let after_master = matches!(ctx.state, MasterSecretReady | ApplicationKeysReady);
    let in_handshake = matches!(
        ctx.state,
        HandshakeSecretReady | MasterSecretReady | ApplicationKeysReady
    );

    let route = match (label, side) {
        (Label::Derived, Side::Neutral) => match (ctx.state, ctx.psk) {
            (EarlySecretReady, false) => {
                Route::new(DerivedSecret, Phase::Handshake, &[EarlySecret], Product::Secret)
            }
            (EarlySecretReady, true) => {
                Route::new(DerivedSecret, Phase::Handshake, &[HsEarlySecret], Product::Secret)
            }
            (HandshakeSecretReady, _) => {
                Route::new(DerivedSecret, Phase::Application, &[HandshakeSecret], Product::Secret)
            }
            _ => return Err(fail()),
        },
        (Label::ExternalBinder | Label::ResumptionBinder, Side::Neutral)
            if ctx.psk && ctx.state == EarlySecretReady =>
        {
            Route::new(BinderKey, Phase::Handshake, &[HsEarlySecret], Product::Secret)
        }
        (Label::ClientHandshakeTraffic, Side::Client)
            if matches!(ctx.state, HandshakeSecretReady | MasterSecretReady) =>
        {
            Route::new(ClientHandshakeTrafficSecret, Phase::Handshake, &[HandshakeSecret], Product::Secret)
        }
        (Label::ServerHandshakeTraffic, Side::Server)
            if matches!(ctx.state, HandshakeSecretReady | MasterSecretReady) =>
        {
            Route::new(ServerHandshakeTrafficSecret, Phase::Handshake, &[HandshakeSecret], Product::Secret)
        }
        (Label::ClientApplicationTraffic, Side::Client) if after_master => Route::new(
            ClientApplicationTrafficSecret,
            Phase::Application,
            &[MasterSecret],
            Product::Secret,
        ),
        (Label::ServerApplicationTraffic, Side::Server) if after_master => Route::new(
            ServerApplicationTrafficSecret,
            Phase::Application,
            &[MasterSecret],
            Product::Secret,
        ),
        (Label::ExporterMaster, Side::Neutral) if after_master => {
            Route::new(ExporterMasterSecret, Phase::Application, &[MasterSecret], Product::Secret)
        }
        (Label::ResumptionMaster, Side::Neutral) if after_master => {
            Route::new(ResumptionMasterSecret, Phase::Application, &[MasterSecret], Product::Secret)
        }
        (Label::Key | Label::Iv, Side::Client | Side::Server) if in_handshake => {
            let (secret, key) = traffic_nodes(side, ctx.traffic_phase);
            let product = if label == Label::Key { Product::Key } else { Product::Iv };
            Route::new(key, ctx.traffic_phase, &[secret], product)
        }
        (Label::Finished, Side::Client) if ctx.psk && ctx.state == EarlySecretReady => {
            Route::new(ClientFinishedKey, Phase::Handshake, &[BinderKey], Product::HmacKey)
        }
        (Label::Finished, Side::Client | Side::Server) if in_handshake => {
            let (secret, _) = traffic_nodes(side, Phase::Handshake);
            let child = match side {
                Side::Client => ClientFinishedKey,
                _ => ServerFinishedKey,
            };
            Route::new(child, Phase::Handshake, &[secret], Product::HmacKey)
        }
        (Label::TrafficUpdate, Side::Client | Side::Server) if ctx.state == ApplicationKeysReady => {
            let (secret, _) = traffic_nodes(side, Phase::Application);
            Route::new(secret, Phase::Application, &[secret], Product::Secret)
        }
        _ => return Err(fail()),
    };
    Ok(route)
}

/// Traffic secret and record key of one endpoint in one phase.
pub(crate) fn traffic_nodes(side: Side, phase: Phase) -> (SecretKind, SecretKind) {
    use SecretKind::*;
    match (side, phase) {
        (Side::Server, Phase::Handshake) => (ServerHandshakeTrafficSecret, ServerHandshakeKey),
        (Side::Server, Phase::Application) => (ServerApplicationTrafficSecret, ServerApplicationKey),
        (_, Phase::Handshake) => (ClientHandshakeTrafficSecret, ClientHandshakeKey),
        (_, Phase::Application) => (ClientApplicationTrafficSecret, ClientApplicationKey),
    }
}

fn unmapped(label: String, direction: Direction, side: Side, ctx: &RouteContext) -> RouterError {
    tracing::warn!(
        target: "tlsvault::router",
        %label,
        ?direction,
        ?side,
        state = ?ctx.state,
        psk = ctx.psk,
        "unmapped key-schedule request"
    );
    RouterError::UnmappedLabel {
        label,
        direction,
        side,
        state: ctx.state,
        psk: ctx.psk,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(state: SessionState, psk: bool, traffic_phase: Phase) -> RouteContext {
        RouteContext {
            state,
            psk,
            traffic_phase,
        }
    }

    #[test]
    fn test_parse_exact_labels() {
        assert_eq!(Label::parse(b"derived").unwrap(), Label::Derived);
        assert_eq!(Label::parse(b"tls13 c hs traffic").unwrap(), Label::ClientHandshakeTraffic);
        assert_eq!(Label::parse(b"iv").unwrap(), Label::Iv);
        // Substrings and supersets are not labels.
        assert!(Label::parse(b"hs traffic").is_err());
        assert!(Label::parse(b"c hs traffic2").is_err());
        assert!(Label::parse(b"tls13 ").is_err());
        assert!(matches!(Label::parse(b"KEY"), Err(RouterError::UnknownLabel(_))));
    }

    #[test]
    fn test_derived_depends_on_state() {
        let early = route_expand(
            Label::Derived,
            Side::Neutral,
            &ctx(SessionState::EarlySecretReady, false, Phase::Handshake),
        )
        .unwrap();
        assert_eq!(early.primary_parent(), Some(SecretKind::EarlySecret));
        assert_eq!(early.phase, Phase::Handshake);

        let hs = route_expand(
            Label::Derived,
            Side::Neutral,
            &ctx(SessionState::HandshakeSecretReady, false, Phase::Handshake),
        )
        .unwrap();
        assert_eq!(hs.primary_parent(), Some(SecretKind::HandshakeSecret));
        assert_eq!(hs.phase, Phase::Application);

        let psk = route_expand(
            Label::Derived,
            Side::Neutral,
            &ctx(SessionState::EarlySecretReady, true, Phase::Handshake),
        )
        .unwrap();
        assert_eq!(psk.primary_parent(), Some(SecretKind::HsEarlySecret));

        assert!(route_expand(
            Label::Derived,
            Side::Neutral,
            &ctx(SessionState::Idle, false, Phase::Handshake)
        )
        .is_err());
    }

    #[test]
    fn test_key_follows_traffic_phase() {
        let hs = route_expand(
            Label::Key,
            Side::Server,
            &ctx(SessionState::MasterSecretReady, false, Phase::Handshake),
        )
        .unwrap();
        assert_eq!(hs.child, SecretKind::ServerHandshakeKey);

        let ap = route_expand(
            Label::Key,
            Side::Server,
            &ctx(SessionState::MasterSecretReady, false, Phase::Application),
        )
        .unwrap();
        assert_eq!(ap.child, SecretKind::ServerApplicationKey);
        assert_eq!(ap.primary_parent(), Some(SecretKind::ServerApplicationTrafficSecret));

        let iv = route_expand(
            Label::Iv,
            Side::Client,
            &ctx(SessionState::ApplicationKeysReady, false, Phase::Application),
        )
        .unwrap();
        assert_eq!(iv.product, Product::Iv);
        assert_eq!(iv.child, SecretKind::ClientApplicationKey);
    }

    #[test]
    fn test_neutral_key_is_unmapped() {
        let err = route_expand(
            Label::Key,
            Side::Neutral,
            &ctx(SessionState::ApplicationKeysReady, false, Phase::Application),
        )
        .unwrap_err();
        assert!(matches!(err, RouterError::UnmappedLabel { direction: Direction::Expand, .. }));
    }

    #[test]
    fn test_side_must_match_label() {
        assert!(route_expand(
            Label::ClientHandshakeTraffic,
            Side::Server,
            &ctx(SessionState::HandshakeSecretReady, false, Phase::Handshake)
        )
        .is_err());
    }

    #[test]
    fn test_binder_requires_psk() {
        let c = ctx(SessionState::EarlySecretReady, false, Phase::Handshake);
        assert!(route_expand(Label::ExternalBinder, Side::Neutral, &c).is_err());

        let c = ctx(SessionState::EarlySecretReady, true, Phase::Handshake);
        let r = route_expand(Label::ResumptionBinder, Side::Neutral, &c).unwrap();
        assert_eq!(r.child, SecretKind::BinderKey);

        let fin = route_expand(Label::Finished, Side::Client, &c).unwrap();
        assert_eq!(fin.primary_parent(), Some(SecretKind::BinderKey));
    }

    #[test]
    fn test_traffic_update_reads_and_writes_same_node() {
        let r = route_expand(
            Label::TrafficUpdate,
            Side::Client,
            &ctx(SessionState::ApplicationKeysReady, false, Phase::Application),
        )
        .unwrap();
        assert_eq!(r.child, SecretKind::ClientApplicationTrafficSecret);
        assert_eq!(r.parents, vec![(r.child, Side::Client)]);
    }

    #[test]
    fn test_extract_shapes() {
        let idle = ctx(SessionState::Idle, false, Phase::Handshake);
        let early = route_extract(ExtractInput::new(Salt::Zero, Ikm::Zero), &idle).unwrap();
        assert_eq!(early.child, SecretKind::EarlySecret);
        assert!(early.parents.is_empty());

        assert!(route_extract(ExtractInput::new(Salt::Zero, Ikm::Psk), &idle).is_err());

        let es = ctx(SessionState::EarlySecretReady, false, Phase::Handshake);
        let hs = route_extract(ExtractInput::new(Salt::Derived, Ikm::SharedSecret), &es).unwrap();
        assert_eq!(
            hs.parents,
            vec![
                (SecretKind::DerivedSecret, Side::Neutral),
                (SecretKind::SharedSecret, Side::Neutral)
            ]
        );

        let err = route_extract(ExtractInput::new(Salt::Derived, Ikm::Zero), &es).unwrap_err();
        assert!(matches!(err, RouterError::UnmappedLabel { direction: Direction::Extract, .. }));
    }
}
