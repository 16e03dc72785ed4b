//! Every (label, side, state, psk) combination either maps to a route whose
//! parents are legal predecessors of its child, or is explicitly unmapped.

use tlsvault::router::{route_expand, route_extract, ExtractInput, Ikm, Label, RouteContext, Salt};
use tlsvault::{Phase, RouterError, SecretKind, SessionState, Side};

const STATES: [SessionState; 6] = [
    SessionState::Idle,
    SessionState::EarlySecretReady,
    SessionState::HandshakeSecretReady,
    SessionState::MasterSecretReady,
    SessionState::ApplicationKeysReady,
    SessionState::Closed,
];
const SIDES: [Side; 3] = [Side::Client, Side::Server, Side::Neutral];
const PHASES: [Phase; 2] = [Phase::Handshake, Phase::Application];

fn contexts() -> impl Iterator<Item = RouteContext> {
    STATES.into_iter().flat_map(|state| {
        [false, true].into_iter().flat_map(move |psk| {
            PHASES.into_iter().map(move |traffic_phase| RouteContext {
                state,
                psk,
                traffic_phase,
            })
        })
    })
}

#[test]
fn test_every_expand_request_is_mapped_or_unmapped() {
    let mut mapped = 0;
    for ctx in contexts() {
        for label in Label::ALL {
            for side in SIDES {
                match route_expand(label, side, &ctx) {
                    Ok(route) => {
                        mapped += 1;
                        assert_eq!(route.parents.len(), 1, "{label} routes from one parent");
                        for &(parent, parent_side) in &route.parents {
                            assert!(
                                route.child.predecessors(ctx.psk).contains(&parent),
                                "{parent:?} is not a predecessor of {:?}",
                                route.child
                            );
                            assert_eq!(parent_side, parent.side());
                        }
                        assert_eq!(route.side, route.child.side());
                    }
                    Err(RouterError::UnmappedLabel {
                        label: name,
                        state,
                        psk,
                        ..
                    }) => {
                        assert_eq!(name, label.to_string());
                        assert_eq!(state, ctx.state);
                        assert_eq!(psk, ctx.psk);
                    }
                    Err(other) => panic!("unexpected router error: {other}"),
                }
            }
        }
    }
    assert!(mapped > 0);
}

#[test]
fn test_closed_and_idle_route_no_expand() {
    for ctx in contexts().filter(|c| matches!(c.state, SessionState::Idle | SessionState::Closed)) {
        for label in Label::ALL {
            for side in SIDES {
                assert!(route_expand(label, side, &ctx).is_err());
            }
        }
    }
}

#[test]
fn test_every_extract_request_is_mapped_or_unmapped() {
    let salts = [Salt::Zero, Salt::Derived];
    let ikms = [Ikm::Zero, Ikm::Psk, Ikm::SharedSecret];
    for ctx in contexts() {
        for salt in salts {
            for ikm in ikms {
                match route_extract(ExtractInput::new(salt, ikm), &ctx) {
                    Ok(route) => {
                        for &(parent, _) in &route.parents {
                            assert!(route.child.predecessors(ctx.psk).contains(&parent));
                        }
                    }
                    Err(err) => assert!(matches!(err, RouterError::UnmappedLabel { .. })),
                }
            }
        }
    }
}

#[test]
fn test_non_psk_table() {
    let ctx = |state| RouteContext {
        state,
        psk: false,
        traffic_phase: Phase::Handshake,
    };
    let child = |label, side, state| route_expand(label, side, &ctx(state)).map(|r| r.child);

    assert_eq!(
        child(Label::Derived, Side::Neutral, SessionState::EarlySecretReady),
        Ok(SecretKind::DerivedSecret)
    );
    assert_eq!(
        child(Label::ClientHandshakeTraffic, Side::Client, SessionState::HandshakeSecretReady),
        Ok(SecretKind::ClientHandshakeTrafficSecret)
    );
    assert_eq!(
        child(Label::ServerHandshakeTraffic, Side::Server, SessionState::HandshakeSecretReady),
        Ok(SecretKind::ServerHandshakeTrafficSecret)
    );
    assert_eq!(
        child(Label::ClientApplicationTraffic, Side::Client, SessionState::MasterSecretReady),
        Ok(SecretKind::ClientApplicationTrafficSecret)
    );
    assert_eq!(
        child(Label::ExporterMaster, Side::Neutral, SessionState::MasterSecretReady),
        Ok(SecretKind::ExporterMasterSecret)
    );
    assert_eq!(
        child(Label::Finished, Side::Server, SessionState::HandshakeSecretReady),
        Ok(SecretKind::ServerFinishedKey)
    );
    assert_eq!(
        child(Label::TrafficUpdate, Side::Server, SessionState::ApplicationKeysReady),
        Ok(SecretKind::ServerApplicationTrafficSecret)
    );

    // Wrong side for a sided label.
    assert!(child(Label::ClientHandshakeTraffic, Side::Server, SessionState::HandshakeSecretReady).is_err());
    // Binders need a PSK.
    assert!(child(Label::ExternalBinder, Side::Neutral, SessionState::EarlySecretReady).is_err());
    // Application secrets need the master secret.
    assert!(child(Label::ServerApplicationTraffic, Side::Server, SessionState::HandshakeSecretReady).is_err());
}

#[test]
fn test_psk_table() {
    let ctx = RouteContext {
        state: SessionState::EarlySecretReady,
        psk: true,
        traffic_phase: Phase::Handshake,
    };
    let binder = route_expand(Label::ResumptionBinder, Side::Neutral, &ctx).unwrap();
    assert_eq!(binder.child, SecretKind::BinderKey);
    assert_eq!(binder.primary_parent(), Some(SecretKind::HsEarlySecret));

    let finished = route_expand(Label::Finished, Side::Client, &ctx).unwrap();
    assert_eq!(finished.child, SecretKind::ClientFinishedKey);
    assert_eq!(finished.primary_parent(), Some(SecretKind::BinderKey));

    // Only the client has a binder finished key.
    assert!(route_expand(Label::Finished, Side::Server, &ctx).is_err());

    let early = route_extract(
        ExtractInput::new(Salt::Zero, Ikm::Psk),
        &RouteContext {
            state: SessionState::Idle,
            ..ctx
        },
    )
    .unwrap();
    assert_eq!(early.child, SecretKind::HsEarlySecret);

    // After the handshake secret, "finished" reverts to the traffic secret.
    let later = RouteContext {
        state: SessionState::HandshakeSecretReady,
        ..ctx
    };
    let finished = route_expand(Label::Finished, Side::Client, &later).unwrap();
    assert_eq!(finished.primary_parent(), Some(SecretKind::ClientHandshakeTrafficSecret));
}
