//! End-to-end walks of the session lifecycle against a scripted engine.

use proptest::prelude::*;
use sshlink::session::SessionEvent;
use sshlink::test_utils::{CoreHarness, MockEngineHandle, StubChannel, test_host_key};
use sshlink::{AuthOutcome, Notification, SshChannel, SshState, Step};

/// Route core tracing through the test harness; honors `RUST_LOG`.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn full_lifecycle_connect_then_disconnect() {
    init_logging();
    let engine = MockEngineHandle::new();
    let mut harness = CoreHarness::with_engine(&engine);

    assert!(harness.connect("user", "example.com", 22, &[]));
    assert_eq!(harness.core.state(), SshState::Ready);

    harness.disconnect();
    assert_eq!(harness.core.state(), SshState::Unconnected);
    assert!(harness.notifications.contains(&Notification::Ready));
    assert!(harness.notifications.contains(&Notification::Disconnected));

    // The session is reusable after a full teardown.
    assert!(harness.connect("user", "example.com", 22, &[]));
    assert_eq!(harness.core.state(), SshState::Ready);
}

#[test]
fn channels_are_closed_and_awaited_during_teardown() {
    init_logging();
    let engine = MockEngineHandle::new();
    let mut harness = CoreHarness::with_engine(&engine);
    harness.connect("user", "example.com", 22, &[]);

    let channel = StubChannel::new();
    let arc: std::sync::Arc<dyn SshChannel> = channel.clone();
    harness.core.register_channel(&arc);

    harness.disconnect();
    assert_eq!(harness.core.state(), SshState::DisconnectingChannel);
    assert_eq!(channel.close_count(), 1);
    assert_eq!(engine.call_count("disconnect"), 0);

    harness.unregister(channel.id());
    assert_eq!(harness.core.state(), SshState::Unconnected);
    assert_eq!(engine.call_count("disconnect"), 1);
}

#[test]
fn publickey_then_password_ordering_is_preserved() {
    init_logging();
    let engine = MockEngineHandle::new();
    engine.script_publickey(Ok(Step::Ready(AuthOutcome::Rejected)));
    engine.script_password(Ok(Step::Ready(AuthOutcome::Accepted)));
    let mut harness = CoreHarness::with_engine(&engine);

    harness.connect("user", "example.com", 22, &["publickey", "password"]);

    assert_eq!(harness.core.state(), SshState::Ready);
    let attempts: Vec<String> = engine
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("auth_"))
        .collect();
    assert_eq!(attempts, vec!["auth_publickey", "auth_password"]);
}

proptest! {
    /// However many times the engine reports would-block mid-sequence, each
    /// readiness event resumes exactly one suspended step and the walk still
    /// ends in Ready with every step attempted the expected number of times.
    #[test]
    fn would_block_retries_never_change_the_outcome(
        handshake_blocks in 0usize..5,
        list_blocks in 0usize..5,
        auth_blocks in 0usize..5,
    ) {
        init_logging();
        let engine = MockEngineHandle::new();
        for _ in 0..handshake_blocks {
            engine.script_handshake(Ok(Step::WouldBlock));
        }
        engine.script_handshake(Ok(Step::Ready(test_host_key())));
        for _ in 0..list_blocks {
            engine.script_auth_methods(Ok(Step::WouldBlock));
        }
        engine.script_auth_methods(Ok(Step::Ready(vec!["password".to_string()])));
        for _ in 0..auth_blocks {
            engine.script_password(Ok(Step::WouldBlock));
        }
        engine.script_password(Ok(Step::Ready(AuthOutcome::Accepted)));

        let mut harness = CoreHarness::with_engine(&engine);
        prop_assert!(harness.connect("user", "example.com", 22, &[]));

        let total_blocks = handshake_blocks + list_blocks + auth_blocks;
        let mut turns = 0;
        while harness.core.state() != SshState::Ready {
            harness.dispatch(SessionEvent::Readable);
            turns += 1;
            prop_assert!(turns <= total_blocks, "stuck after {turns} readiness events");
        }

        prop_assert_eq!(engine.call_count("handshake"), handshake_blocks + 1);
        prop_assert_eq!(engine.call_count("list_auth_methods"), list_blocks + 1);
        prop_assert_eq!(engine.call_count("auth_password"), auth_blocks + 1);
        prop_assert!(!harness.saw_error());
    }
}
