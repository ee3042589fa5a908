//! Test doubles for the session layer.
//!
//! [`MockEngineHandle`] scripts a [`ProtocolEngine`] step by step, so tests
//! can interleave would-block retries, rejections, and failures at any point
//! in the connect sequence. [`CoreHarness`] stands in for the async driver:
//! it applies the core's actions synchronously and records timers and
//! notifications, which keeps state machine tests free of real sockets and
//! real time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::arbiter::ChannelId;
use crate::channel::SshChannel;
use crate::config::SessionConfig;
use crate::engine::{
    AuthOutcome, EngineFactory, EngineResult, HostKey, HostKeyKind, KeyPair, ProtocolEngine, Step,
};
use crate::session::state::{Action, Notification, SessionCore, SessionEvent, SshState};
use crate::transport::TransportIo;

/// A fixed host key for handshake defaults.
#[must_use]
pub fn test_host_key() -> HostKey {
    HostKey {
        kind: HostKeyKind::Rsa,
        fingerprint: vec![0xAB; 16],
        key: b"mock-server-key".to_vec(),
    }
}

#[derive(Default)]
struct Script {
    handshake: VecDeque<EngineResult<Step<HostKey>>>,
    auth_methods: VecDeque<EngineResult<Step<Vec<String>>>>,
    publickey: VecDeque<EngineResult<Step<AuthOutcome>>>,
    password: VecDeque<EngineResult<Step<AuthOutcome>>>,
    keepalive: VecDeque<EngineResult<Step<u32>>>,
    disconnect: VecDeque<EngineResult<Step<()>>>,
    authenticated: bool,
    keepalive_config: Option<(bool, u32)>,
    banner: Option<String>,
    calls: Vec<String>,
}

/// Shared handle to a scripted engine.
///
/// Clones observe the same script, so a test keeps one handle while the
/// factory-produced engine lives inside the session core. An empty script
/// queue yields the success default for that operation.
#[derive(Clone, Default)]
pub struct MockEngineHandle {
    script: Arc<Mutex<Script>>,
}

impl MockEngineHandle {
    /// Create a handle with empty scripts (every operation succeeds).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine factory producing engines backed by this handle's script.
    #[must_use]
    pub fn factory(&self) -> EngineFactory {
        let handle = self.clone();
        Box::new(move || {
            Box::new(MockEngine {
                script: handle.script.clone(),
            })
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Queue a handshake step.
    pub fn script_handshake(&self, step: EngineResult<Step<HostKey>>) {
        self.lock().handshake.push_back(step);
    }

    /// Queue an auth-method listing step.
    pub fn script_auth_methods(&self, step: EngineResult<Step<Vec<String>>>) {
        self.lock().auth_methods.push_back(step);
    }

    /// Queue a publickey attempt step.
    pub fn script_publickey(&self, step: EngineResult<Step<AuthOutcome>>) {
        self.lock().publickey.push_back(step);
    }

    /// Queue a password attempt step.
    pub fn script_password(&self, step: EngineResult<Step<AuthOutcome>>) {
        self.lock().password.push_back(step);
    }

    /// Queue a keepalive probe step.
    pub fn script_keepalive(&self, step: EngineResult<Step<u32>>) {
        self.lock().keepalive.push_back(step);
    }

    /// Queue a protocol-disconnect step.
    pub fn script_disconnect(&self, step: EngineResult<Step<()>>) {
        self.lock().disconnect.push_back(step);
    }

    /// Set the banner the engine reports after its handshake.
    pub fn set_banner(&self, banner: impl Into<String>) {
        self.lock().banner = Some(banner.into());
    }

    /// Names of engine operations invoked so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Count of invocations of one operation.
    #[must_use]
    pub fn call_count(&self, name: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == name).count()
    }

    /// Whether an attempt has been accepted.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.lock().authenticated
    }

    /// The `(want_reply, interval)` last handed to `configure_keepalive`.
    #[must_use]
    pub fn keepalive_config(&self) -> Option<(bool, u32)> {
        self.lock().keepalive_config
    }
}

struct MockEngine {
    script: Arc<Mutex<Script>>,
}

impl ProtocolEngine for MockEngine {
    fn handshake(&mut self, _io: &mut dyn TransportIo) -> EngineResult<Step<HostKey>> {
        let mut script = self.script.lock().unwrap();
        script.calls.push("handshake".into());
        script
            .handshake
            .pop_front()
            .unwrap_or_else(|| Ok(Step::Ready(test_host_key())))
    }

    fn list_auth_methods(
        &mut self,
        _io: &mut dyn TransportIo,
        _user: &str,
    ) -> EngineResult<Step<Vec<String>>> {
        let mut script = self.script.lock().unwrap();
        script.calls.push("list_auth_methods".into());
        script
            .auth_methods
            .pop_front()
            .unwrap_or_else(|| Ok(Step::Ready(vec!["password".to_string()])))
    }

    fn auth_publickey(
        &mut self,
        _io: &mut dyn TransportIo,
        _user: &str,
        _keys: &KeyPair,
        _passphrase: &str,
    ) -> EngineResult<Step<AuthOutcome>> {
        let mut script = self.script.lock().unwrap();
        script.calls.push("auth_publickey".into());
        let step = script
            .publickey
            .pop_front()
            .unwrap_or(Ok(Step::Ready(AuthOutcome::Accepted)));
        if matches!(step, Ok(Step::Ready(AuthOutcome::Accepted))) {
            script.authenticated = true;
        }
        step
    }

    fn auth_password(
        &mut self,
        _io: &mut dyn TransportIo,
        _user: &str,
        _password: &str,
    ) -> EngineResult<Step<AuthOutcome>> {
        let mut script = self.script.lock().unwrap();
        script.calls.push("auth_password".into());
        let step = script
            .password
            .pop_front()
            .unwrap_or(Ok(Step::Ready(AuthOutcome::Accepted)));
        if matches!(step, Ok(Step::Ready(AuthOutcome::Accepted))) {
            script.authenticated = true;
        }
        step
    }

    fn is_authenticated(&self) -> bool {
        self.script.lock().unwrap().authenticated
    }

    fn configure_keepalive(&mut self, want_reply: bool, interval_secs: u32) {
        let mut script = self.script.lock().unwrap();
        script.calls.push("configure_keepalive".into());
        script.keepalive_config = Some((want_reply, interval_secs));
    }

    fn send_keepalive(&mut self, _io: &mut dyn TransportIo) -> EngineResult<Step<u32>> {
        let mut script = self.script.lock().unwrap();
        script.calls.push("send_keepalive".into());
        script.keepalive.pop_front().unwrap_or(Ok(Step::Ready(5)))
    }

    fn disconnect(
        &mut self,
        _io: &mut dyn TransportIo,
        _description: &str,
    ) -> EngineResult<Step<()>> {
        let mut script = self.script.lock().unwrap();
        script.calls.push("disconnect".into());
        script.disconnect.pop_front().unwrap_or(Ok(Step::Ready(())))
    }

    fn banner(&self) -> Option<String> {
        self.script.lock().unwrap().banner.clone()
    }
}

/// Socket-free transport double.
#[derive(Debug)]
pub struct MockTransport {
    connected: bool,
}

impl MockTransport {
    /// A connected transport whose reads always would-block.
    #[must_use]
    pub const fn new() -> Self {
        Self { connected: true }
    }

    /// Mark the transport as disconnected.
    pub fn set_disconnected(&mut self) {
        self.connected = false;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportIo for MockTransport {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        Err(std::io::ErrorKind::WouldBlock.into())
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(buf.len())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Channel double counting close requests.
pub struct StubChannel {
    id: ChannelId,
    closes: Mutex<usize>,
}

impl StubChannel {
    /// Create a stub with a fresh identity.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::next(),
            closes: Mutex::new(0),
        })
    }

    /// How many times close() was called.
    #[must_use]
    pub fn close_count(&self) -> usize {
        *self.closes.lock().unwrap()
    }
}

impl SshChannel for StubChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn name(&self) -> String {
        format!("stub:{}", self.id)
    }

    fn close(&self) {
        *self.closes.lock().unwrap() += 1;
    }
}

/// Synchronous stand-in for the async driver.
///
/// Dispatches events through the core, applies the resulting actions, and
/// records every externally visible effect. `CloseTransport` is answered
/// with a `TransportDisconnected` event exactly like the real driver does.
pub struct CoreHarness {
    /// The core under test.
    pub core: SessionCore,
    /// Every notification emitted so far, in order.
    pub notifications: Vec<Notification>,
    /// Keepalive delays armed so far, in order.
    pub keepalive_delays: Vec<Duration>,
    /// How many times the keepalive timer was stopped.
    pub keepalive_stops: usize,
    /// Currently armed connect timer, if any.
    pub connect_timer: Option<Duration>,
    /// `(host, port)` pairs the core asked to connect to.
    pub started_connects: Vec<(String, u16)>,
    /// Complete TCP connects automatically by attaching a [`MockTransport`].
    pub auto_connect: bool,
    events: VecDeque<SessionEvent>,
}

impl CoreHarness {
    /// Build a harness around a fresh core.
    #[must_use]
    pub fn new(config: SessionConfig, factory: EngineFactory) -> Self {
        Self {
            core: SessionCore::new(config, factory),
            notifications: Vec::new(),
            keepalive_delays: Vec::new(),
            keepalive_stops: 0,
            connect_timer: None,
            started_connects: Vec::new(),
            auto_connect: true,
            events: VecDeque::new(),
        }
    }

    /// Harness with default config and a scripted engine.
    #[must_use]
    pub fn with_engine(handle: &MockEngineHandle) -> Self {
        Self::new(SessionConfig::default(), handle.factory())
    }

    /// Issue a connect request and drain the resulting events.
    pub fn connect(&mut self, user: &str, host: &str, port: u16, methods: &[&str]) -> bool {
        let methods = methods.iter().map(|m| (*m).to_string()).collect();
        let mut actions = Vec::new();
        let accepted = self
            .core
            .connect_to_host(user, host, port, methods, &mut actions);
        self.apply(actions);
        self.drain();
        accepted
    }

    /// Issue a disconnect request and drain the resulting events.
    pub fn disconnect(&mut self) {
        let mut actions = Vec::new();
        self.core.disconnect_from_host(&mut actions);
        self.apply(actions);
        self.drain();
    }

    /// Unregister a channel and drain the resulting events.
    pub fn unregister(&mut self, id: ChannelId) {
        let mut actions = Vec::new();
        self.core.unregister_channel(id, &mut actions);
        self.apply(actions);
        self.drain();
    }

    /// Dispatch one event and drain everything it triggers.
    pub fn dispatch(&mut self, event: SessionEvent) {
        self.events.push_back(event);
        self.drain();
    }

    /// The state transitions observed so far, in order.
    #[must_use]
    pub fn states(&self) -> Vec<SshState> {
        self.notifications
            .iter()
            .filter_map(|n| match n {
                Notification::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    /// Whether an error notification was observed.
    #[must_use]
    pub fn saw_error(&self) -> bool {
        self.notifications
            .iter()
            .any(|n| matches!(n, Notification::Error(_)))
    }

    fn drain(&mut self) {
        while let Some(event) = self.events.pop_front() {
            let actions = self.core.process(event);
            self.apply(actions);
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::StartConnect { host, port } => {
                    self.started_connects.push((host, port));
                    if self.auto_connect {
                        self.core.attach_transport(Box::new(MockTransport::new()));
                        self.events.push_back(SessionEvent::TransportConnected);
                    }
                }
                Action::StartConnectTimer(d) => self.connect_timer = Some(d),
                Action::StopConnectTimer => self.connect_timer = None,
                Action::ArmKeepalive(d) => self.keepalive_delays.push(d),
                Action::StopKeepalive => self.keepalive_stops += 1,
                Action::CloseTransport => {
                    self.events.push_back(SessionEvent::TransportDisconnected);
                }
                Action::Requeue => self.events.push_back(SessionEvent::Process),
                Action::Notify(n) => self.notifications.push(n),
            }
        }
    }
}
