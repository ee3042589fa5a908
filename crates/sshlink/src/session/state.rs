//! The session state machine.
//!
//! A strictly sequential state walk from connect request to Ready and back
//! down through the teardown states. The core is synchronous and effect-free
//! at its boundary: events go in, [`Action`]s come out, and the owning driver
//! performs the socket, timer, and notification work. Any engine call that
//! reports would-block leaves the state untouched so the step is re-entered
//! verbatim on the next triggering event.
//!
//! States that complete synchronously fall through to the next state within
//! the same processing pass, so a connect typically costs a handful of event
//! turns rather than one per state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::arbiter::ChannelId;
use crate::channel::{ChannelRegistry, SshChannel};
use crate::config::SessionConfig;
use crate::engine::{AuthOutcome, EngineFactory, HostKey, KeyPair, ProtocolEngine, Step};
use crate::keepalive::{KeepaliveMonitor, KeepaliveVerdict};
use crate::known_hosts::{KnownHostCheck, KnownHostsStore};
use crate::transport::TransportIo;

/// Delay before retrying a keepalive probe that would block.
const KEEPALIVE_RETRY: Duration = Duration::from_secs(1);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshState {
    /// No connection; the session is reusable from here.
    Unconnected,
    /// Connect request accepted, TCP connect not yet started.
    SocketConnection,
    /// TCP connect in flight.
    WaitingSocketConnection,
    /// Create the engine and the known-hosts store.
    Initialize,
    /// Protocol handshake in progress.
    HandShake,
    /// Discovering server-offered authentication methods.
    GetAuthenticationMethods,
    /// Trying candidate authentication methods in order.
    Authentication,
    /// Connected and authenticated; channels may be created.
    Ready,
    /// Teardown: waiting for every registered channel to unregister.
    DisconnectingChannel,
    /// Teardown: sending the protocol-level disconnect.
    DisconnectingSession,
    /// Teardown: releasing the engine and the known-hosts store.
    FreeSession,
    /// Unrecoverable failure; cleaned up back to Unconnected via FreeSession.
    Error,
}

impl std::fmt::Display for SshState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Events that drive the state machine forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Internal "run the next step" event, requeued by the driver.
    Process,
    /// The TCP connect completed.
    TransportConnected,
    /// The transport is gone (peer close or forced by the driver).
    TransportDisconnected,
    /// The transport reported a socket error.
    SocketError,
    /// Bytes are readable on the transport.
    Readable,
    /// The connect-phase timer fired.
    ConnectTimeout,
    /// The keepalive timer fired.
    KeepaliveTick,
}

/// Observable notifications emitted to callers and channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The session state changed.
    StateChanged(SshState),
    /// The session reached Ready.
    Ready,
    /// Data arrived while Ready; channels should service their reads.
    DataAvailable,
    /// The session failed.
    Error(String),
    /// The session finished tearing down.
    Disconnected,
}

/// Side effects the driver performs on behalf of the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Begin the TCP connect.
    StartConnect {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },
    /// Arm the connect-phase timer.
    StartConnectTimer(Duration),
    /// Disarm the connect-phase timer.
    StopConnectTimer,
    /// Arm the one-shot keepalive timer.
    ArmKeepalive(Duration),
    /// Disarm the keepalive timer.
    StopKeepalive,
    /// Drop the transport; the driver must follow up with a
    /// `TransportDisconnected` event once it has.
    CloseTransport,
    /// Re-enter the state machine on the next loop turn.
    Requeue,
    /// Emit a notification to subscribers.
    Notify(Notification),
}

/// Credential material, mutually exclusive per attempt.
///
/// The passphrase doubles as the password for `password` authentication.
#[derive(Debug, Clone, Default)]
struct Credentials {
    keys: KeyPair,
    passphrase: String,
}

/// The single-owner session core.
///
/// Owned exclusively by the driver task; never accessed concurrently.
pub struct SessionCore {
    config: SessionConfig,
    state: SshState,
    engine_factory: EngineFactory,
    engine: Option<Box<dyn ProtocolEngine>>,
    transport: Option<Box<dyn TransportIo>>,
    known_hosts: Option<KnownHostsStore>,
    host_key: Option<HostKey>,
    host_key_check: Option<KnownHostCheck>,
    username: String,
    hostname: String,
    port: u16,
    auth_methods: VecDeque<String>,
    credentials: Credentials,
    last_proof_of_live: Instant,
    registry: ChannelRegistry,
    monitor: KeepaliveMonitor,
}

impl std::fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCore")
            .field("name", &self.config.name)
            .field("state", &self.state)
            .field("host", &self.hostname)
            .field("channels", &self.registry.len())
            .finish()
    }
}

impl SessionCore {
    /// Create an unconnected core.
    #[must_use]
    pub fn new(config: SessionConfig, engine_factory: EngineFactory) -> Self {
        let monitor = KeepaliveMonitor::new(&config.keepalive);
        Self {
            config,
            state: SshState::Unconnected,
            engine_factory,
            engine: None,
            transport: None,
            known_hosts: None,
            host_key: None,
            host_key_check: None,
            username: String::new(),
            hostname: String::new(),
            port: 0,
            auth_methods: VecDeque::new(),
            credentials: Credentials::default(),
            last_proof_of_live: Instant::now(),
            registry: ChannelRegistry::new(),
            monitor,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SshState {
        self.state
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Host key captured by the last handshake.
    #[must_use]
    pub const fn host_key(&self) -> Option<&HostKey> {
        self.host_key.as_ref()
    }

    /// Result of the known-hosts consultation for the last handshake.
    #[must_use]
    pub const fn host_key_check(&self) -> Option<KnownHostCheck> {
        self.host_key_check
    }

    /// Server identification banner, once the handshake has completed.
    #[must_use]
    pub fn banner(&self) -> Option<String> {
        self.engine.as_ref().and_then(|e| e.banner())
    }

    /// Number of registered channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.registry.len()
    }

    /// Install the transport adapter for the freshly connected socket.
    pub fn attach_transport(&mut self, transport: Box<dyn TransportIo>) {
        self.transport = Some(transport);
    }

    /// Stage readable bytes off the transport. No-op without a transport.
    pub fn probe_transport(&mut self) -> std::io::Result<usize> {
        self.transport.as_mut().map_or(Ok(0), |t| t.probe())
    }

    /// Whether a transport is attached and still connected.
    #[must_use]
    pub fn transport_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    /// Rewind the proof-of-live clock, for liveness threshold tests.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn backdate_proof_of_live(&mut self, by: Duration) {
        self.last_proof_of_live = Instant::now() - by;
    }

    // ------------------------------------------------------------------
    // External requests (dispatched by the driver, one at a time)
    // ------------------------------------------------------------------

    /// Handle a connect request.
    ///
    /// Refused (returns false) unless the session is Unconnected. An empty
    /// `methods` list means "ask the server".
    pub fn connect_to_host(
        &mut self,
        user: &str,
        host: &str,
        port: u16,
        methods: Vec<String>,
        actions: &mut Vec<Action>,
    ) -> bool {
        if self.state != SshState::Unconnected {
            tracing::warn!(name = %self.config.name, state = %self.state, "already connected");
            return false;
        }

        self.username = user.to_string();
        self.hostname = host.to_string();
        self.port = port;
        self.auth_methods = methods.into();
        self.host_key = None;
        self.host_key_check = None;

        self.set_state(SshState::SocketConnection, actions);
        actions.push(Action::Requeue);
        true
    }

    /// Handle a disconnect request. Idempotent no-op when Unconnected.
    pub fn disconnect_from_host(&mut self, actions: &mut Vec<Action>) {
        if self.state == SshState::Unconnected {
            return;
        }

        tracing::debug!(name = %self.config.name, "disconnect requested");
        if self.registry.is_empty() {
            self.set_state(SshState::DisconnectingSession, actions);
        } else {
            self.set_state(SshState::DisconnectingChannel, actions);
        }
        actions.push(Action::Requeue);
    }

    /// Set the passphrase (also used as the `password` method's password).
    pub fn set_passphrase(&mut self, passphrase: impl Into<String>) {
        self.credentials.passphrase = passphrase.into();
    }

    /// Set the key pair for `publickey` authentication.
    pub fn set_keys(&mut self, public_key: impl Into<String>, private_key: impl Into<String>) {
        self.credentials.keys = KeyPair {
            public_key: public_key.into(),
            private_key: private_key.into(),
        };
    }

    /// Set the known-hosts file loaded on the next Initialize.
    pub fn set_known_hosts_file(&mut self, path: impl Into<std::path::PathBuf>) {
        self.config.known_hosts_file = Some(path.into());
    }

    /// Insert a trusted key into the live store.
    ///
    /// The store only exists within the connected window; outside it this is
    /// a reported caller error.
    pub fn add_known_host(&mut self, hostname: &str, key: &HostKey) -> bool {
        match self.known_hosts.as_mut() {
            Some(store) => store.add(hostname, key),
            None => {
                tracing::warn!(name = %self.config.name, "add_known_host outside connected window");
                false
            }
        }
    }

    /// Persist the live store to `path`.
    pub fn save_known_hosts(&mut self, path: &std::path::Path) -> bool {
        match self.known_hosts.as_ref() {
            Some(store) => match store.save(path) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        name = %self.config.name,
                        path = %path.display(),
                        error = %e,
                        "failed to save known_hosts"
                    );
                    false
                }
            },
            None => {
                tracing::warn!(name = %self.config.name, "save_known_hosts outside connected window");
                false
            }
        }
    }

    /// Register a channel with the live set.
    pub fn register_channel(&mut self, channel: &Arc<dyn SshChannel>) {
        self.registry.register(channel);
    }

    /// Unregister a channel.
    ///
    /// When the last channel leaves during DisconnectingChannel, the teardown
    /// advances to DisconnectingSession.
    pub fn unregister_channel(&mut self, id: ChannelId, actions: &mut Vec<Action>) {
        self.registry.unregister(id);

        if self.state == SshState::DisconnectingChannel && self.registry.is_empty() {
            tracing::debug!(name = %self.config.name, "no more channels registered");
            actions.push(Action::StopKeepalive);
            self.set_state(SshState::DisconnectingSession, actions);
            actions.push(Action::Requeue);
        }
    }

    // ------------------------------------------------------------------
    // Event processing
    // ------------------------------------------------------------------

    /// Process one event and return the side effects for the driver.
    pub fn process(&mut self, event: SessionEvent) -> Vec<Action> {
        let mut actions = Vec::new();
        match event {
            SessionEvent::TransportConnected => {
                if self.state == SshState::WaitingSocketConnection {
                    tracing::debug!(name = %self.config.name, "socket connected");
                    self.set_state(SshState::Initialize, &mut actions);
                    self.run_pass(&mut actions);
                } else {
                    self.fail("unexpected connection on socket", &mut actions);
                }
            }
            SessionEvent::TransportDisconnected => {
                if self.state != SshState::Unconnected {
                    tracing::debug!(name = %self.config.name, "socket disconnected");
                    self.transport = None;
                    self.set_state(SshState::FreeSession, &mut actions);
                    self.run_pass(&mut actions);
                }
            }
            SessionEvent::SocketError => {
                if self.state != SshState::Unconnected {
                    self.fail("socket error", &mut actions);
                }
            }
            SessionEvent::ConnectTimeout => {
                self.fail("connection timeout", &mut actions);
            }
            SessionEvent::KeepaliveTick => {
                self.keepalive_tick(&mut actions);
            }
            SessionEvent::Process | SessionEvent::Readable => {
                self.run_pass(&mut actions);
            }
        }
        actions
    }

    /// Run one processing pass, falling through consecutive states as long
    /// as each step completes synchronously. A would-block halts the pass.
    #[allow(clippy::too_many_lines)]
    fn run_pass(&mut self, actions: &mut Vec<Action>) {
        loop {
            match self.state {
                SshState::Unconnected | SshState::WaitingSocketConnection => {
                    tracing::warn!(name = %self.config.name, state = %self.state, "unexpected event");
                    return;
                }

                SshState::SocketConnection => {
                    actions.push(Action::StartConnectTimer(self.config.connect_timeout));
                    actions.push(Action::StartConnect {
                        host: self.hostname.clone(),
                        port: self.port,
                    });
                    self.set_state(SshState::WaitingSocketConnection, actions);
                    return;
                }

                SshState::Initialize => {
                    self.engine = Some((self.engine_factory)());

                    let mut store = KnownHostsStore::new();
                    if let Some(path) = self.config.known_hosts_file.clone() {
                        if let Err(e) = store.load(&path) {
                            tracing::warn!(
                                name = %self.config.name,
                                path = %path.display(),
                                error = %e,
                                "failed to load known_hosts file"
                            );
                        }
                    }
                    self.known_hosts = Some(store);

                    self.set_state(SshState::HandShake, actions);
                }

                SshState::HandShake => {
                    let Some((engine, io)) = engine_io(&mut self.engine, &mut self.transport)
                    else {
                        self.fail("handshake without engine or transport", actions);
                        return;
                    };
                    match engine.handshake(io) {
                        Ok(Step::WouldBlock) => return,
                        Err(e) => {
                            self.fail(&format!("handshake error: {e}"), actions);
                            return;
                        }
                        Ok(Step::Ready(host_key)) => {
                            if !self.accept_host_key(host_key, actions) {
                                return;
                            }
                            self.set_state(SshState::GetAuthenticationMethods, actions);
                        }
                    }
                }

                SshState::GetAuthenticationMethods => {
                    if self.auth_methods.is_empty() {
                        let user = self.username.clone();
                        let Some((engine, io)) = engine_io(&mut self.engine, &mut self.transport)
                        else {
                            self.fail("authentication without engine or transport", actions);
                            return;
                        };
                        match engine.list_auth_methods(io, &user) {
                            Ok(Step::WouldBlock) => return,
                            Err(e) => {
                                self.fail(&format!("failed to list authentication methods: {e}"), actions);
                                return;
                            }
                            Ok(Step::Ready(methods)) => {
                                tracing::debug!(
                                    name = %self.config.name,
                                    methods = ?methods,
                                    "server offered authentication methods"
                                );
                                self.auth_methods = methods.into();
                            }
                        }
                    }
                    self.set_state(SshState::Authentication, actions);
                }

                SshState::Authentication => {
                    if !self.run_authentication(actions) {
                        return;
                    }
                }

                SshState::Ready => {
                    self.last_proof_of_live = Instant::now();
                    actions.push(Action::Notify(Notification::DataAvailable));
                    return;
                }

                SshState::DisconnectingChannel => {
                    if self.registry.is_empty() {
                        self.set_state(SshState::DisconnectingSession, actions);
                    } else {
                        // Onward transition happens when the registry empties
                        // through unregister_channel, not here.
                        self.registry.close_all();
                        return;
                    }
                }

                SshState::DisconnectingSession => {
                    if let Some((engine, io)) = engine_io(&mut self.engine, &mut self.transport) {
                        match engine.disconnect(io, "good bye!") {
                            Ok(Step::WouldBlock) => return,
                            Ok(Step::Ready(())) => {}
                            Err(e) => {
                                tracing::warn!(
                                    name = %self.config.name,
                                    error = %e,
                                    "protocol disconnect failed"
                                );
                            }
                        }
                    }
                    if self.transport.as_ref().is_some_and(|t| t.is_connected()) {
                        actions.push(Action::CloseTransport);
                        return;
                    }
                    self.set_state(SshState::FreeSession, actions);
                }

                SshState::FreeSession => {
                    // Single-owner release: engine and store go exactly once,
                    // on every exit path.
                    self.known_hosts = None;
                    self.engine = None;
                    self.transport = None;
                    if !self.registry.is_empty() {
                        tracing::warn!(
                            name = %self.config.name,
                            channels = self.registry.len(),
                            "channels still registered at teardown, dropping membership"
                        );
                        self.registry = ChannelRegistry::new();
                    }
                    actions.push(Action::StopConnectTimer);
                    actions.push(Action::StopKeepalive);
                    actions.push(Action::Notify(Notification::Disconnected));
                    self.set_state(SshState::Unconnected, actions);
                    return;
                }

                SshState::Error => {
                    tracing::warn!(name = %self.config.name, "session in error state");
                    if self.transport.is_some() {
                        actions.push(Action::CloseTransport);
                    }
                    return;
                }
            }
        }
    }

    /// Capture the host key and consult the known-hosts store.
    ///
    /// Returns false when enforcement is on and the key mismatches.
    fn accept_host_key(&mut self, host_key: HostKey, actions: &mut Vec<Action>) -> bool {
        let check = self
            .known_hosts
            .as_ref()
            .map_or(KnownHostCheck::NotFound, |store| {
                store.check(&self.hostname, &host_key)
            });
        self.host_key = Some(host_key);
        self.host_key_check = Some(check);

        match check {
            KnownHostCheck::Match => {
                tracing::debug!(
                    name = %self.config.name,
                    host = %self.hostname,
                    "host key verified against known_hosts"
                );
            }
            KnownHostCheck::Mismatch => {
                tracing::error!(
                    name = %self.config.name,
                    host = %self.hostname,
                    "HOST KEY MISMATCH! Possible man-in-the-middle attack!"
                );
                if self.config.enforce_known_hosts {
                    self.fail("host key mismatch", actions);
                    return false;
                }
            }
            KnownHostCheck::NotFound => {
                tracing::warn!(
                    name = %self.config.name,
                    host = %self.hostname,
                    "host not found in known_hosts"
                );
            }
        }
        true
    }

    /// Try candidate authentication methods in list order.
    ///
    /// Returns false when the pass is suspended (would-block) or the session
    /// failed; returns true when the pass fell through to Ready.
    fn run_authentication(&mut self, actions: &mut Vec<Action>) -> bool {
        let user = self.username.clone();
        let keys = self.credentials.keys.clone();
        let passphrase = self.credentials.passphrase.clone();

        loop {
            let Some(method) = self.auth_methods.front().cloned() else {
                break;
            };
            let Some((engine, io)) = engine_io(&mut self.engine, &mut self.transport) else {
                self.fail("authentication without engine or transport", actions);
                return false;
            };

            let attempt = match method.as_str() {
                "publickey" => engine.auth_publickey(io, &user, &keys, &passphrase),
                "password" => engine.auth_password(io, &user, &passphrase),
                other => {
                    // Unrecognized methods never consume a would-block slot.
                    tracing::debug!(name = %self.config.name, method = %other, "skipping unsupported method");
                    self.auth_methods.pop_front();
                    continue;
                }
            };

            match attempt {
                // Suspend the whole pass; the candidate list is untouched.
                Ok(Step::WouldBlock) => return false,
                Ok(Step::Ready(AuthOutcome::Accepted)) => {
                    tracing::debug!(name = %self.config.name, method = %method, "authenticated");
                    break;
                }
                Ok(Step::Ready(AuthOutcome::Rejected)) => {
                    tracing::warn!(name = %self.config.name, method = %method, "authentication rejected");
                    self.auth_methods.pop_front();
                }
                Err(e) => {
                    tracing::warn!(
                        name = %self.config.name,
                        method = %method,
                        error = %e,
                        "authentication attempt failed"
                    );
                    self.auth_methods.pop_front();
                }
            }
        }

        let authenticated = self.engine.as_ref().is_some_and(|e| e.is_authenticated());
        if !authenticated {
            self.fail("authentication failed: all methods exhausted", actions);
            return false;
        }

        tracing::debug!(name = %self.config.name, user = %self.username, "connected and authenticated");
        actions.push(Action::StopConnectTimer);
        actions.push(Action::ArmKeepalive(self.config.keepalive.initial_delay));
        if let Some(engine) = self.engine.as_mut() {
            engine.configure_keepalive(true, self.config.keepalive.interval_secs);
        }
        self.set_state(SshState::Ready, actions);
        actions.push(Action::Notify(Notification::Ready));
        true
    }

    /// Run one keepalive probe.
    fn keepalive_tick(&mut self, actions: &mut Vec<Action>) {
        let Some((engine, io)) = engine_io(&mut self.engine, &mut self.transport) else {
            return;
        };

        match engine.send_keepalive(io) {
            Ok(Step::WouldBlock) => {
                actions.push(Action::ArmKeepalive(KEEPALIVE_RETRY));
            }
            Err(e) => {
                tracing::warn!(name = %self.config.name, error = %e, "connection I/O error");
                actions.push(Action::CloseTransport);
            }
            Ok(Step::Ready(advertised)) => {
                match self
                    .monitor
                    .evaluate(self.last_proof_of_live.elapsed(), advertised)
                {
                    KeepaliveVerdict::ConnectionLost => {
                        tracing::warn!(name = %self.config.name, "connection lost");
                        actions.push(Action::CloseTransport);
                    }
                    KeepaliveVerdict::Reschedule(delay) => {
                        actions.push(Action::ArmKeepalive(delay));
                    }
                }
            }
        }
    }

    /// Unrecoverable failure: force-disconnect and notify.
    fn fail(&mut self, reason: &str, actions: &mut Vec<Action>) {
        tracing::warn!(name = %self.config.name, state = %self.state, reason, "session error");
        self.set_state(SshState::Error, actions);
        actions.push(Action::CloseTransport);
        actions.push(Action::Notify(Notification::Error(reason.to_string())));
    }

    fn set_state(&mut self, state: SshState, actions: &mut Vec<Action>) {
        if self.state != state {
            tracing::debug!(
                name = %self.config.name,
                from = %self.state,
                to = %state,
                "state transition"
            );
            self.state = state;
            actions.push(Action::Notify(Notification::StateChanged(state)));
        }
    }
}

/// Borrow the engine and the transport together for one engine call.
fn engine_io<'a>(
    engine: &'a mut Option<Box<dyn ProtocolEngine>>,
    transport: &'a mut Option<Box<dyn TransportIo>>,
) -> Option<(&'a mut dyn ProtocolEngine, &'a mut dyn TransportIo)> {
    match (engine.as_mut(), transport.as_mut()) {
        (Some(engine), Some(transport)) => Some((engine.as_mut(), transport.as_mut())),
        _ => None,
    }
}
