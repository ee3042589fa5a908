//! Async session driver and the public client handle.
//!
//! The driver is a dedicated task with exclusive ownership of the
//! [`SessionCore`] and its protocol engine; nothing else ever touches them.
//! Callers interact through [`SshClient`], which sends commands over a
//! bounded channel and observes the session through a state watch and a
//! notification broadcast. The task multiplexes command arrival, socket
//! readiness, the TCP connect in flight, and the two timers, feeding each
//! wake-up into the core as an event and performing the actions it returns.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use super::state::{Action, Notification, SessionCore, SessionEvent, SshState};
use crate::arbiter::{ChannelCreationArbiter, ChannelId};
use crate::channel::SshChannel;
use crate::config::SessionConfig;
use crate::engine::{EngineFactory, HostKey};
use crate::error::{Result, SshError};
use crate::transport::TcpTransport;

/// Command channel depth; senders briefly backpressure past this.
const COMMAND_DEPTH: usize = 32;

/// Notification broadcast depth before slow subscribers lag.
const NOTIFY_DEPTH: usize = 64;

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

enum Command {
    Connect {
        user: String,
        host: String,
        port: u16,
        methods: Vec<String>,
        reply: oneshot::Sender<bool>,
    },
    Disconnect,
    SetPassphrase(String),
    SetKeys {
        public_key: String,
        private_key: String,
    },
    SetKnownHostsFile(PathBuf),
    AddKnownHost {
        hostname: String,
        key: HostKey,
        reply: oneshot::Sender<bool>,
    },
    SaveKnownHosts {
        path: PathBuf,
        reply: oneshot::Sender<bool>,
    },
    RegisterChannel(Arc<dyn SshChannel>),
    UnregisterChannel(ChannelId),
    Banner(oneshot::Sender<Option<String>>),
    HostKey(oneshot::Sender<Option<HostKey>>),
    Stream(oneshot::Sender<Option<Arc<TcpStream>>>),
}

/// Handle to a session driven by its own task.
///
/// Cheap to clone; the driver task stops once every handle is dropped,
/// tearing the session down first if it is still up.
#[derive(Clone)]
pub struct SshClient {
    name: String,
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<SshState>,
    notify_tx: broadcast::Sender<Notification>,
    arbiter: Arc<ChannelCreationArbiter>,
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("name", &self.name)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl SshClient {
    /// Spawn the driver task for a new, unconnected session.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(config: SessionConfig, engine_factory: EngineFactory) -> Self {
        let name = config.name.clone();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_DEPTH);
        let (state_tx, state_rx) = watch::channel(SshState::Unconnected);
        let (notify_tx, _) = broadcast::channel(NOTIFY_DEPTH);

        let driver = Driver {
            core: SessionCore::new(config, engine_factory),
            commands: command_rx,
            state_tx,
            notify_tx: notify_tx.clone(),
            events: VecDeque::new(),
            stream: None,
            connect_fut: None,
            connect_deadline: None,
            keepalive_deadline: None,
            closing: false,
        };
        tokio::spawn(driver.run());

        Self {
            name,
            commands: command_tx,
            state_rx,
            notify_tx,
            arbiter: Arc::new(ChannelCreationArbiter::new()),
        }
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SshState {
        *self.state_rx.borrow()
    }

    /// The channel creation arbiter shared by this session's channels.
    #[must_use]
    pub fn arbiter(&self) -> Arc<ChannelCreationArbiter> {
        Arc::clone(&self.arbiter)
    }

    /// Subscribe to session notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify_tx.subscribe()
    }

    /// Request a connection, asking the server for its authentication
    /// methods. Returns whether the request was accepted.
    pub async fn connect(&self, user: &str, host: &str, port: u16) -> Result<bool> {
        self.connect_with_methods(user, host, port, Vec::new()).await
    }

    /// Request a connection with an explicit candidate method list.
    pub async fn connect_with_methods(
        &self,
        user: &str,
        host: &str,
        port: u16,
        methods: Vec<String>,
    ) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Connect {
            user: user.to_string(),
            host: host.to_string(),
            port,
            methods,
            reply,
        })
        .await?;
        response
            .await
            .map_err(|_| SshError::session("session driver terminated"))
    }

    /// Request a graceful disconnect. No-op when unconnected.
    pub async fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect).await
    }

    /// Set the passphrase, also used as the password for `password`
    /// authentication.
    pub async fn set_passphrase(&self, passphrase: impl Into<String>) -> Result<()> {
        self.send(Command::SetPassphrase(passphrase.into())).await
    }

    /// Set in-memory key material for `publickey` authentication.
    pub async fn set_keys(
        &self,
        public_key: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Result<()> {
        self.send(Command::SetKeys {
            public_key: public_key.into(),
            private_key: private_key.into(),
        })
        .await
    }

    /// Set the known-hosts file loaded when a connection initializes.
    pub async fn set_known_hosts_file(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.send(Command::SetKnownHostsFile(path.into())).await
    }

    /// Trust `key` for `hostname` in the live store.
    pub async fn add_known_host(&self, hostname: &str, key: HostKey) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.send(Command::AddKnownHost {
            hostname: hostname.to_string(),
            key,
            reply,
        })
        .await?;
        response
            .await
            .map_err(|_| SshError::session("session driver terminated"))
    }

    /// Persist the live known-hosts store to `path`.
    pub async fn save_known_hosts(&self, path: impl Into<PathBuf>) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.send(Command::SaveKnownHosts {
            path: path.into(),
            reply,
        })
        .await?;
        response
            .await
            .map_err(|_| SshError::session("session driver terminated"))
    }

    /// Register a channel with the session's live set.
    pub async fn register_channel(&self, channel: Arc<dyn SshChannel>) -> Result<()> {
        self.send(Command::RegisterChannel(channel)).await
    }

    /// Unregister a channel from the live set.
    pub async fn unregister_channel(&self, id: ChannelId) -> Result<()> {
        self.send(Command::UnregisterChannel(id)).await
    }

    /// The server identification banner, once connected.
    pub async fn banner(&self) -> Result<Option<String>> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Banner(reply)).await?;
        response
            .await
            .map_err(|_| SshError::session("session driver terminated"))
    }

    /// The server host key captured by the last handshake.
    pub async fn host_key(&self) -> Result<Option<HostKey>> {
        let (reply, response) = oneshot::channel();
        self.send(Command::HostKey(reply)).await?;
        response
            .await
            .map_err(|_| SshError::session("session driver terminated"))
    }

    /// Wait until the session reaches `target`.
    ///
    /// Returns false as soon as the session enters the error state instead.
    pub async fn wait_for_state(&self, target: SshState) -> bool {
        let mut notifications = self.notify_tx.subscribe();
        let mut current = self.state();
        loop {
            if current == target {
                return true;
            }
            if current == SshState::Error {
                return false;
            }
            match notifications.recv().await {
                Ok(Notification::StateChanged(state)) => current = state,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => current = self.state(),
                Err(broadcast::error::RecvError::Closed) => return self.state() == target,
            }
        }
    }

    /// Wait until the socket can accept more outgoing bytes.
    ///
    /// Writes that reported would-block are flushable once this returns
    /// true. Returns true immediately when no transport is attached (there
    /// is nothing left to flush) and false when the deadline passes first.
    pub async fn wait_bytes_written(&self, timeout: Duration) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Stream(reply)).await?;
        let Some(stream) = response
            .await
            .map_err(|_| SshError::session("session driver terminated"))?
        else {
            return Ok(true);
        };
        match tokio::time::timeout(timeout, stream.writable()).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) | Err(_) => Ok(false),
        }
    }

    /// [`wait_for_state`](Self::wait_for_state) with a deadline.
    pub async fn wait_for_state_timeout(&self, target: SshState, timeout: Duration) -> Result<bool> {
        tokio::time::timeout(timeout, self.wait_for_state(target))
            .await
            .map_err(|_| SshError::timeout(timeout))
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SshError::session("session driver terminated"))
    }
}

enum Wake {
    Command(Option<Command>),
    Connected(io::Result<TcpStream>),
    Readable(io::Result<()>),
    ConnectTimeout,
    KeepaliveTick,
}

struct Driver {
    core: SessionCore,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<SshState>,
    notify_tx: broadcast::Sender<Notification>,
    events: VecDeque<SessionEvent>,
    stream: Option<Arc<TcpStream>>,
    connect_fut: Option<ConnectFuture>,
    connect_deadline: Option<Instant>,
    keepalive_deadline: Option<Instant>,
    closing: bool,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.drain_events();
            if self.closing && self.core.state() == SshState::Unconnected {
                break;
            }

            let commands = &mut self.commands;
            let connect_fut = &mut self.connect_fut;
            let has_connect = connect_fut.is_some();
            let stream = self.stream.clone();
            let connect_deadline = self.connect_deadline;
            let keepalive_deadline = self.keepalive_deadline;
            let closing = self.closing;

            let wake = tokio::select! {
                command = commands.recv(), if !closing => Wake::Command(command),
                result = poll_connect(connect_fut), if has_connect => Wake::Connected(result),
                result = wait_readable(stream.as_deref()), if stream.is_some() => {
                    Wake::Readable(result)
                }
                () = sleep_until_opt(connect_deadline), if connect_deadline.is_some() => {
                    Wake::ConnectTimeout
                }
                () = sleep_until_opt(keepalive_deadline), if keepalive_deadline.is_some() => {
                    Wake::KeepaliveTick
                }
            };

            match wake {
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Command(None) => self.begin_shutdown(),
                Wake::Connected(Ok(stream)) => {
                    let stream = Arc::new(stream);
                    self.connect_fut = None;
                    self.core
                        .attach_transport(Box::new(TcpTransport::new(Arc::clone(&stream))));
                    self.stream = Some(stream);
                    self.events.push_back(SessionEvent::TransportConnected);
                }
                Wake::Connected(Err(error)) => {
                    tracing::warn!(name = %self.core.name(), error = %error, "tcp connect failed");
                    self.connect_fut = None;
                    self.events.push_back(SessionEvent::SocketError);
                }
                Wake::Readable(Ok(())) => self.on_readable(),
                Wake::Readable(Err(error)) => {
                    tracing::warn!(name = %self.core.name(), error = %error, "socket error");
                    self.events.push_back(SessionEvent::SocketError);
                }
                Wake::ConnectTimeout => {
                    self.connect_deadline = None;
                    self.events.push_back(SessionEvent::ConnectTimeout);
                }
                Wake::KeepaliveTick => {
                    self.keepalive_deadline = None;
                    self.events.push_back(SessionEvent::KeepaliveTick);
                }
            }
        }
        tracing::debug!(name = %self.core.name(), "session driver stopped");
    }

    /// Stage readable bytes and translate peer close into a disconnect event.
    fn on_readable(&mut self) {
        match self.core.probe_transport() {
            Err(error) => {
                tracing::warn!(name = %self.core.name(), error = %error, "socket read error");
                self.events.push_back(SessionEvent::SocketError);
            }
            Ok(_) => {
                if self.core.transport_connected() {
                    self.events.push_back(SessionEvent::Readable);
                } else {
                    self.stream = None;
                    self.events.push_back(SessionEvent::TransportDisconnected);
                }
            }
        }
    }

    /// Every handle is gone: hard teardown, nobody is left to unregister
    /// channels or observe a graceful protocol goodbye.
    fn begin_shutdown(&mut self) {
        self.closing = true;
        if self.core.state() != SshState::Unconnected {
            tracing::debug!(name = %self.core.name(), "all handles dropped, tearing session down");
            self.connect_fut = None;
            self.stream = None;
            self.events.push_back(SessionEvent::TransportDisconnected);
        }
    }

    fn handle_command(&mut self, command: Command) {
        let mut actions = Vec::new();
        match command {
            Command::Connect {
                user,
                host,
                port,
                methods,
                reply,
            } => {
                let accepted = self
                    .core
                    .connect_to_host(&user, &host, port, methods, &mut actions);
                let _ = reply.send(accepted);
            }
            Command::Disconnect => self.core.disconnect_from_host(&mut actions),
            Command::SetPassphrase(passphrase) => self.core.set_passphrase(passphrase),
            Command::SetKeys {
                public_key,
                private_key,
            } => self.core.set_keys(public_key, private_key),
            Command::SetKnownHostsFile(path) => self.core.set_known_hosts_file(path),
            Command::AddKnownHost {
                hostname,
                key,
                reply,
            } => {
                let _ = reply.send(self.core.add_known_host(&hostname, &key));
            }
            Command::SaveKnownHosts { path, reply } => {
                let _ = reply.send(self.core.save_known_hosts(&path));
            }
            Command::RegisterChannel(channel) => self.core.register_channel(&channel),
            Command::UnregisterChannel(id) => self.core.unregister_channel(id, &mut actions),
            Command::Banner(reply) => {
                let _ = reply.send(self.core.banner());
            }
            Command::HostKey(reply) => {
                let _ = reply.send(self.core.host_key().cloned());
            }
            Command::Stream(reply) => {
                let _ = reply.send(self.stream.clone());
            }
        }
        self.apply_actions(actions);
    }

    fn drain_events(&mut self) {
        while let Some(event) = self.events.pop_front() {
            let actions = self.core.process(event);
            self.apply_actions(actions);
        }
    }

    fn apply_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::StartConnect { host, port } => {
                    tracing::debug!(name = %self.core.name(), host = %host, port, "connecting");
                    self.connect_fut = Some(Box::pin(TcpStream::connect((host, port))));
                }
                Action::StartConnectTimer(delay) => {
                    self.connect_deadline = Some(Instant::now() + delay);
                }
                Action::StopConnectTimer => self.connect_deadline = None,
                Action::ArmKeepalive(delay) => {
                    self.keepalive_deadline = Some(Instant::now() + delay);
                }
                Action::StopKeepalive => self.keepalive_deadline = None,
                Action::CloseTransport => {
                    self.connect_fut = None;
                    self.stream = None;
                    self.events.push_back(SessionEvent::TransportDisconnected);
                }
                Action::Requeue => self.events.push_back(SessionEvent::Process),
                Action::Notify(notification) => {
                    if let Notification::StateChanged(state) = &notification {
                        if *state == SshState::Unconnected {
                            // Nothing survives into the next connected window,
                            // including a TCP connect still in flight.
                            self.connect_fut = None;
                            self.stream = None;
                        }
                        self.state_tx.send_replace(*state);
                    }
                    let _ = self.notify_tx.send(notification);
                }
            }
        }
    }
}

async fn poll_connect(fut: &mut Option<ConnectFuture>) -> io::Result<TcpStream> {
    match fut.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn wait_readable(stream: Option<&TcpStream>) -> io::Result<()> {
    match stream {
        Some(stream) => stream.readable().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::test_utils::MockEngineHandle;

    const WAIT: Duration = Duration::from_secs(5);

    async fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn connects_and_disconnects_over_localhost() {
        let (listener, port) = local_listener().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let engine = MockEngineHandle::new();
        let client = SshClient::new(SessionConfig::new("test"), engine.factory());

        assert!(client.connect("user", "127.0.0.1", port).await.unwrap());
        assert!(
            client
                .wait_for_state_timeout(SshState::Ready, WAIT)
                .await
                .unwrap()
        );
        let _server = accept.await.unwrap();
        assert_eq!(engine.keepalive_config(), Some((true, 5)));

        client.disconnect().await.unwrap();
        assert!(
            client
                .wait_for_state_timeout(SshState::Unconnected, WAIT)
                .await
                .unwrap()
        );
        assert_eq!(engine.call_count("disconnect"), 1);
    }

    #[tokio::test]
    async fn second_connect_refused_until_disconnected() {
        let (listener, port) = local_listener().await;
        let _accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let engine = MockEngineHandle::new();
        let client = SshClient::new(SessionConfig::new("test"), engine.factory());

        assert!(client.connect("user", "127.0.0.1", port).await.unwrap());
        client
            .wait_for_state_timeout(SshState::Ready, WAIT)
            .await
            .unwrap();

        assert!(!client.connect("user", "127.0.0.1", port).await.unwrap());
    }

    #[tokio::test]
    async fn refused_tcp_connect_ends_in_error() {
        let (listener, port) = local_listener().await;
        drop(listener);

        let engine = MockEngineHandle::new();
        let client = SshClient::new(SessionConfig::new("test"), engine.factory());
        let mut notifications = client.subscribe();

        assert!(client.connect("user", "127.0.0.1", port).await.unwrap());
        let saw_error = tokio::time::timeout(WAIT, async {
            loop {
                match notifications.recv().await {
                    Ok(Notification::Error(_)) => break true,
                    Ok(_) => {}
                    Err(_) => break false,
                }
            }
        })
        .await
        .unwrap();
        assert!(saw_error);
        assert!(
            client
                .wait_for_state_timeout(SshState::Unconnected, WAIT)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn peer_close_tears_the_session_down() {
        let (listener, port) = local_listener().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let engine = MockEngineHandle::new();
        let client = SshClient::new(SessionConfig::new("test"), engine.factory());
        client.connect("user", "127.0.0.1", port).await.unwrap();
        client
            .wait_for_state_timeout(SshState::Ready, WAIT)
            .await
            .unwrap();

        let mut notifications = client.subscribe();
        let server = accept.await.unwrap();
        drop(server);

        let saw_disconnect = tokio::time::timeout(WAIT, async {
            loop {
                match notifications.recv().await {
                    Ok(Notification::Disconnected) => break true,
                    Ok(_) => {}
                    Err(_) => break false,
                }
            }
        })
        .await
        .unwrap();
        assert!(saw_disconnect);
        assert!(
            client
                .wait_for_state_timeout(SshState::Unconnected, WAIT)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn banner_surfaces_through_the_handle() {
        let (listener, port) = local_listener().await;
        let _accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let engine = MockEngineHandle::new();
        engine.set_banner("SSH-2.0-OpenSSH_9.6");
        let client = SshClient::new(SessionConfig::new("test"), engine.factory());

        assert_eq!(client.banner().await.unwrap(), None);

        client.connect("user", "127.0.0.1", port).await.unwrap();
        client
            .wait_for_state_timeout(SshState::Ready, WAIT)
            .await
            .unwrap();
        assert_eq!(
            client.banner().await.unwrap().as_deref(),
            Some("SSH-2.0-OpenSSH_9.6")
        );
    }

    fn bare_driver(
        engine: &MockEngineHandle,
    ) -> (Driver, broadcast::Receiver<Notification>) {
        let (_command_tx, command_rx) = mpsc::channel(COMMAND_DEPTH);
        let (state_tx, _state_rx) = watch::channel(SshState::Unconnected);
        let (notify_tx, notifications) = broadcast::channel(NOTIFY_DEPTH);
        let driver = Driver {
            core: SessionCore::new(SessionConfig::new("test"), engine.factory()),
            commands: command_rx,
            state_tx,
            notify_tx,
            events: VecDeque::new(),
            stream: None,
            connect_fut: None,
            connect_deadline: None,
            keepalive_deadline: None,
            closing: false,
        };
        (driver, notifications)
    }

    #[tokio::test]
    async fn pending_connect_is_dropped_when_teardown_races_it() {
        let engine = MockEngineHandle::new();
        let (mut driver, mut notifications) = bare_driver(&engine);

        // The connect future is created but never polled, so it stays
        // permanently in flight like a slow TCP handshake.
        let (reply, accepted) = oneshot::channel();
        driver.handle_command(Command::Connect {
            user: "user".to_string(),
            host: "203.0.113.1".to_string(),
            port: 22,
            methods: Vec::new(),
            reply,
        });
        driver.drain_events();
        assert!(accepted.await.unwrap());
        assert_eq!(driver.core.state(), SshState::WaitingSocketConnection);
        assert!(driver.connect_fut.is_some());
        assert!(driver.connect_deadline.is_some());

        driver.handle_command(Command::Disconnect);
        driver.drain_events();

        assert_eq!(driver.core.state(), SshState::Unconnected);
        assert!(driver.connect_fut.is_none());
        assert!(driver.connect_deadline.is_none());
        assert!(driver.stream.is_none());
        while let Ok(notification) = notifications.try_recv() {
            assert!(!matches!(notification, Notification::Error(_)));
        }
    }

    #[tokio::test]
    async fn wait_bytes_written_reports_a_flushable_socket() {
        let engine = MockEngineHandle::new();
        let client = SshClient::new(SessionConfig::new("test"), engine.factory());

        // Nothing attached, nothing to flush.
        assert!(client.wait_bytes_written(WAIT).await.unwrap());

        let (listener, port) = local_listener().await;
        let _accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        client.connect("user", "127.0.0.1", port).await.unwrap();
        client
            .wait_for_state_timeout(SshState::Ready, WAIT)
            .await
            .unwrap();

        // An idle connected socket is immediately writable.
        assert!(client.wait_bytes_written(WAIT).await.unwrap());
    }
}
