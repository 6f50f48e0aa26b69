//! The single persistent gateway connection of a session.
//!
//! [`TransportConnection`] owns a supervisor task that performs the handshake,
//! pumps frames in both directions and reconnects with backoff after
//! server-initiated disconnects.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::chatsync::retry::ReconnectPolicy;
use crate::chatsync::utils::lock;
use crate::error::{ChatSyncError, Result};
use crate::protocol::ClientCommand;
use crate::types::Credential;

pub mod websocket;

pub use websocket::WebSocketConnector;

/// One established bidirectional frame stream.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Next inbound frame; `None` once the remote side closed the stream.
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn close(&mut self) -> Result<()>;
}

/// Performs the authenticated handshake.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn Transport>>;
}

/// Outbound side of the connection as seen by room controllers and reporters.
pub trait CommandSink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Returns false when the command was dropped because the transport is not connected.
    fn send_command(&self, command: ClientCommand) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

enum PumpEnd {
    ClientClosed,
    ServerClosed(String),
}

struct Control {
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    close: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    inbound: mpsc::Sender<String>,
    runtime: Handle,
    control: Mutex<Control>,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        lock(&self.control).generation == generation
    }

    fn set_state(&self, generation: u64, next: ConnectionState) {
        if !self.is_current(generation) {
            return;
        }
        self.publish(next);
    }

    fn publish(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            tracing::debug!(
                target: "chatsync::transport::state",
                state = %next,
                "Connection state changed"
            );
        }
    }
}

#[derive(Clone)]
pub struct TransportConnection {
    inner: Arc<Inner>,
}

impl TransportConnection {
    /// Inbound text frames are forwarded to `inbound` in arrival order. The
    /// connection task runs on `runtime`, so `connect` works from any thread.
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        inbound: mpsc::Sender<String>,
        runtime: Handle,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                state,
                inbound,
                runtime,
                control: Mutex::new(Control {
                    generation: 0,
                    outbound: None,
                    close: None,
                    supervisor: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Starts connecting with `credential`.
    ///
    /// No-op for an empty credential or while connected or handshaking. From
    /// any other state, including `Error`, the attempt counter is reset.
    pub fn connect(&self, credential: Credential) {
        if credential.is_empty() {
            tracing::warn!(
                target: "chatsync::transport::connect",
                "Refusing to connect without a credential"
            );
            return;
        }

        let mut control = lock(&self.inner.control);
        let current = *self.inner.state.borrow();
        if matches!(
            current,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            tracing::debug!(
                target: "chatsync::transport::connect",
                state = %current,
                "Already connected or connecting, ignoring connect"
            );
            return;
        }

        if let Some(previous) = control.supervisor.take() {
            previous.abort();
        }
        control.generation += 1;
        control.outbound = None;
        let generation = control.generation;
        let (close_tx, close_rx) = oneshot::channel();
        control.close = Some(close_tx);
        // Published under the lock so a concurrent connect sees the handshake.
        self.inner.publish(ConnectionState::Connecting);

        let inner = self.inner.clone();
        control.supervisor = Some(self.inner.runtime.spawn(async move {
            supervise(inner, generation, credential, close_rx).await;
        }));
    }

    /// Client-initiated close. Never followed by an automatic reconnect.
    pub async fn disconnect(&self) {
        let (close, supervisor) = {
            let mut control = lock(&self.inner.control);
            control.generation += 1;
            control.outbound = None;
            (control.close.take(), control.supervisor.take())
        };

        if let Some(close) = close {
            let _ = close.send(());
        }

        if let Some(mut supervisor) = supervisor {
            let timeout = self.inner.policy.shutdown_timeout;
            if tokio::time::timeout(timeout, &mut supervisor).await.is_err() {
                tracing::warn!(
                    target: "chatsync::transport::disconnect",
                    "Connection did not close within {:?}, aborting",
                    timeout
                );
                supervisor.abort();
            }
        }

        self.inner.publish(ConnectionState::Disconnected);
        tracing::info!(
            target: "chatsync::transport::disconnect",
            "Disconnected by client"
        );
    }

    /// Queues `command` on the live connection.
    ///
    /// Fails with [`ChatSyncError::NotConnected`] unless the state is
    /// `Connected`. Nothing is buffered for later.
    pub fn send(&self, command: &ClientCommand) -> Result<()> {
        let outbound = {
            let control = lock(&self.inner.control);
            if self.state() != ConnectionState::Connected {
                None
            } else {
                control.outbound.clone()
            }
        };
        let outbound = outbound.ok_or(ChatSyncError::NotConnected)?;

        let frame = command.encode()?;
        outbound
            .send(frame)
            .map_err(|_| ChatSyncError::NotConnected)
    }

    /// Stops the supervisor without waiting for a graceful close.
    pub(crate) fn abort(&self) {
        let mut control = lock(&self.inner.control);
        control.generation += 1;
        control.outbound = None;
        control.close = None;
        if let Some(supervisor) = control.supervisor.take() {
            supervisor.abort();
        }
    }
}

impl CommandSink for TransportConnection {
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn send_command(&self, command: ClientCommand) -> bool {
        match self.send(&command) {
            Ok(()) => true,
            Err(ChatSyncError::NotConnected) => {
                tracing::warn!(
                    target: "chatsync::transport::send_command",
                    event = command.event_name(),
                    "Dropping command while not connected"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    target: "chatsync::transport::send_command",
                    event = command.event_name(),
                    "Failed to send command: {}",
                    e
                );
                false
            }
        }
    }
}

impl fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConnection")
            .field("state", &self.state())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

async fn supervise(
    inner: Arc<Inner>,
    generation: u64,
    credential: Credential,
    mut close_rx: oneshot::Receiver<()>,
) {
    let policy = inner.policy.clone();
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            inner.set_state(generation, ConnectionState::Reconnecting);
            let delay = policy.delay_for(attempt);
            tracing::info!(
                target: "chatsync::transport::supervise",
                attempt,
                max_attempts = policy.max_attempts,
                "Reconnecting in {:?}",
                delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut close_rx => {
                    inner.set_state(generation, ConnectionState::Disconnected);
                    return;
                }
            }
        }

        let handshake = tokio::select! {
            result = tokio::time::timeout(
                policy.handshake_timeout,
                inner.connector.connect(&credential),
            ) => result,
            _ = &mut close_rx => {
                inner.set_state(generation, ConnectionState::Disconnected);
                return;
            }
        };

        match handshake {
            Ok(Ok(transport)) => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                {
                    let mut control = lock(&inner.control);
                    if control.generation != generation {
                        return;
                    }
                    control.outbound = Some(outbound_tx);
                }
                attempt = 0;
                inner.set_state(generation, ConnectionState::Connected);
                tracing::info!(
                    target: "chatsync::transport::supervise",
                    "Connected"
                );

                let end = pump(&inner, transport, outbound_rx, &mut close_rx).await;

                {
                    let mut control = lock(&inner.control);
                    if control.generation == generation {
                        control.outbound = None;
                    }
                }

                match end {
                    PumpEnd::ClientClosed => {
                        inner.set_state(generation, ConnectionState::Disconnected);
                        return;
                    }
                    PumpEnd::ServerClosed(reason) => {
                        tracing::warn!(
                            target: "chatsync::transport::supervise",
                            "Connection lost: {}",
                            reason
                        );
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    target: "chatsync::transport::supervise",
                    attempt,
                    "Handshake failed: {}",
                    e
                );
            }
            Err(_) => {
                tracing::warn!(
                    target: "chatsync::transport::supervise",
                    attempt,
                    "Handshake timed out after {:?}",
                    policy.handshake_timeout
                );
            }
        }

        attempt += 1;
        if policy.is_exhausted(attempt) {
            tracing::error!(
                target: "chatsync::transport::supervise",
                "Giving up after {} reconnection attempts",
                policy.max_attempts
            );
            inner.set_state(generation, ConnectionState::Error);
            return;
        }
    }
}

async fn pump(
    inner: &Inner,
    mut transport: Box<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    close_rx: &mut oneshot::Receiver<()>,
) -> PumpEnd {
    loop {
        tokio::select! {
            _ = &mut *close_rx => {
                if let Err(e) = transport.close().await {
                    tracing::debug!(
                        target: "chatsync::transport::pump",
                        "Error while closing transport: {}",
                        e
                    );
                }
                return PumpEnd::ClientClosed;
            }
            Some(frame) = outbound.recv() => {
                if let Err(e) = transport.send(frame).await {
                    return PumpEnd::ServerClosed(format!("send failed: {}", e));
                }
            }
            incoming = transport.recv() => match incoming {
                Some(Ok(frame)) => {
                    if inner.inbound.send(frame).await.is_err() {
                        tracing::debug!(
                            target: "chatsync::transport::pump",
                            "Inbound receiver dropped, discarding frame"
                        );
                    }
                }
                Some(Err(e)) => return PumpEnd::ServerClosed(format!("receive failed: {}", e)),
                None => return PumpEnd::ServerClosed("closed by server".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatsync::test_utils::{MockConnector, ScriptedHandshake};
    use std::time::Duration;

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            handshake_timeout: Duration::from_millis(200),
            shutdown_timeout: Duration::from_millis(200),
        }
    }

    fn open(
        connector: &MockConnector,
        policy: ReconnectPolicy,
    ) -> (TransportConnection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        let connection =
            TransportConnection::new(Arc::new(connector.clone()), policy, tx, Handle::current());
        (connection, rx)
    }

    async fn wait_for_state(connection: &TransportConnection, expected: ConnectionState) {
        let mut rx = connection.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == expected))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", expected))
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_ignores_empty_credential() {
        let connector = MockConnector::new(vec![]);
        let (connection, _rx) = open(&connector, fast_policy());

        connection.connect(Credential::new(""));

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connector.handshakes(), 0);
    }

    #[tokio::test]
    async fn test_connect_forwards_inbound_frames() {
        let connector = MockConnector::new(vec![ScriptedHandshake::Accept]);
        let (connection, mut rx) = open(&connector, fast_policy());

        connection.connect(Credential::new("token"));
        wait_for_state(&connection, ConnectionState::Connected).await;

        connector.push_frame("hello");
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, "hello");
        assert_eq!(connector.last_credential().unwrap().expose(), "token");
    }

    #[tokio::test]
    async fn test_connect_is_noop_when_connected() {
        let connector = MockConnector::new(vec![ScriptedHandshake::Accept]);
        let (connection, _rx) = open(&connector, fast_policy());

        connection.connect(Credential::new("token"));
        wait_for_state(&connection, ConnectionState::Connected).await;
        connection.connect(Credential::new("token"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(connector.handshakes(), 1);
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let connector = MockConnector::new(vec![]);
        let (connection, _rx) = open(&connector, fast_policy());

        let sent = connection.send_command(ClientCommand::JoinChannel("c1".into()));
        assert!(!sent);
    }

    #[tokio::test]
    async fn test_send_reports_not_connected() {
        let connector = MockConnector::new(vec![]);
        let (connection, _rx) = open(&connector, fast_policy());

        let result = connection.send(&ClientCommand::LeaveChannel("c1".into()));
        assert!(matches!(result, Err(ChatSyncError::NotConnected)));
    }

    #[tokio::test]
    async fn test_send_while_connected_reaches_transport() {
        let connector = MockConnector::new(vec![ScriptedHandshake::Accept]);
        let (connection, _rx) = open(&connector, fast_policy());

        connection.connect(Credential::new("token"));
        wait_for_state(&connection, ConnectionState::Connected).await;

        assert!(connection.send_command(ClientCommand::JoinDm("d1".into())));
        let sent = connector.wait_for_sent(1).await;
        assert!(sent[0].contains("join-dm"));
    }

    #[tokio::test]
    async fn test_server_close_triggers_reconnect() {
        let connector =
            MockConnector::new(vec![ScriptedHandshake::Accept, ScriptedHandshake::Accept]);
        let (connection, _rx) = open(&connector, fast_policy());

        connection.connect(Credential::new("token"));
        wait_for_state(&connection, ConnectionState::Connected).await;

        connector.close_from_server();
        tokio::time::timeout(Duration::from_secs(2), async {
            while connector.handshakes() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        wait_for_state(&connection, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_reconnect_cap_ends_in_error() {
        let mut script = vec![ScriptedHandshake::Accept];
        script.extend(std::iter::repeat_n(ScriptedHandshake::Fail, 5));
        let connector = MockConnector::new(script);
        let (connection, _rx) = open(&connector, fast_policy());

        connection.connect(Credential::new("token"));
        wait_for_state(&connection, ConnectionState::Connected).await;
        connector.close_from_server();

        wait_for_state(&connection, ConnectionState::Error).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(connector.handshakes(), 6);
        assert_eq!(connection.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_manual_connect_recovers_from_error() {
        let mut script: Vec<ScriptedHandshake> =
            std::iter::repeat_n(ScriptedHandshake::Fail, 6).collect();
        script.push(ScriptedHandshake::Accept);
        let connector = MockConnector::new(script);
        let (connection, _rx) = open(&connector, fast_policy());

        connection.connect(Credential::new("token"));
        wait_for_state(&connection, ConnectionState::Error).await;

        connection.connect(Credential::new("token"));
        wait_for_state(&connection, ConnectionState::Connected).await;
        assert_eq!(connector.handshakes(), 7);
    }

    #[tokio::test]
    async fn test_client_disconnect_does_not_reconnect() {
        let connector =
            MockConnector::new(vec![ScriptedHandshake::Accept, ScriptedHandshake::Accept]);
        let (connection, _rx) = open(&connector, fast_policy());

        connection.connect(Credential::new("token"));
        wait_for_state(&connection, ConnectionState::Connected).await;

        connection.disconnect().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connector.handshakes(), 1);
        assert!(connector.was_closed_by_client());
    }

    #[tokio::test]
    async fn test_handshake_timeout_counts_as_attempt() {
        let connector =
            MockConnector::new(vec![ScriptedHandshake::Hang, ScriptedHandshake::Accept]);
        let policy = ReconnectPolicy {
            handshake_timeout: Duration::from_millis(20),
            ..fast_policy()
        };
        let (connection, _rx) = open(&connector, policy);

        connection.connect(Credential::new("token"));
        wait_for_state(&connection, ConnectionState::Connected).await;
        assert_eq!(connector.handshakes(), 2);
    }

    #[tokio::test]
    async fn test_hanging_handshakes_exhaust_the_cap() {
        let connector = MockConnector::new(vec![ScriptedHandshake::Hang; 3]);
        let policy = ReconnectPolicy {
            max_attempts: 2,
            handshake_timeout: Duration::from_millis(20),
            ..fast_policy()
        };
        let (connection, _rx) = open(&connector, policy);

        connection.connect(Credential::new("token"));
        wait_for_state(&connection, ConnectionState::Error).await;
        assert_eq!(connector.handshakes(), 3);
    }

    #[tokio::test]
    async fn test_connect_from_thread_without_runtime() {
        let connector = MockConnector::new(vec![ScriptedHandshake::Accept]);
        let (connection, _rx) = open(&connector, fast_policy());

        let remote = connection.clone();
        std::thread::spawn(move || remote.connect(Credential::new("token")))
            .join()
            .unwrap();

        wait_for_state(&connection, ConnectionState::Connected).await;
        assert_eq!(connector.handshakes(), 1);
    }
}
