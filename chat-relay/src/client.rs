//! Client side of a chat connection.
//!
//! After the identity handshake the session runs two flows side by side:
//! the outbound flow drains lines queued through a [`ClientHandle`] into the
//! transport, and the inbound flow hands every received line to the
//! [`OutputSink`]. Whichever flow stops first closes the transport, which
//! stops the other one.

use std::{sync::Arc, time::Duration};

use tokio::{
    io::AsyncRead,
    net::{TcpStream, tcp::OwnedReadHalf},
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientConfig,
    error::{ChatError, Result},
    output::OutputSink,
    protocol::{CONNECTION_LOST, DISCONNECT_SENTINEL},
    transport::{LineReader, LineSender, LineTransport},
};

// Best-effort goodbye to a server that may already be gone.
const SENTINEL_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a session. Connecting happens inside [`ClientSession::connect`],
/// before any session or handle exists, so it has no state of its own here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Handshaking,
    Active,
    Disconnecting,
    Closed,
}

/// How a client session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEnd {
    /// The local user asked to leave.
    Left,
    /// The server went away or the connection broke.
    ConnectionLost,
}

enum Outbound {
    Line(String),
    Disconnect,
}

/// What an input adapter uses to drive a running session.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<ClientState>,
}

impl ClientHandle {
    /// Queues one line for the server.
    pub fn send(&self, line: impl Into<String>) -> Result<()> {
        let line = line.into();
        if line.contains(['\n', '\r']) {
            return Err(ChatError::InvalidLine);
        }
        self.commands
            .send(Outbound::Line(line))
            .map_err(|_| ChatError::Closed)
    }

    /// Sends the disconnect sentinel and ends the session.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Outbound::Disconnect);
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|state| *state == ClientState::Closed).await;
    }
}

pub struct ClientSession<R = OwnedReadHalf> {
    reader: LineReader<R>,
    sender: LineSender,
    sink: Arc<dyn OutputSink>,
    commands: mpsc::UnboundedReceiver<Outbound>,
    handle: ClientHandle,
    state: watch::Sender<ClientState>,
}

impl ClientSession<OwnedReadHalf> {
    /// Connects and announces the configured identity. Never retries.
    pub async fn connect(config: &ClientConfig, sink: Arc<dyn OutputSink>) -> Result<Self> {
        if config.identity.contains(['\n', '\r']) {
            return Err(ChatError::InvalidLine);
        }

        let addr = config.address();
        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|source| ChatError::Connect {
                addr: addr.clone(),
                source,
            })?;
        info!(%addr, "connected to server");

        Self::handshake(LineTransport::from_tcp(stream), &config.identity, sink).await
    }

    /// Connects, then runs the session on its own task.
    pub async fn spawn(
        config: &ClientConfig,
        sink: Arc<dyn OutputSink>,
    ) -> Result<(ClientHandle, JoinHandle<ClientEnd>)> {
        let session = Self::connect(config, sink).await?;
        let handle = session.handle();
        Ok((handle, tokio::spawn(session.run())))
    }
}

impl<R> ClientSession<R>
where
    R: AsyncRead + Unpin,
{
    /// Sends `identity` over an already connected transport.
    pub async fn handshake(
        transport: LineTransport<R>,
        identity: &str,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Self> {
        let (state, state_rx) = watch::channel(ClientState::Handshaking);
        let (reader, sender) = transport.into_parts();

        if let Err(error) = sender.send_line(identity).await {
            sender.close().await;
            return Err(error);
        }

        let (commands_tx, commands) = mpsc::unbounded_channel();
        state.send_replace(ClientState::Active);

        Ok(Self {
            reader,
            sender,
            sink,
            commands,
            handle: ClientHandle {
                commands: commands_tx,
                state: state_rx,
            },
            state,
        })
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Relays lines until the user leaves or the connection is lost.
    ///
    /// Dropping every [`ClientHandle`] counts as leaving.
    pub async fn run(self) -> ClientEnd {
        let ClientSession {
            mut reader,
            sender,
            sink,
            mut commands,
            handle,
            state,
        } = self;
        drop(handle);

        let (lost, ()) = tokio::join!(
            inbound_flow(&mut reader, &sender, sink.as_ref(), &state),
            outbound_flow(&mut commands, &sender, &state),
        );

        sender.close().await;
        state.send_replace(ClientState::Closed);

        if lost {
            ClientEnd::ConnectionLost
        } else {
            ClientEnd::Left
        }
    }
}

/// Returns whether the connection was lost rather than left on purpose.
async fn inbound_flow<R>(
    reader: &mut LineReader<R>,
    sender: &LineSender,
    sink: &dyn OutputSink,
    state: &watch::Sender<ClientState>,
) -> bool
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.receive_line().await {
            Ok(Some(line)) => sink.append_line(&line),
            Ok(None) => break,
            Err(error) => {
                debug!(?error, "inbound stream failed");
                break;
            }
        }
    }

    let leaving = *state.borrow() == ClientState::Disconnecting;
    if leaving {
        return false;
    }

    if !sender.is_closed() {
        let _ = timeout(SENTINEL_TIMEOUT, sender.send_line(DISCONNECT_SENTINEL)).await;
    }
    sink.append_line(CONNECTION_LOST);
    sender.close().await;
    true
}

async fn outbound_flow(
    commands: &mut mpsc::UnboundedReceiver<Outbound>,
    sender: &LineSender,
    state: &watch::Sender<ClientState>,
) {
    loop {
        let command = select! {
            _ = sender.closed() => return,
            command = commands.recv() => command,
        };

        match command {
            Some(Outbound::Line(line)) => match sender.send_line(&line).await {
                Ok(()) => {}
                Err(ChatError::InvalidLine) => {
                    warn!("dropping outgoing line containing a line terminator");
                }
                Err(error) => {
                    debug!(?error, "outbound send failed");
                    sender.close().await;
                    return;
                }
            },
            Some(Outbound::Disconnect) | None => {
                state.send_replace(ClientState::Disconnecting);
                if let Err(error) = sender.send_line(DISCONNECT_SENTINEL).await {
                    debug!(?error, "failed to send disconnect sentinel");
                }
                sender.close().await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{DuplexStream, ReadHalf};

    use super::*;

    type Remote = LineTransport<ReadHalf<DuplexStream>>;

    async fn session() -> (
        ClientSession<ReadHalf<DuplexStream>>,
        Remote,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (local, remote) = tokio::io::duplex(1024);
        let (sink, lines) = mpsc::unbounded_channel();
        let session =
            ClientSession::handshake(LineTransport::from_stream(local), "alice", Arc::new(sink))
                .await
                .expect("handshake");
        (session, LineTransport::from_stream(remote), lines)
    }

    async fn next_line(remote: &mut Remote) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), remote.receive_line())
            .await
            .expect("timed out waiting for line")
            .expect("read line")
    }

    #[tokio::test]
    async fn relays_both_directions_then_leaves_with_sentinel() {
        let (session, mut server, mut shown) = session().await;
        let handle = session.handle();
        assert_eq!(handle.state(), ClientState::Active);
        let running = tokio::spawn(session.run());

        assert_eq!(next_line(&mut server).await.as_deref(), Some("alice"));

        handle.send("hello").expect("queue");
        assert_eq!(next_line(&mut server).await.as_deref(), Some("hello"));

        server.send_line("alice: hello").await.expect("echo");
        assert_eq!(shown.recv().await.as_deref(), Some("alice: hello"));

        handle.disconnect();
        assert_eq!(next_line(&mut server).await.as_deref(), Some(DISCONNECT_SENTINEL));
        assert_eq!(running.await.expect("join"), ClientEnd::Left);
        assert_eq!(handle.state(), ClientState::Closed);

        // a local leave is not reported as a lost connection
        while let Ok(line) = shown.try_recv() {
            assert_ne!(line, CONNECTION_LOST);
        }
    }

    #[tokio::test]
    async fn server_hangup_reports_connection_lost() {
        let (session, mut server, mut shown) = session().await;
        let handle = session.handle();
        let running = tokio::spawn(session.run());

        assert_eq!(next_line(&mut server).await.as_deref(), Some("alice"));
        drop(server);

        assert_eq!(running.await.expect("join"), ClientEnd::ConnectionLost);
        assert_eq!(shown.recv().await.as_deref(), Some(CONNECTION_LOST));
        assert!(matches!(handle.send("anyone?"), Err(ChatError::Closed)));
        handle.closed().await;
    }

    #[tokio::test]
    async fn dropping_every_handle_leaves() {
        let (session, mut server, _shown) = session().await;
        let running = tokio::spawn(session.run());

        assert_eq!(next_line(&mut server).await.as_deref(), Some("alice"));
        assert_eq!(next_line(&mut server).await.as_deref(), Some(DISCONNECT_SENTINEL));
        assert_eq!(running.await.expect("join"), ClientEnd::Left);
    }

    #[tokio::test]
    async fn multi_line_input_is_refused() {
        let (session, _server, _shown) = session().await;
        let handle = session.handle();
        assert!(matches!(
            handle.send("one\ntwo"),
            Err(ChatError::InvalidLine)
        ));
    }
}
