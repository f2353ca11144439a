use std::{net::SocketAddr, sync::Arc};

use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::{
    output::OutputSink,
    protocol::{chat_line, is_blank, is_disconnect_sentinel, joined_line, left_line, scrub},
    registry::{BroadcastReport, PeerRegistry, PeerToken},
    transport::{LineReader, LineSender, LineTransport},
};

/// Shared pieces every server session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<PeerRegistry>,
    pub sink: Arc<dyn OutputSink>,
}

impl SessionContext {
    pub fn new(registry: Arc<PeerRegistry>, sink: Arc<dyn OutputSink>) -> Self {
        Self { registry, sink }
    }

    /// Shows `line` on the server's own output and fans it out to every peer.
    pub async fn announce(&self, line: &str) -> BroadcastReport {
        self.sink.append_line(line);
        self.registry.broadcast(line).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Active,
    Closing,
    Closed,
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The connection ended before an identity arrived; nothing was announced.
    HandshakeAborted,
    /// The client sent the disconnect sentinel.
    Left,
    /// End of stream, from the peer or from a local close.
    Closed,
    /// The transport failed mid-session.
    Failed,
}

/// Server side of one accepted connection.
pub struct ServerSession<R> {
    reader: LineReader<R>,
    sender: LineSender,
    context: SessionContext,
    peer: Option<SocketAddr>,
    state: SessionState,
    token: Option<PeerToken>,
}

impl<R> ServerSession<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(transport: LineTransport<R>, context: SessionContext) -> Self {
        let (reader, sender) = transport.into_parts();
        Self {
            reader,
            sender,
            context,
            peer: None,
            state: SessionState::Handshaking,
            token: None,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Closing this sender is how the session is told to stop.
    pub fn sender(&self) -> LineSender {
        self.sender.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run(mut self) -> SessionEnd {
        let Some(identity) = self.handshake().await else {
            self.sender.close().await;
            self.state = SessionState::Closed;
            return SessionEnd::HandshakeAborted;
        };

        self.activate(&identity).await;
        let end = self.relay(&identity).await;
        self.teardown(&identity).await;
        end
    }

    async fn handshake(&mut self) -> Option<String> {
        match self.reader.receive_line().await {
            Ok(Some(identity)) => Some(scrub(&identity)),
            Ok(None) => {
                debug!(peer = ?self.peer, "connection closed before handshake");
                None
            }
            Err(error) => {
                debug!(peer = ?self.peer, ?error, "handshake failed");
                None
            }
        }
    }

    async fn activate(&mut self, identity: &str) {
        let token = self
            .context
            .registry
            .register(identity, self.sender.clone())
            .await;
        self.token = Some(token);
        self.state = SessionState::Active;

        info!(peer = ?self.peer, %token, identity, "client joined");
        self.context.announce(&joined_line(identity)).await;
    }

    async fn relay(&mut self, identity: &str) -> SessionEnd {
        loop {
            let received = self
                .reader
                .receive_line()
                .await
                .map(|line| line.as_deref().map(scrub));
            match received {
                Ok(Some(line)) if is_disconnect_sentinel(&line) => return SessionEnd::Left,
                Ok(Some(line)) if is_blank(&line) => continue,
                Ok(Some(line)) => {
                    self.context.announce(&chat_line(identity, &line)).await;
                }
                Ok(None) => return SessionEnd::Closed,
                Err(error) => {
                    debug!(peer = ?self.peer, identity, ?error, "read failed");
                    return SessionEnd::Failed;
                }
            }
        }
    }

    /// Leaves the registry, closes the transport, and tells everyone else.
    /// Runs its body at most once.
    async fn teardown(&mut self, identity: &str) {
        let Some(token) = self.token.take() else {
            return;
        };
        self.state = SessionState::Closing;

        let removed = self.context.registry.unregister(token).await;
        self.sender.close().await;

        if removed.is_some() {
            info!(peer = ?self.peer, %token, identity, "client disconnected");
            self.context.announce(&left_line(identity)).await;
        }
        self.state = SessionState::Closed;
    }
}
