use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{oneshot, watch},
    task::{JoinError, JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    error::{ChatError, Result},
    output::OutputSink,
    protocol::SHUTDOWN_NOTICE,
    registry::PeerRegistry,
    session::{ServerSession, SessionContext, SessionEnd},
    transport::LineTransport,
};

// Pause after a failed accept so a persistent error (e.g. out of file
// descriptors) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts connections and runs one [`ServerSession`] per client.
pub struct ChatServer {
    listener: TcpListener,
    context: SessionContext,
}

impl ChatServer {
    pub async fn bind(config: &ServerConfig, sink: Arc<dyn OutputSink>) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|source| ChatError::Bind {
                addr: config.address(),
                source,
            })?;
        let registry = Arc::new(PeerRegistry::with_write_timeout(config.write_timeout));
        Ok(Self::new(listener, SessionContext::new(registry, sink)))
    }

    pub fn new(listener: TcpListener, context: SessionContext) -> Self {
        Self { listener, context }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.context.registry)
    }

    /// Serves until `shutdown` resolves, then closes the listener, stops every
    /// session (including ones still handshaking) and waits for their teardown.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let ChatServer { listener, context } = self;
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    if !handle_accept_result(accept_result, &context, &stop_rx, &mut sessions) {
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    reap_session(finished);
                }
            }
        }

        drop(listener);
        info!(sessions = sessions.len(), "server shutting down");
        context.announce(SHUTDOWN_NOTICE).await;

        let _ = stop_tx.send(true);
        while let Some(finished) = sessions.join_next().await {
            reap_session(finished);
        }
        info!("server stopped");
    }

    pub async fn run_until_ctrl_c(self) {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    /// Runs the server on its own task and returns a handle that can stop it.
    pub fn spawn(self) -> io::Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let registry = self.registry();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run_until(async move {
            let _ = stop_rx.await;
        }));

        Ok(ServerHandle {
            local_addr,
            registry,
            stop_tx,
            task,
        })
    }
}

/// Owner of a spawned [`ChatServer`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<PeerRegistry>,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Stops accepting, closes every session and waits until all are torn down.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(error) = self.task.await {
            warn!(?error, "server task failed");
        }
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    context: &SessionContext,
    stop: &watch::Receiver<bool>,
    sessions: &mut JoinSet<SessionEnd>,
) -> bool {
    match result {
        Ok((stream, peer)) => {
            spawn_session(stream, peer, context, stop, sessions);
            true
        }
        Err(err) => {
            warn!(error = ?err, "failed to accept connection");
            false
        }
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    context: &SessionContext,
    stop: &watch::Receiver<bool>,
    sessions: &mut JoinSet<SessionEnd>,
) {
    info!(%peer, "accepted connection");
    let session =
        ServerSession::new(LineTransport::from_tcp(stream), context.clone()).with_peer(peer);
    let mut stop = stop.clone();

    sessions.spawn(async move {
        let sender = session.sender();
        let run = session.run();
        tokio::pin!(run);

        select! {
            end = &mut run => return end,
            _ = stop_requested(&mut stop) => sender.close().await,
        }
        run.await
    });
}

fn reap_session(finished: std::result::Result<SessionEnd, JoinError>) {
    match finished {
        Ok(end) => debug!(?end, "session finished"),
        Err(error) => warn!(?error, "session task failed"),
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}
