use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use futures::future::join_all;
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, warn};

use crate::{error::ChatError, transport::LineSender};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle returned by [`PeerRegistry::register`], used to leave again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerToken(u64);

impl fmt::Display for PeerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// The set of handshake-complete participants' write sides.
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerToken, PeerEntry>>,
    next_token: AtomicU64,
    write_timeout: Duration,
}

#[derive(Clone)]
struct PeerEntry {
    identity: String,
    sender: LineSender,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::with_write_timeout(DEFAULT_WRITE_TIMEOUT)
    }

    /// A delivery that takes longer than `write_timeout` counts as failed.
    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            write_timeout,
        }
    }

    /// Adds a transport. Registering the same transport twice returns the
    /// token it already has.
    pub async fn register(&self, identity: &str, sender: LineSender) -> PeerToken {
        let mut peers = self.peers.lock().await;

        if let Some((token, _)) = peers
            .iter()
            .find(|(_, entry)| entry.sender.same_transport(&sender))
        {
            return *token;
        }

        let token = PeerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        peers.insert(
            token,
            PeerEntry {
                identity: identity.to_string(),
                sender,
            },
        );
        token
    }

    /// Removes a transport, returning the identity it was registered under.
    /// Unknown or already removed tokens are a no-op.
    pub async fn unregister(&self, token: PeerToken) -> Option<String> {
        let mut peers = self.peers.lock().await;
        peers.remove(&token).map(|entry| entry.identity)
    }

    /// Sends `line` to every transport registered when the call starts.
    ///
    /// Deliveries run concurrently. A recipient that fails or stalls is closed,
    /// which wakes its own session so it unregisters itself; the other
    /// recipients are unaffected and the error is not returned.
    pub async fn broadcast(&self, line: &str) -> BroadcastReport {
        let recipients: Vec<(PeerToken, PeerEntry)> = {
            let peers = self.peers.lock().await;
            peers
                .iter()
                .map(|(token, entry)| (*token, entry.clone()))
                .collect()
        };

        let deliveries = recipients
            .iter()
            .map(|(token, entry)| self.deliver(*token, entry, line));
        let results = join_all(deliveries).await;

        let mut report = BroadcastReport::default();
        for delivered in results {
            if delivered {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    async fn deliver(&self, token: PeerToken, entry: &PeerEntry, line: &str) -> bool {
        let error = match timeout(self.write_timeout, entry.sender.send_line(line)).await {
            Ok(Ok(())) => return true,
            // The line itself is unsendable; the recipient did nothing wrong.
            Ok(Err(ChatError::InvalidLine)) => {
                warn!(
                    %token,
                    identity = %entry.identity,
                    "refusing to relay a multi-line message"
                );
                return false;
            }
            Ok(Err(error)) => error,
            Err(_) => ChatError::Transport(std::io::ErrorKind::TimedOut.into()),
        };

        match error {
            ChatError::Closed => {
                debug!(%token, identity = %entry.identity, "skipping closed recipient");
            }
            error => {
                warn!(%token, identity = %entry.identity, ?error, "failed to deliver line");
            }
        }
        entry.sender.close().await;
        false
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    /// Identities of everyone currently registered, sorted.
    pub async fn identities(&self) -> Vec<String> {
        let peers = self.peers.lock().await;
        let mut identities: Vec<String> =
            peers.values().map(|entry| entry.identity.clone()).collect();
        identities.sort();
        identities
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
