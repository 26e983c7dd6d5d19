//! Per-peer connection with kind-demultiplexed delivery.

use crate::{Message, MessageKind, NetworkError, NetworkResult, Peer, PeerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A connection to one remote peer.
///
/// Inbound messages are demultiplexed into per-kind mailboxes of depth one;
/// the request/response discipline is at most one outstanding request per
/// kind, so deeper buffering is never needed. Waiters are woken by delivery,
/// by session cancellation, or by [`PeerConnection::close`].
pub struct PeerConnection {
    peer_id: PeerId,
    peer: Arc<dyn Peer>,
    mailboxes: Mutex<HashMap<MessageKind, Message>>,
    last_error: Mutex<Option<String>>,
    notify: Notify,
    quit: CancellationToken,
}

impl PeerConnection {
    /// Wrap a peer handle.
    pub fn new(peer_id: PeerId, peer: Arc<dyn Peer>) -> Self {
        Self {
            peer_id,
            peer,
            mailboxes: Mutex::new(HashMap::new()),
            last_error: Mutex::new(None),
            notify: Notify::new(),
            quit: CancellationToken::new(),
        }
    }

    /// The peer's identifier.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// The underlying peer capability handle.
    pub fn peer(&self) -> &dyn Peer {
        self.peer.as_ref()
    }

    /// The quit signal, fired once when the connection closes.
    pub fn quit(&self) -> &CancellationToken {
        &self.quit
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.quit.is_cancelled()
    }

    /// Record the most recent failure observed on this connection.
    pub fn set_last_error(&self, error: &NetworkError) {
        *self.last_error.lock() = Some(error.to_string());
    }

    /// The most recent failure observed on this connection.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Deliver an inbound message from the transport.
    ///
    /// A message whose kind already holds an undrained mailbox entry is
    /// dropped; delivery on a closed connection is a no-op.
    pub fn deliver(&self, message: Message) {
        if self.is_closed() {
            debug!(peer = %self.peer_id, "Dropping delivery on closed connection");
            return;
        }
        let kind = message.kind();
        {
            let mut mailboxes = self.mailboxes.lock();
            if mailboxes.contains_key(&kind) {
                warn!(peer = %self.peer_id, ?kind, "Mailbox full, dropping message");
                return;
            }
            mailboxes.insert(kind, message);
        }
        self.notify.notify_waiters();
    }

    /// Wait for a message of `kind`.
    ///
    /// Returns [`NetworkError::Cancelled`] when the session cancel signal
    /// fires and [`NetworkError::PeerGone`] when the connection closes.
    /// Concurrent waits on distinct kinds are permitted.
    pub async fn wait(
        &self,
        kind: MessageKind,
        cancel: &CancellationToken,
    ) -> NetworkResult<Message> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            // Register before checking the mailbox so a concurrent delivery
            // cannot slip between the check and the await.
            notified.as_mut().enable();

            if let Some(message) = self.mailboxes.lock().remove(&kind) {
                return Ok(message);
            }
            if self.quit.is_cancelled() {
                return Err(NetworkError::PeerGone);
            }
            if cancel.is_cancelled() {
                return Err(NetworkError::Cancelled);
            }

            tokio::select! {
                _ = notified.as_mut() => {
                    notified.set(self.notify.notified());
                }
                _ = cancel.cancelled() => return Err(NetworkError::Cancelled),
                _ = self.quit.cancelled() => return Err(NetworkError::PeerGone),
            }
        }
    }

    /// Close the connection, unblocking all waiters with `PeerGone`.
    /// Idempotent.
    pub fn close(&self) {
        self.quit.cancel();
        self.mailboxes.lock().clear();
    }
}
