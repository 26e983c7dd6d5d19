//! Sync session coordinator.

use crate::worker::PeerWorker;
use crate::{
    SyncError, SyncResult, TaskManager, MAX_BLOCK_FETCH, MAX_FORK_ANCESTRY, MAX_HEADER_FETCH,
    PEER_IDLE_TIME,
};
use aurum_chain::{BlockHeader, ChainError, ChainStore, Hash};
use aurum_network::{
    HashOrNumber, Message, MessageKind, Peer, PeerConnection, PeerId, TotalDifficulty,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Headers per retrieval request.
    pub max_header_fetch: usize,
    /// Blocks per retrieval request.
    pub max_block_fetch: usize,
    /// Maximum reorganisation depth searched for a common ancestor.
    pub max_fork_ancestry: usize,
    /// Idle wait between work pulls on a starved peer.
    pub peer_idle: Duration,
    /// Buffered session lifecycle events.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_header_fetch: MAX_HEADER_FETCH,
            max_block_fetch: MAX_BLOCK_FETCH,
            max_fork_ancestry: MAX_FORK_ANCESTRY,
            peer_idle: PEER_IDLE_TIME,
            event_buffer: 16,
        }
    }
}

/// Session lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloaderEvent {
    /// A sync session entered.
    Started,
    /// A sync session completed with every slot processed.
    Done,
    /// A sync session ended in error.
    Failed,
}

/// Session status. A session exists iff the status is not `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No sync session.
    Idle,
    /// Session is probing the master peer.
    Preparing,
    /// Session is downloading.
    Fetching,
    /// Session is cleaning up.
    Cleaning,
}

struct DownloaderInner {
    peers: HashMap<PeerId, Arc<PeerConnection>>,
    status: SyncStatus,
    master: Option<PeerId>,
    cancel: Option<CancellationToken>,
    tasks: Option<Arc<TaskManager>>,
    tracker: Option<TaskTracker>,
    terminated: bool,
}

/// Synchronises the local chain with a remote head.
///
/// Owns the peer table and, while a session is active, the task manager. One
/// reader/writer lock protects both; no network waits happen under it.
pub struct Downloader {
    chain: Arc<dyn ChainStore>,
    config: SyncConfig,
    inner: RwLock<DownloaderInner>,
    events: broadcast::Sender<DownloaderEvent>,
}

impl Downloader {
    /// Create a downloader over the given chain.
    pub fn new(chain: Arc<dyn ChainStore>) -> Self {
        Self::with_config(chain, SyncConfig::default())
    }

    /// Create a downloader with explicit configuration.
    pub fn with_config(chain: Arc<dyn ChainStore>, config: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer);
        Self {
            chain,
            config,
            inner: RwLock::new(DownloaderInner {
                peers: HashMap::new(),
                status: SyncStatus::Idle,
                master: None,
                cancel: None,
                tasks: None,
                tracker: None,
                terminated: false,
            }),
            events,
        }
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloaderEvent> {
        self.events.subscribe()
    }

    /// Current session status.
    pub fn status(&self) -> SyncStatus {
        self.inner.read().status
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.inner.read().peers.len()
    }

    /// The most recent failure observed on a peer's connection.
    pub fn peer_last_error(&self, peer_id: &PeerId) -> Option<String> {
        self.inner
            .read()
            .peers
            .get(peer_id)
            .and_then(|conn| conn.last_error())
    }

    /// Add a peer to the table. If a session is fetching, a worker bound to
    /// the current task manager is spawned immediately.
    pub fn register_peer(&self, peer_id: PeerId, peer: Arc<dyn Peer>) {
        let conn = Arc::new(PeerConnection::new(peer_id.clone(), peer));
        let mut inner = self.inner.write();

        if let Some(old) = inner.peers.insert(peer_id.clone(), conn.clone()) {
            old.close();
        }
        info!(peer = %peer_id, "Peer registered");

        if inner.status == SyncStatus::Fetching {
            if let (Some(tasks), Some(cancel), Some(tracker), Some(master)) = (
                &inner.tasks,
                &inner.cancel,
                &inner.tracker,
                &inner.master,
            ) {
                debug!(peer = %peer_id, "Spawning worker for mid-session peer");
                let worker = PeerWorker::new(
                    conn,
                    tasks.clone(),
                    cancel.clone(),
                    self.config.peer_idle,
                    *master == peer_id,
                );
                tracker.spawn(worker.run());
            }
        }
    }

    /// Close and remove a peer connection. A worker bound to it observes the
    /// quit signal and exits.
    pub fn unregister_peer(&self, peer_id: &PeerId) {
        let conn = self.inner.write().peers.remove(peer_id);
        if let Some(conn) = conn {
            conn.close();
            info!(peer = %peer_id, last_error = ?conn.last_error(), "Peer unregistered");
        }
    }

    /// Route an inbound message to the peer's connection. No-op for unknown
    /// peers.
    pub fn deliver_message(&self, peer_id: &PeerId, message: Message) {
        // Clone the connection handle out of the table so delivery happens
        // outside the lock.
        let conn = self.inner.read().peers.get(peer_id).cloned();
        match conn {
            Some(conn) => conn.deliver(message),
            None => debug!(peer = %peer_id, "Message for unknown peer dropped"),
        }
    }

    /// Cancel the current session, if any. Idempotent.
    pub fn cancel(&self) {
        let cancel = self.inner.read().cancel.clone();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    /// Cancel and wait for every worker. The downloader is unusable
    /// afterward.
    pub async fn terminate(&self) {
        self.inner.write().terminated = true;
        self.cancel();
        let tracker = self.inner.read().tracker.clone();
        if let Some(tracker) = tracker {
            tracker.close();
            tracker.wait().await;
        }
        info!("Downloader terminated");
    }

    /// Synchronise with `master`, which advertises `head` at total difficulty
    /// `peer_td` against our `local_td`.
    ///
    /// Fails with [`SyncError::Busy`] while a session is active. Does not
    /// return until every spawned worker has exited.
    pub async fn synchronise(
        &self,
        master: &PeerId,
        head: Hash,
        peer_td: TotalDifficulty,
        local_td: TotalDifficulty,
    ) -> SyncResult<()> {
        let (conn, cancel, tracker) = {
            let mut inner = self.inner.write();
            if inner.terminated || inner.status != SyncStatus::Idle {
                return Err(SyncError::Busy);
            }
            let Some(conn) = inner.peers.get(master).cloned() else {
                return Err(SyncError::PeerNotFound(master.clone()));
            };
            inner.status = SyncStatus::Preparing;
            inner.master = Some(master.clone());
            let cancel = CancellationToken::new();
            inner.cancel = Some(cancel.clone());
            let tracker = TaskTracker::new();
            inner.tracker = Some(tracker.clone());
            (conn, cancel, tracker)
        };

        info!(master = %master, peer_td, local_td, "Sync session starting");
        let result = self
            .do_synchronise(&conn, head, local_td, &cancel, &tracker)
            .await;

        // Drain stragglers and clear the session.
        tracker.close();
        tracker.wait().await;
        {
            let mut inner = self.inner.write();
            inner.status = SyncStatus::Idle;
            inner.master = None;
            inner.cancel = None;
            inner.tasks = None;
            inner.tracker = None;
        }
        result
    }

    async fn do_synchronise(
        &self,
        conn: &Arc<PeerConnection>,
        head: Hash,
        local_td: TotalDifficulty,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) -> SyncResult<()> {
        let _ = self.events.send(DownloaderEvent::Started);

        let result = self.run_session(conn, head, local_td, cancel, tracker).await;
        match &result {
            Ok(()) => {
                info!("Sync session done");
                let _ = self.events.send(DownloaderEvent::Done);
            }
            Err(error) => {
                warn!(%error, "Sync session failed");
                let _ = self.events.send(DownloaderEvent::Failed);
            }
        }
        result
    }

    async fn run_session(
        &self,
        conn: &Arc<PeerConnection>,
        head: Hash,
        local_td: TotalDifficulty,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) -> SyncResult<()> {
        let latest = self.fetch_height(conn, head, cancel).await?;
        let height = latest.height;

        let ancestor = self.find_common_ancestor(conn, height, cancel).await?;
        info!(ancestor, target = height, "Common ancestor located");

        let tasks = Arc::new(TaskManager::new(
            conn.peer_id().clone(),
            ancestor + 1,
            height,
            self.chain.clone(),
            &self.config,
        ));

        {
            let mut inner = self.inner.write();
            inner.status = SyncStatus::Fetching;
            inner.tasks = Some(tasks.clone());
            for (peer_id, peer_conn) in &inner.peers {
                let (_, peer_td) = peer_conn.peer().head();
                if peer_td <= local_td {
                    debug!(peer = %peer_id, peer_td, "Peer not ahead, skipping");
                    continue;
                }
                let worker = PeerWorker::new(
                    peer_conn.clone(),
                    tasks.clone(),
                    cancel.clone(),
                    self.config.peer_idle,
                    peer_id == conn.peer_id(),
                );
                tracker.spawn(worker.run());
            }
        }

        tracker.close();
        tracker.wait().await;

        // Leave Fetching before the decisive wait so no further worker can be
        // spawned by a concurrent registration.
        {
            let mut inner = self.inner.write();
            inner.status = SyncStatus::Cleaning;
            inner.tasks = None;
        }
        tracker.wait().await;

        tasks.close();
        if tasks.is_done() {
            Ok(())
        } else {
            Err(SyncError::SyncAborted)
        }
    }

    /// Probe the master for the height of its advertised head.
    async fn fetch_height(
        &self,
        conn: &Arc<PeerConnection>,
        head: Hash,
        cancel: &CancellationToken,
    ) -> SyncResult<BlockHeader> {
        debug!(peer = %conn.peer_id(), head = %head, "Fetching remote height");
        conn.peer()
            .request_headers(HashOrNumber::Hash(head), 1, false)?;

        let message = conn.wait(MessageKind::BlockHeaders, cancel).await?;
        let Message::BlockHeaders(mut headers) = message else {
            return Err(SyncError::InvalidPacket);
        };
        if headers.len() != 1 {
            return Err(SyncError::InvalidPacket);
        }
        let header = headers.remove(0);
        if header.hash() != head {
            return Err(SyncError::HashMismatch);
        }
        Ok(header)
    }

    /// Walk the master's chain downward until a header hashes the same as the
    /// local block at that height.
    async fn find_common_ancestor(
        &self,
        conn: &Arc<PeerConnection>,
        height: u64,
        cancel: &CancellationToken,
    ) -> SyncResult<u64> {
        let local_height = self.chain.current_block().header.height;
        let top = local_height.min(height);
        if top == 0 {
            return Ok(0);
        }

        let max_fetch_ancestry = self.config.max_fork_ancestry.min(top as usize + 1);
        let mut compared = 0usize;
        loop {
            let fetch_count = max_fetch_ancestry
                .saturating_sub(compared)
                .min(self.config.max_header_fetch);
            if fetch_count == 0 {
                return Err(SyncError::ForkTooDeep);
            }
            let local_top = top - compared as u64;

            debug!(local_top, fetch_count, "Requesting ancestor headers");
            conn.peer()
                .request_headers(HashOrNumber::Number(local_top), fetch_count as u32, true)?;

            let message = conn.wait(MessageKind::BlockHeaders, cancel).await?;
            let Message::BlockHeaders(headers) = message else {
                return Err(SyncError::InvalidPacket);
            };
            if headers.is_empty() {
                return Err(SyncError::InvalidAncestor);
            }
            compared += headers.len();

            for header in &headers {
                let local_hash = self
                    .chain
                    .get_block_hash(header.height)
                    .ok_or(ChainError::NotFound(header.height))?;
                if local_hash == header.hash() {
                    return Ok(header.height);
                }
            }
        }
    }
}
