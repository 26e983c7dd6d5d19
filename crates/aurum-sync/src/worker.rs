//! Per-peer download worker.

use crate::{SyncError, SyncResult, TaskManager};
use aurum_network::{HashOrNumber, Message, MessageKind, PeerConnection, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Drives one peer through the request/response loop for one session.
///
/// The worker pulls work from the task manager, issues requests on its peer
/// connection and feeds the responses back. Any request, wait or delivery
/// error ends this worker only; the master worker's exit additionally
/// cancels the session.
pub(crate) struct PeerWorker {
    conn: Arc<PeerConnection>,
    tasks: Arc<TaskManager>,
    cancel: CancellationToken,
    idle: Duration,
    is_master: bool,
}

impl PeerWorker {
    pub(crate) fn new(
        conn: Arc<PeerConnection>,
        tasks: Arc<TaskManager>,
        cancel: CancellationToken,
        idle: Duration,
        is_master: bool,
    ) -> Self {
        Self {
            conn,
            tasks,
            cancel,
            idle,
            is_master,
        }
    }

    /// Run the worker to completion.
    pub(crate) async fn run(self) {
        debug!(peer = %self.conn.peer_id(), master = self.is_master, "Peer worker started");

        if let Err(error) = self.download().await {
            if let SyncError::Network(network_error) = &error {
                self.conn.set_last_error(network_error);
            }
            info!(peer = %self.conn.peer_id(), %error, "Peer worker stopped");
        }

        self.tasks.on_peer_quit(self.conn.peer_id());
        if self.is_master {
            // The master's liveness defines the session.
            self.cancel.cancel();
        }
        debug!(peer = %self.conn.peer_id(), "Peer worker finished");
    }

    async fn download(&self) -> SyncResult<()> {
        let peer_id = self.conn.peer_id().clone();

        while !self.tasks.is_done() {
            let mut has_work = false;

            if let Some((start, count)) = self.tasks.get_header_request(&peer_id) {
                has_work = true;
                self.fetch_headers(&peer_id, start, count).await?;
            }

            if let Some((start, count)) = self.tasks.get_block_request(&peer_id)? {
                has_work = true;
                self.fetch_blocks(&peer_id, start, count).await?;
            }

            if has_work {
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.conn.quit().cancelled() => break,
                _ = tokio::time::sleep(self.idle) => {}
            }
        }
        Ok(())
    }

    async fn fetch_headers(&self, peer_id: &PeerId, start: u64, count: u32) -> SyncResult<()> {
        debug!(peer = %peer_id, start, count, "Fetching headers");
        self.conn
            .peer()
            .request_headers(HashOrNumber::Number(start), count, false)?;

        let message = self.conn.wait(MessageKind::BlockHeaders, &self.cancel).await?;
        let Message::BlockHeaders(headers) = message else {
            return Err(SyncError::InvalidPacket);
        };
        self.tasks.deliver_headers(peer_id, headers)
    }

    async fn fetch_blocks(&self, peer_id: &PeerId, start: u64, count: u32) -> SyncResult<()> {
        debug!(peer = %peer_id, start, count, "Fetching blocks");
        self.conn
            .peer()
            .request_blocks(HashOrNumber::Number(start), count)?;

        let message = self.conn.wait(MessageKind::BlocksPre, &self.cancel).await?;
        let Message::BlocksPre(heights) = message else {
            return Err(SyncError::InvalidPacket);
        };
        self.tasks.deliver_block_pre(peer_id, heights);

        let message = self.conn.wait(MessageKind::Blocks, &self.cancel).await?;
        let Message::Blocks(blocks) = message else {
            return Err(SyncError::InvalidPacket);
        };
        self.tasks.deliver_blocks(peer_id, blocks)
    }
}
