//! Per-height task slots and work dispatch for one sync session.

use crate::{SyncConfig, SyncError, SyncResult};
use aurum_chain::{Block, BlockHeader, ChainError, ChainStore};
use aurum_network::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle of one height's worth of work.
///
/// A slot only ever advances forward through these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// No header requested yet.
    Pending,
    /// A header request covering this height is outstanding.
    HeaderRequested,
    /// The header arrived and is stored in the slot.
    HeaderDelivered,
    /// A block request covering this height is outstanding.
    BlockRequested,
    /// The block arrived and awaits the writer cursor.
    BlockDelivered,
    /// The block was written to the chain.
    Processed,
}

/// One element of the fetch plan.
struct Slot {
    status: SlotStatus,
    header: Option<BlockHeader>,
    block: Option<Block>,
}

impl Slot {
    fn new() -> Self {
        Self {
            status: SlotStatus::Pending,
            header: None,
            block: None,
        }
    }
}

/// Outstanding work reserved by one peer.
#[derive(Debug, Default)]
struct Reservation {
    /// Reserved header range as `(start height, count)`.
    headers: Option<(u64, u32)>,
    /// Reserved block range as `(start height, count)`.
    blocks: Option<(u64, u32)>,
    /// Heights announced ahead of the next block delivery.
    announced: Option<Vec<u64>>,
}

/// Slot counts per status, for logging and assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Total slots in the plan.
    pub total: usize,
    /// Slots still waiting for a header request.
    pub pending: usize,
    /// Slots with an outstanding header request.
    pub header_requested: usize,
    /// Slots holding a delivered header.
    pub header_delivered: usize,
    /// Slots with an outstanding block request.
    pub block_requested: usize,
    /// Slots holding a delivered block.
    pub block_delivered: usize,
    /// Slots written to the chain.
    pub processed: usize,
}

struct TaskInner {
    slots: Vec<Slot>,
    /// Lowest height not yet written. Monotone within the session.
    cursor: u64,
    processed: usize,
    reservations: HashMap<PeerId, Reservation>,
    closed: bool,
}

/// Partitions the `[from, to]` block range into header and block fetch work,
/// assigns it to peers and feeds completed contiguous prefixes to the chain
/// writer.
///
/// All operations are safe to call from any worker concurrently; the internal
/// lock is the serialization point for slot state. Only the master peer's
/// deliveries and work pulls drain the writer cursor, which serialises chain
/// writes without a wider lock.
pub struct TaskManager {
    master: PeerId,
    from: u64,
    to: u64,
    chain: Arc<dyn ChainStore>,
    max_header_fetch: usize,
    max_block_fetch: usize,
    inner: Mutex<TaskInner>,
}

impl TaskManager {
    /// Build the fetch plan over `[from, to]`. An inverted range yields an
    /// empty plan that reports done immediately.
    pub fn new(
        master: PeerId,
        from: u64,
        to: u64,
        chain: Arc<dyn ChainStore>,
        config: &SyncConfig,
    ) -> Self {
        let total = if to >= from { (to - from + 1) as usize } else { 0 };
        info!(master = %master, from, to, slots = total, "Task manager created");
        Self {
            master,
            from,
            to,
            chain,
            max_header_fetch: config.max_header_fetch,
            max_block_fetch: config.max_block_fetch,
            inner: Mutex::new(TaskInner {
                slots: (0..total).map(|_| Slot::new()).collect(),
                cursor: from,
                processed: 0,
                reservations: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// True once every slot has been written to the chain.
    pub fn is_done(&self) -> bool {
        let inner = self.inner.lock();
        inner.processed == inner.slots.len()
    }

    /// Mark the manager terminal. Further work requests return empty and
    /// further deliveries are dropped.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        debug!(master = %self.master, "Task manager closed");
    }

    /// Slot counts per status.
    pub fn stats(&self) -> TaskStats {
        let inner = self.inner.lock();
        let mut stats = TaskStats {
            total: inner.slots.len(),
            ..TaskStats::default()
        };
        for slot in &inner.slots {
            match slot.status {
                SlotStatus::Pending => stats.pending += 1,
                SlotStatus::HeaderRequested => stats.header_requested += 1,
                SlotStatus::HeaderDelivered => stats.header_delivered += 1,
                SlotStatus::BlockRequested => stats.block_requested += 1,
                SlotStatus::BlockDelivered => stats.block_delivered += 1,
                SlotStatus::Processed => stats.processed += 1,
            }
        }
        stats
    }

    /// Reserve up to `max_header_fetch` contiguous pending heights for `peer`.
    ///
    /// Returns `(start height, count)`, or `None` when the peer already holds
    /// a header reservation or no header work is available.
    pub fn get_header_request(&self, peer: &PeerId) -> Option<(u64, u32)> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        if inner
            .reservations
            .get(peer)
            .is_some_and(|r| r.headers.is_some())
        {
            return None;
        }

        let base = (inner.cursor - self.from) as usize;
        let offset = inner.slots[base..]
            .iter()
            .position(|s| s.status == SlotStatus::Pending)?;
        let start_idx = base + offset;
        let end_idx = (start_idx + self.max_header_fetch).min(inner.slots.len());

        let mut count = 0u32;
        for idx in start_idx..end_idx {
            if inner.slots[idx].status != SlotStatus::Pending {
                break;
            }
            inner.slots[idx].status = SlotStatus::HeaderRequested;
            count += 1;
        }

        let start = self.from + start_idx as u64;
        inner
            .reservations
            .entry(peer.clone())
            .or_default()
            .headers = Some((start, count));
        debug!(peer = %peer, start, count, "Header range reserved");
        Some((start, count))
    }

    /// Accept a header run for `peer`'s outstanding header reservation.
    ///
    /// The run must start at the reserved height, be contiguous and
    /// hash-linked. On rejection the whole reservation reverts to `Pending`;
    /// on success the unfilled tail reverts.
    pub fn deliver_headers(&self, peer: &PeerId, headers: Vec<BlockHeader>) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        let Some((start, reserved)) = inner
            .reservations
            .get_mut(peer)
            .and_then(|r| r.headers.take())
        else {
            return Err(SyncError::InvalidPacket);
        };

        if headers.is_empty() || headers.len() > reserved as usize {
            self.revert_headers(&mut inner, start, reserved);
            return Err(SyncError::InvalidPacket);
        }
        for (i, header) in headers.iter().enumerate() {
            if header.height != start + i as u64 {
                self.revert_headers(&mut inner, start, reserved);
                return Err(SyncError::InvalidPacket);
            }
        }
        for pair in headers.windows(2) {
            if pair[1].parent_hash != pair[0].hash() {
                self.revert_headers(&mut inner, start, reserved);
                return Err(SyncError::HashMismatch);
            }
        }

        let delivered = headers.len();
        for header in headers {
            let idx = (header.height - self.from) as usize;
            let slot = &mut inner.slots[idx];
            if slot.status == SlotStatus::HeaderRequested {
                slot.header = Some(header);
                slot.status = SlotStatus::HeaderDelivered;
            }
            // A slot already past this phase keeps its state; the duplicate
            // is dropped.
        }

        // Short response: the unfilled tail goes back to the queue.
        self.revert_headers(&mut inner, start + delivered as u64, reserved - delivered as u32);

        debug!(peer = %peer, start, count = delivered, "Headers delivered");
        Ok(())
    }

    /// Reserve up to `max_block_fetch` contiguous header-delivered heights
    /// for `peer`.
    ///
    /// When `peer` is the master this also drains the processable prefix at
    /// the writer cursor, so block deliveries made by other peers are picked
    /// up on the master's next turn. A writer error is returned to the
    /// caller.
    pub fn get_block_request(&self, peer: &PeerId) -> SyncResult<Option<(u64, u32)>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(None);
        }
        if *peer == self.master {
            self.process_ready(&mut inner)?;
        }
        if inner
            .reservations
            .get(peer)
            .is_some_and(|r| r.blocks.is_some())
        {
            return Ok(None);
        }

        let base = (inner.cursor - self.from) as usize;
        let Some(offset) = inner.slots[base..]
            .iter()
            .position(|s| s.status == SlotStatus::HeaderDelivered)
        else {
            return Ok(None);
        };
        let start_idx = base + offset;
        let end_idx = (start_idx + self.max_block_fetch).min(inner.slots.len());

        let mut count = 0u32;
        for idx in start_idx..end_idx {
            if inner.slots[idx].status != SlotStatus::HeaderDelivered {
                break;
            }
            inner.slots[idx].status = SlotStatus::BlockRequested;
            count += 1;
        }

        let start = self.from + start_idx as u64;
        inner.reservations.entry(peer.clone()).or_default().blocks = Some((start, count));
        debug!(peer = %peer, start, count, "Block range reserved");
        Ok(Some((start, count)))
    }

    /// Record the heights `peer` is about to send, ahead of the block
    /// delivery. Advisory only.
    pub fn deliver_block_pre(&self, peer: &PeerId, heights: Vec<u64>) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if let Some(reservation) = inner.reservations.get_mut(peer) {
            if let Some((start, count)) = reservation.blocks {
                let in_range = heights
                    .iter()
                    .all(|h| *h >= start && *h < start + count as u64);
                if !in_range {
                    warn!(peer = %peer, start, count, "Announced heights outside reservation");
                }
            }
            reservation.announced = Some(heights);
        }
    }

    /// Accept a block run for `peer`'s outstanding block reservation.
    ///
    /// Every block must hash-match the header already stored in its slot. On
    /// rejection the reservation reverts to `HeaderDelivered`; on success the
    /// unfilled tail reverts. Master deliveries drain the writer cursor.
    pub fn deliver_blocks(&self, peer: &PeerId, blocks: Vec<Block>) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        let (start, reserved, announced) = {
            let Some(reservation) = inner.reservations.get_mut(peer) else {
                return Err(SyncError::InvalidPacket);
            };
            let Some((start, reserved)) = reservation.blocks.take() else {
                return Err(SyncError::InvalidPacket);
            };
            (start, reserved, reservation.announced.take())
        };

        if blocks.is_empty() || blocks.len() > reserved as usize {
            self.revert_blocks(&mut inner, start, reserved);
            return Err(SyncError::InvalidPacket);
        }
        if let Some(announced) = announced {
            if announced != blocks.iter().map(|b| b.header.height).collect::<Vec<_>>() {
                warn!(peer = %peer, "Block delivery deviates from announced heights");
            }
        }

        for block in blocks {
            let height = block.header.height;
            if height < start || height >= start + reserved as u64 {
                self.revert_blocks(&mut inner, start, reserved);
                return Err(SyncError::InvalidPacket);
            }
            let idx = (height - self.from) as usize;
            let slot = &mut inner.slots[idx];
            if slot.status != SlotStatus::BlockRequested {
                // Past this phase already; drop the duplicate.
                continue;
            }
            let expected = slot.header.as_ref().map(BlockHeader::hash);
            if expected != Some(block.header.hash()) {
                self.revert_blocks(&mut inner, start, reserved);
                return Err(SyncError::HashMismatch);
            }
            slot.block = Some(block);
            slot.status = SlotStatus::BlockDelivered;
        }

        // Short response: the unfilled tail goes back to the block queue.
        self.revert_blocks(&mut inner, start, reserved);

        if *peer == self.master {
            self.process_ready(&mut inner)?;
        }
        Ok(())
    }

    /// Revert everything reserved by a vanished peer.
    pub fn on_peer_quit(&self, peer: &PeerId) {
        let mut inner = self.inner.lock();
        if let Some(reservation) = inner.reservations.remove(peer) {
            if let Some((start, count)) = reservation.headers {
                self.revert_headers(&mut inner, start, count);
            }
            if let Some((start, count)) = reservation.blocks {
                self.revert_blocks(&mut inner, start, count);
            }
            debug!(peer = %peer, "Peer reservations reverted");
        }
    }

    /// Heights in `[start, start + count)` still marked `HeaderRequested` go
    /// back to `Pending`.
    fn revert_headers(&self, inner: &mut TaskInner, start: u64, count: u32) {
        for height in start..start + count as u64 {
            let idx = (height - self.from) as usize;
            if inner.slots[idx].status == SlotStatus::HeaderRequested {
                inner.slots[idx].status = SlotStatus::Pending;
            }
        }
    }

    /// Heights in `[start, start + count)` still marked `BlockRequested` go
    /// back to `HeaderDelivered`.
    fn revert_blocks(&self, inner: &mut TaskInner, start: u64, count: u32) {
        for height in start..start + count as u64 {
            let idx = (height - self.from) as usize;
            if inner.slots[idx].status == SlotStatus::BlockRequested {
                inner.slots[idx].status = SlotStatus::HeaderDelivered;
            }
        }
    }

    /// Hand the contiguous `BlockDelivered` prefix at the writer cursor to
    /// the chain, in ascending height order.
    fn process_ready(&self, inner: &mut TaskInner) -> SyncResult<()> {
        while inner.cursor <= self.to {
            let idx = (inner.cursor - self.from) as usize;
            if inner.slots[idx].status != SlotStatus::BlockDelivered {
                break;
            }
            let Some(block) = inner.slots[idx].block.take() else {
                break;
            };
            match self.chain.write_block(&block) {
                Ok(()) => {}
                Err(ChainError::AlreadyExists) => {
                    debug!(height = inner.cursor, "Block already known to chain");
                }
                Err(error) => {
                    // Leave the slot delivered so state stays consistent; the
                    // session is torn down by the caller.
                    inner.slots[idx].block = Some(block);
                    return Err(error.into());
                }
            }
            inner.slots[idx].status = SlotStatus::Processed;
            inner.processed += 1;
            inner.cursor += 1;
            debug!(height = inner.cursor - 1, "Block processed");
        }
        Ok(())
    }
}
