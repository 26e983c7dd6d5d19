//! # aurum-sync
//!
//! The block-chain download engine for the Aurum ledger.
//!
//! This crate provides:
//! - The session coordinator that brings the local chain up to a remote head
//! - Common-ancestor discovery against the selected master peer
//! - Multi-peer parallel header and block fetching with per-height task slots
//! - In-order hand-off of recovered blocks to the chain writer

mod downloader;
mod error;
mod task;
mod worker;

pub use downloader::{Downloader, DownloaderEvent, SyncConfig, SyncStatus};
pub use error::{SyncError, SyncResult};
pub use task::{SlotStatus, TaskManager, TaskStats};

use std::time::Duration;

/// Amount of blocks to be fetched per retrieval request.
pub const MAX_BLOCK_FETCH: usize = 128;

/// Amount of block headers to be fetched per retrieval request.
pub const MAX_HEADER_FETCH: usize = 256;

/// Maximum chain reorganisation depth searched for a common ancestor.
pub const MAX_FORK_ANCESTRY: usize = 90_000;

/// How long an idle peer worker sleeps before asking for work again.
pub const PEER_IDLE_TIME: Duration = Duration::from_secs(1);
