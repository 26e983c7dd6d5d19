//! Test harness: scripted peers and a recording chain.
//!
//! Provides an in-process network around a [`Downloader`]: scripted peers
//! answer requests from a fixed remote chain and feed responses back through
//! `deliver_message`, the way the real transport would.

use aurum_chain::{Block, Blockchain, ChainResult, ChainStore, Hash};
use aurum_network::{HashOrNumber, Message, NetworkResult, Peer, PeerId, TotalDifficulty};
use aurum_sync::{Downloader, SyncConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Install a test subscriber so `RUST_LOG`-style filtering works in tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A chain store that records every write in order.
pub struct RecordingChain {
    inner: Blockchain,
    writes: Mutex<Vec<u64>>,
}

impl RecordingChain {
    /// Build a chain holding the given local blocks (genesis first).
    pub fn new(local: &[Block]) -> Self {
        let inner = Blockchain::default();
        for block in &local[1..] {
            inner.write_block(block).expect("local chain links");
        }
        Self {
            inner,
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Heights handed to the writer, in call order.
    pub fn writes(&self) -> Vec<u64> {
        self.writes.lock().clone()
    }

    /// Current head height.
    pub fn height(&self) -> u64 {
        self.inner.height()
    }

    /// Current head hash.
    pub fn head_hash(&self) -> Hash {
        self.inner.current_block().hash()
    }
}

impl ChainStore for RecordingChain {
    fn current_block(&self) -> Block {
        self.inner.current_block()
    }

    fn get_block_hash(&self, height: u64) -> Option<Hash> {
        self.inner.get_block_hash(height)
    }

    fn write_block(&self, block: &Block) -> ChainResult<()> {
        self.writes.lock().push(block.header.height);
        self.inner.write_block(block)
    }
}

/// Behavior knobs for a scripted peer.
#[derive(Debug, Clone)]
pub struct PeerScript {
    /// Advertised total difficulty.
    pub td: TotalDifficulty,
    /// Delay before each response is delivered.
    pub response_delay: Duration,
    /// Break the hash linkage of header responses.
    pub corrupt_headers: bool,
    /// Never answer block requests.
    pub mute_blocks: bool,
    /// Answer reverse header requests with an empty run.
    pub empty_reverse_headers: bool,
    /// Answer head-hash probes with the genesis header.
    pub stale_head_probe: bool,
}

impl Default for PeerScript {
    fn default() -> Self {
        Self {
            td: 1_000,
            response_delay: Duration::from_millis(1),
            corrupt_headers: false,
            mute_blocks: false,
            empty_reverse_headers: false,
            stale_head_probe: false,
        }
    }
}

/// A peer that serves a fixed remote chain according to its script.
pub struct ScriptedPeer {
    id: PeerId,
    remote: Arc<Vec<Block>>,
    script: PeerScript,
    outbound: mpsc::UnboundedSender<(PeerId, Message)>,
    header_requests: AtomicUsize,
    reverse_header_requests: AtomicUsize,
}

impl ScriptedPeer {
    /// How many header requests this peer has seen.
    pub fn header_requests(&self) -> usize {
        self.header_requests.load(Ordering::Relaxed)
    }

    /// How many reverse header requests this peer has seen.
    pub fn reverse_header_requests(&self) -> usize {
        self.reverse_header_requests.load(Ordering::Relaxed)
    }

    /// The hash of the remote chain's tip.
    pub fn tip_hash(&self) -> Hash {
        self.remote.last().expect("remote chain is never empty").hash()
    }

    fn head_height(&self) -> u64 {
        self.remote.last().expect("remote chain is never empty").header.height
    }

    fn respond(&self, message: Message) {
        let tx = self.outbound.clone();
        let id = self.id.clone();
        let delay = self.script.response_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send((id, message));
        });
    }

    fn start_height(&self, start: HashOrNumber) -> Option<u64> {
        match start {
            HashOrNumber::Number(n) => Some(n),
            HashOrNumber::Hash(hash) => self
                .remote
                .iter()
                .position(|b| b.hash() == hash)
                .map(|i| i as u64),
        }
    }
}

impl Peer for ScriptedPeer {
    fn head(&self) -> (Hash, TotalDifficulty) {
        (self.tip_hash(), self.script.td)
    }

    fn request_headers(
        &self,
        start: HashOrNumber,
        count: u32,
        reverse: bool,
    ) -> NetworkResult<()> {
        self.header_requests.fetch_add(1, Ordering::Relaxed);
        if reverse {
            self.reverse_header_requests.fetch_add(1, Ordering::Relaxed);
            if self.script.empty_reverse_headers {
                self.respond(Message::BlockHeaders(Vec::new()));
                return Ok(());
            }
        }
        if self.script.stale_head_probe {
            if let HashOrNumber::Hash(_) = start {
                self.respond(Message::BlockHeaders(vec![self.remote[0].header.clone()]));
                return Ok(());
            }
        }

        let Some(start_height) = self.start_height(start) else {
            // Unknown hash: no response, the requester times out or cancels.
            return Ok(());
        };

        let mut headers = Vec::new();
        if reverse {
            let mut height = start_height.min(self.head_height());
            for _ in 0..count {
                headers.push(self.remote[height as usize].header.clone());
                if height == 0 {
                    break;
                }
                height -= 1;
            }
        } else {
            let end = (start_height + count as u64 - 1).min(self.head_height());
            for height in start_height..=end {
                headers.push(self.remote[height as usize].header.clone());
            }
        }

        if self.script.corrupt_headers && headers.len() >= 2 {
            headers[1].parent_hash = Hash::ZERO;
        }

        self.respond(Message::BlockHeaders(headers));
        Ok(())
    }

    fn request_blocks(&self, start: HashOrNumber, count: u32) -> NetworkResult<()> {
        if self.script.mute_blocks {
            return Ok(());
        }
        let Some(start_height) = self.start_height(start) else {
            return Ok(());
        };

        let end = (start_height + count as u64 - 1).min(self.head_height());
        let heights: Vec<u64> = (start_height..=end).collect();
        let blocks: Vec<Block> = heights
            .iter()
            .map(|h| self.remote[*h as usize].clone())
            .collect();

        self.respond(Message::BlocksPre(heights));
        self.respond(Message::Blocks(blocks));
        Ok(())
    }
}

/// An in-process network of scripted peers around one downloader.
pub struct TestNet {
    /// The downloader under test.
    pub downloader: Arc<Downloader>,
    /// The local chain, recording writer calls.
    pub chain: Arc<RecordingChain>,
    outbound: mpsc::UnboundedSender<(PeerId, Message)>,
}

impl TestNet {
    /// Build a net over a local chain with fast idle ticks.
    pub fn new(local: &[Block]) -> Self {
        Self::with_config(
            local,
            SyncConfig {
                peer_idle: Duration::from_millis(10),
                ..SyncConfig::default()
            },
        )
    }

    /// Build a net with explicit sync configuration.
    pub fn with_config(local: &[Block], config: SyncConfig) -> Self {
        let chain = Arc::new(RecordingChain::new(local));
        let downloader = Arc::new(Downloader::with_config(chain.clone(), config));

        let (outbound, mut rx) = mpsc::unbounded_channel::<(PeerId, Message)>();
        let pump = downloader.clone();
        tokio::spawn(async move {
            while let Some((peer_id, message)) = rx.recv().await {
                pump.deliver_message(&peer_id, message);
            }
        });

        Self {
            downloader,
            chain,
            outbound,
        }
    }

    /// Register a scripted peer serving `remote`.
    pub fn add_peer(
        &self,
        name: &str,
        remote: Arc<Vec<Block>>,
        script: PeerScript,
    ) -> (PeerId, Arc<ScriptedPeer>) {
        let id = PeerId::new(name);
        let peer = Arc::new(ScriptedPeer {
            id: id.clone(),
            remote,
            script,
            outbound: self.outbound.clone(),
            header_requests: AtomicUsize::new(0),
            reverse_header_requests: AtomicUsize::new(0),
        });
        self.downloader.register_peer(id.clone(), peer.clone());
        (id, peer)
    }
}
