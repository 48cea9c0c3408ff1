//! Test helpers: in-memory swarms, a recording event sink and outbox draining

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;

use super::events::{EventLog, EventRecord, EventSink, SwarmEvent};
use super::state::{Swarm, SwarmParams};
use crate::storage::{MemoryPieceStore, PieceLayout, PieceStore, StorageError};
use crate::wire::{PeerId, PeerMessage, PieceIndex};

/// Event sink that keeps every record for later assertions.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    records: Mutex<Vec<EventRecord>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record so far, in emission order.
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().clone()
    }

    /// Events without their stamps.
    pub fn events(&self) -> Vec<SwarmEvent> {
        self.records.lock().iter().map(|r| r.event.clone()).collect()
    }

    pub fn contains(&self, predicate: impl Fn(&SwarmEvent) -> bool) -> bool {
        self.records.lock().iter().any(|r| predicate(&r.event))
    }

    pub fn count(&self, predicate: impl Fn(&SwarmEvent) -> bool) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| predicate(&r.event))
            .count()
    }
}

impl EventSink for RecordingEventSink {
    fn record(&self, record: EventRecord) {
        self.records.lock().push(record);
    }
}

/// Piece store that serves reads from memory and fails every write.
#[derive(Debug)]
pub struct FailingPieceStore {
    inner: Arc<MemoryPieceStore>,
}

impl FailingPieceStore {
    pub fn new(inner: Arc<MemoryPieceStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl PieceStore for FailingPieceStore {
    async fn piece(&self, index: PieceIndex) -> Result<Bytes, StorageError> {
        self.inner.piece(index).await
    }

    async fn store_piece(&self, _index: PieceIndex, _data: Bytes) -> Result<(), StorageError> {
        Err(StorageError::Io(std::io::Error::other("injected write failure")))
    }

    fn has_piece(&self, index: PieceIndex) -> bool {
        self.inner.has_piece(index)
    }

    fn is_complete(&self) -> bool {
        self.inner.is_complete()
    }

    fn piece_count(&self) -> u32 {
        self.inner.piece_count()
    }
}

/// Deterministic file contents for a layout.
pub fn sample_contents(layout: PieceLayout) -> Vec<u8> {
    (0..layout.file_size()).map(|i| (i % 251) as u8).collect()
}

/// Collects every message currently queued in an outbox.
pub fn drain_outbox(outbox: &mut mpsc::UnboundedReceiver<PeerMessage>) -> Vec<PeerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = outbox.try_recv() {
        messages.push(message);
    }
    messages
}

/// Swarm over an in-memory store, with its events recorded.
pub struct TestSwarm {
    pub swarm: Arc<Swarm>,
    pub store: Arc<MemoryPieceStore>,
    pub sink: Arc<RecordingEventSink>,
    pub layout: PieceLayout,
    contents: Vec<u8>,
}

impl TestSwarm {
    /// Starts building a swarm for `local` with the given neighbors.
    pub fn builder(local: u32, neighbors: &[u32]) -> TestSwarmBuilder {
        TestSwarmBuilder {
            local,
            neighbors: neighbors.to_vec(),
            piece_count: 4,
            piece_size: 4,
            held: Vec::new(),
            complete: false,
            failing: false,
            seed: 0,
        }
    }

    /// Bytes of piece `index` in the sample file.
    pub fn piece_data(&self, index: u32) -> Bytes {
        let index = PieceIndex::new(index);
        let start = self.layout.piece_offset(index) as usize;
        let len = self
            .layout
            .piece_len(index)
            .expect("piece index within layout");
        Bytes::copy_from_slice(&self.contents[start..start + len])
    }

    /// The whole sample file.
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }
}

/// Builder for [`TestSwarm`].
pub struct TestSwarmBuilder {
    local: u32,
    neighbors: Vec<u32>,
    piece_count: u32,
    piece_size: u32,
    held: Vec<u32>,
    complete: bool,
    failing: bool,
    seed: u64,
}

impl TestSwarmBuilder {
    /// Number of pieces; the last one is one byte short when pieces are larger than a byte.
    pub fn pieces(mut self, piece_count: u32) -> Self {
        self.piece_count = piece_count;
        self
    }

    pub fn piece_size(mut self, piece_size: u32) -> Self {
        self.piece_size = piece_size;
        self
    }

    /// Pieces the local store starts with.
    pub fn held(mut self, held: &[u32]) -> Self {
        self.held = held.to_vec();
        self
    }

    /// Start with every piece.
    pub fn complete(mut self) -> Self {
        self.complete = true;
        self
    }

    /// Make every piece write fail.
    pub fn failing_store(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> TestSwarm {
        let short = u64::from(self.piece_size > 1);
        let file_size = u64::from(self.piece_count) * u64::from(self.piece_size) - short;
        let layout = PieceLayout::new(file_size, self.piece_size);
        let contents = sample_contents(layout);

        let held: Vec<PieceIndex> = if self.complete {
            (0..layout.piece_count()).map(PieceIndex::new).collect()
        } else {
            self.held.iter().copied().map(PieceIndex::new).collect()
        };
        let store = Arc::new(
            MemoryPieceStore::with_pieces(layout, &contents, &held).expect("valid test layout"),
        );
        let swarm_store: Arc<dyn PieceStore> = if self.failing {
            Arc::new(FailingPieceStore::new(Arc::clone(&store)))
        } else {
            store.clone()
        };

        let local_id = PeerId::new(self.local);
        let sink = Arc::new(RecordingEventSink::new());
        let swarm = Swarm::new(SwarmParams {
            local_id,
            neighbors: self.neighbors.iter().copied().map(PeerId::new).collect(),
            layout,
            store: swarm_store,
            events: EventLog::new(local_id, sink.clone()),
            rng: ChaCha8Rng::seed_from_u64(self.seed),
        });

        TestSwarm {
            swarm: Arc::new(swarm),
            store,
            sink,
            layout,
            contents,
        }
    }
}
