//! Structured protocol events and the sinks that receive them

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::wire::{ConnectionDirection, PeerId, PieceIndex};

/// Protocol-level event observed or caused by the local peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    ConnectionEstablished {
        peer: PeerId,
        direction: ConnectionDirection,
    },
    HandshakeFailed {
        peer: Option<PeerId>,
        reason: String,
    },
    ConnectionClosed {
        peer: PeerId,
    },
    ChokeSent {
        peer: PeerId,
    },
    UnchokeSent {
        peer: PeerId,
    },
    ChokeReceived {
        peer: PeerId,
    },
    UnchokeReceived {
        peer: PeerId,
    },
    InterestedSent {
        peer: PeerId,
    },
    NotInterestedSent {
        peer: PeerId,
    },
    InterestedReceived {
        peer: PeerId,
    },
    NotInterestedReceived {
        peer: PeerId,
    },
    HaveReceived {
        peer: PeerId,
        piece: PieceIndex,
    },
    RequestSent {
        peer: PeerId,
        piece: PieceIndex,
    },
    PieceReceived {
        peer: PeerId,
        piece: PieceIndex,
        held: u32,
        total: u32,
    },
    PreferredNeighborsChanged {
        peers: Vec<PeerId>,
    },
    OptimisticNeighborChanged {
        peer: PeerId,
    },
    DownloadComplete,
    SwarmComplete,
}

/// Event stamped with the local peer and a per-process sequence number.
///
/// The sequence number is the logical timestamp: strictly increasing in the
/// order events were recorded, shared by every task in the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub sequence: u64,
    pub local: PeerId,
    pub event: SwarmEvent,
}

/// Destination for protocol events.
pub trait EventSink: Send + Sync {
    /// Receives one event; must not block on I/O for long.
    fn record(&self, record: EventRecord);
}

/// Stamps events and forwards them to a sink.
#[derive(Clone)]
pub struct EventLog {
    local: PeerId,
    sequence: Arc<AtomicU64>,
    sink: Arc<dyn EventSink>,
}

impl EventLog {
    pub fn new(local: PeerId, sink: Arc<dyn EventSink>) -> Self {
        Self {
            local,
            sequence: Arc::new(AtomicU64::new(0)),
            sink,
        }
    }

    /// Records an event with the next sequence number.
    pub fn emit(&self, event: SwarmEvent) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.sink.record(EventRecord {
            sequence,
            local: self.local,
            event,
        });
    }
}

/// Renders events as human-readable lines through `tracing`.
///
/// Lines go to the `shoal::events` target, so the file layer set up by
/// `tracing_setup` captures them as the peer's event log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, record: EventRecord) {
        let line = describe(&record);
        tracing::info!(target: "shoal::events", seq = record.sequence, "{line}");
    }
}

/// Human-readable description of an event.
pub fn describe(record: &EventRecord) -> String {
    let me = record.local;
    match &record.event {
        SwarmEvent::ConnectionEstablished {
            peer,
            direction: ConnectionDirection::Outbound,
        } => format!("Peer {me} makes a connection to Peer {peer}."),
        SwarmEvent::ConnectionEstablished {
            peer,
            direction: ConnectionDirection::Inbound,
        } => format!("Peer {me} is connected from Peer {peer}."),
        SwarmEvent::HandshakeFailed {
            peer: Some(peer),
            reason,
        } => format!("Peer {me} failed handshake with Peer {peer}: {reason}."),
        SwarmEvent::HandshakeFailed { peer: None, reason } => {
            format!("Peer {me} rejected an inbound handshake: {reason}.")
        }
        SwarmEvent::ConnectionClosed { peer } => {
            format!("Peer {me} closed the connection with Peer {peer}.")
        }
        SwarmEvent::ChokeSent { peer } => format!("Peer {me} chokes Peer {peer}."),
        SwarmEvent::UnchokeSent { peer } => format!("Peer {me} unchokes Peer {peer}."),
        SwarmEvent::ChokeReceived { peer } => format!("Peer {me} is choked by Peer {peer}."),
        SwarmEvent::UnchokeReceived { peer } => format!("Peer {me} is unchoked by Peer {peer}."),
        SwarmEvent::InterestedSent { peer } => {
            format!("Peer {me} sent the 'interested' message to Peer {peer}.")
        }
        SwarmEvent::NotInterestedSent { peer } => {
            format!("Peer {me} sent the 'not interested' message to Peer {peer}.")
        }
        SwarmEvent::InterestedReceived { peer } => {
            format!("Peer {me} received the 'interested' message from Peer {peer}.")
        }
        SwarmEvent::NotInterestedReceived { peer } => {
            format!("Peer {me} received the 'not interested' message from Peer {peer}.")
        }
        SwarmEvent::HaveReceived { peer, piece } => {
            format!("Peer {me} received the 'have' message from Peer {peer} for the piece {piece}.")
        }
        SwarmEvent::RequestSent { peer, piece } => {
            format!("Peer {me} requested the piece {piece} from Peer {peer}.")
        }
        SwarmEvent::PieceReceived {
            peer,
            piece,
            held,
            total,
        } => format!(
            "Peer {me} has downloaded the piece {piece} from Peer {peer}. \
             Now the number of pieces it has is {held} of {total}."
        ),
        SwarmEvent::PreferredNeighborsChanged { peers } => {
            let list: Vec<String> = peers.iter().map(ToString::to_string).collect();
            format!("Peer {me} has the preferred neighbors [{}].", list.join(", "))
        }
        SwarmEvent::OptimisticNeighborChanged { peer } => {
            format!("Peer {me} has the optimistically unchoked neighbor Peer {peer}.")
        }
        SwarmEvent::DownloadComplete => format!("Peer {me} has downloaded the complete file."),
        SwarmEvent::SwarmComplete => {
            format!("Peer {me} observed every peer holding the complete file.")
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<EventRecord>>);

    impl EventSink for CollectingSink {
        fn record(&self, record: EventRecord) {
            self.0.lock().push(record);
        }
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let sink = Arc::new(CollectingSink::default());
        let log = EventLog::new(PeerId::new(1001), sink.clone());

        log.emit(SwarmEvent::DownloadComplete);
        log.clone().emit(SwarmEvent::SwarmComplete);

        let records = sink.0.lock();
        assert_eq!(records[0].sequence, 0);
        assert_eq!(records[1].sequence, 1);
        assert_eq!(records[1].local, PeerId::new(1001));
    }

    #[test]
    fn test_describe_piece_received() {
        let record = EventRecord {
            sequence: 4,
            local: PeerId::new(1002),
            event: SwarmEvent::PieceReceived {
                peer: PeerId::new(1001),
                piece: PieceIndex::new(3),
                held: 2,
                total: 4,
            },
        };

        assert_eq!(
            describe(&record),
            "Peer 1002 has downloaded the piece 3 from Peer 1001. \
             Now the number of pieces it has is 2 of 4."
        );
    }

    #[test]
    fn test_describe_preferred_neighbors() {
        let record = EventRecord {
            sequence: 0,
            local: PeerId::new(1),
            event: SwarmEvent::PreferredNeighborsChanged {
                peers: vec![PeerId::new(2), PeerId::new(3)],
            },
        };
        assert_eq!(describe(&record), "Peer 1 has the preferred neighbors [2, 3].");
    }
}
