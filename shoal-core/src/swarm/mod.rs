//! Swarm state machine: sessions, piece selection, choking and events.
//!
//! [`Swarm`] is the shared hub every connection task dispatches into. The
//! [`ChokeScheduler`] runs beside it and decides who gets uploads.

pub mod bitfield;
mod dispatch;
pub mod events;
pub mod scheduler;
pub mod session;
pub mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;
pub mod tracker;

pub use bitfield::Bitfield;
pub use events::{EventLog, EventRecord, EventSink, SwarmEvent, TracingEventSink};
pub use scheduler::{ChokeScheduler, NeighborSnapshot};
pub use session::{PeerSession, SessionState};
pub use state::{MAX_CONSECUTIVE_STORE_FAULTS, SessionHandle, Swarm, SwarmParams};
pub use tracker::PieceTracker;
