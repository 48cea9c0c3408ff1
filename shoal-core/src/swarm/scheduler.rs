//! Choke scheduler: preferred neighbors and the optimistic unchoke
//!
//! Two independent timers drive one task. Every unchoking interval the
//! interested neighbors are ranked by bytes received during the interval
//! and the top N are unchoked; every optimistic interval one more choked
//! but interested neighbor is unchoked at random.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::{IndexedRandom, SliceRandom};
use rand_chacha::ChaCha8Rng;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use super::events::SwarmEvent;
use super::session::SessionState;
use super::state::Swarm;
use crate::wire::{PeerId, PeerMessage};

/// What the scheduler needs to know about one neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborSnapshot {
    pub peer: PeerId,
    pub peer_interested: bool,
    pub am_choking: bool,
    pub downloaded: u64,
}

/// Ranks interested neighbors and returns the top `count`.
///
/// Ranking is by `downloaded` descending with random tie-breaks, or fully
/// random when `local_complete` is set.
pub fn select_preferred(
    snapshots: &[NeighborSnapshot],
    count: usize,
    local_complete: bool,
    rng: &mut ChaCha8Rng,
) -> BTreeSet<PeerId> {
    let mut candidates: Vec<&NeighborSnapshot> =
        snapshots.iter().filter(|n| n.peer_interested).collect();

    // Shuffle first so the stable sort breaks ties randomly
    candidates.shuffle(rng);
    if !local_complete {
        candidates.sort_by(|a, b| b.downloaded.cmp(&a.downloaded));
    }

    candidates.iter().take(count).map(|n| n.peer).collect()
}

/// Picks the next optimistic neighbor uniformly among interested, choked,
/// non-preferred neighbors.
pub fn select_optimistic(
    snapshots: &[NeighborSnapshot],
    preferred: &BTreeSet<PeerId>,
    rng: &mut ChaCha8Rng,
) -> Option<PeerId> {
    let candidates: Vec<PeerId> = snapshots
        .iter()
        .filter(|n| n.peer_interested && n.am_choking && !preferred.contains(&n.peer))
        .map(|n| n.peer)
        .collect();
    candidates.choose(rng).copied()
}

/// Periodically chooses which neighbors the local peer uploads to.
pub struct ChokeScheduler {
    swarm: Arc<Swarm>,
    preferred_count: usize,
    unchoking_interval: Duration,
    optimistic_interval: Duration,
    rng: ChaCha8Rng,
    preferred: BTreeSet<PeerId>,
    optimistic: Option<PeerId>,
}

impl ChokeScheduler {
    /// Creates a scheduler; both intervals must be non-zero.
    pub fn new(
        swarm: Arc<Swarm>,
        preferred_count: usize,
        unchoking_interval: Duration,
        optimistic_interval: Duration,
        rng: ChaCha8Rng,
    ) -> Self {
        assert!(!unchoking_interval.is_zero(), "unchoking interval must be positive");
        assert!(!optimistic_interval.is_zero(), "optimistic interval must be positive");
        Self {
            swarm,
            preferred_count,
            unchoking_interval,
            optimistic_interval,
            rng,
            preferred: BTreeSet::new(),
            optimistic: None,
        }
    }

    /// Current preferred neighbors.
    pub fn preferred(&self) -> &BTreeSet<PeerId> {
        &self.preferred
    }

    /// Current optimistically unchoked neighbor.
    pub fn optimistic(&self) -> Option<PeerId> {
        self.optimistic
    }

    /// Reads every session, resetting the per-interval counters when `reset` is set.
    fn snapshot(&self, reset: bool) -> Vec<NeighborSnapshot> {
        self.swarm
            .session_handles()
            .iter()
            .filter_map(|handle| {
                let mut session = handle.lock();
                if session.state() != SessionState::Connected {
                    return None;
                }
                let downloaded = if reset {
                    session.take_downloaded()
                } else {
                    session.downloaded_this_interval()
                };
                Some(NeighborSnapshot {
                    peer: session.remote_id(),
                    peer_interested: session.peer_interested(),
                    am_choking: session.am_choking(),
                    downloaded,
                })
            })
            .collect()
    }

    /// Recomputes the preferred set and applies the resulting chokes and
    /// unchokes, then tops up idle sessions with requests.
    pub fn recompute_preferred(&mut self) {
        let snapshots = self.snapshot(true);
        let local_complete = self.swarm.is_local_complete();
        let preferred = select_preferred(
            &snapshots,
            self.preferred_count,
            local_complete,
            &mut self.rng,
        );
        assert!(preferred.len() <= self.preferred_count);

        for handle in self.swarm.session_handles() {
            let mut session = handle.lock();
            if session.state() != SessionState::Connected {
                continue;
            }
            let peer = session.remote_id();
            if preferred.contains(&peer) {
                if session.am_choking() {
                    session.set_am_choking(false);
                    session.send(PeerMessage::Unchoke);
                    self.swarm.events.emit(SwarmEvent::UnchokeSent { peer });
                }
            } else if !session.am_choking() && self.optimistic != Some(peer) {
                session.set_am_choking(true);
                session.send(PeerMessage::Choke);
                self.swarm.events.emit(SwarmEvent::ChokeSent { peer });
            }
        }

        if preferred != self.preferred {
            tracing::debug!(?preferred, local_complete, "Preferred neighbors changed");
            self.swarm.events.emit(SwarmEvent::PreferredNeighborsChanged {
                peers: preferred.iter().copied().collect(),
            });
        }
        self.preferred = preferred;

        self.swarm.refill_requests();
    }

    /// Unchokes a new random neighbor and re-chokes the previous one.
    pub fn rotate_optimistic(&mut self) {
        let snapshots = self.snapshot(false);
        let Some(chosen) = select_optimistic(&snapshots, &self.preferred, &mut self.rng) else {
            return;
        };

        if let Some(handle) = self.swarm.session(chosen) {
            let mut session = handle.lock();
            session.set_am_choking(false);
            session.send(PeerMessage::Unchoke);
            self.swarm.events.emit(SwarmEvent::UnchokeSent { peer: chosen });
        }

        let previous = self.optimistic.replace(chosen);
        if let Some(previous) = previous.filter(|p| *p != chosen && !self.preferred.contains(p)) {
            if let Some(handle) = self.swarm.session(previous) {
                let mut session = handle.lock();
                if !session.am_choking() {
                    session.set_am_choking(true);
                    session.send(PeerMessage::Choke);
                    self.swarm.events.emit(SwarmEvent::ChokeSent { peer: previous });
                }
            }
        }

        tracing::debug!(peer = %chosen, ?previous, "Optimistic neighbor changed");
        self.swarm.events.emit(SwarmEvent::OptimisticNeighborChanged { peer: chosen });
    }

    /// Runs both timers until shutdown is signalled.
    ///
    /// Every unchoking tick also wakes the engine to re-check completion.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let start = Instant::now();
        let mut unchoking =
            tokio::time::interval_at(start + self.unchoking_interval, self.unchoking_interval);
        let mut optimistic = tokio::time::interval_at(start, self.optimistic_interval);
        unchoking.set_missed_tick_behavior(MissedTickBehavior::Delay);
        optimistic.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            preferred = self.preferred_count,
            unchoking_secs = self.unchoking_interval.as_secs_f64(),
            optimistic_secs = self.optimistic_interval.as_secs_f64(),
            "Choke scheduler started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = unchoking.tick() => {
                    self.recompute_preferred();
                    self.swarm.notify_changed();
                }
                _ = optimistic.tick() => {
                    self.rotate_optimistic();
                }
            }
        }

        tracing::debug!("Choke scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::swarm::test_support::{TestSwarm, drain_outbox};
    use crate::wire::ConnectionDirection;

    fn neighbor(peer: u32, downloaded: u64) -> NeighborSnapshot {
        NeighborSnapshot {
            peer: PeerId::new(peer),
            peer_interested: true,
            am_choking: true,
            downloaded,
        }
    }

    fn ids(peers: &[u32]) -> BTreeSet<PeerId> {
        peers.iter().copied().map(PeerId::new).collect()
    }

    #[test]
    fn test_preferred_by_download_rate() {
        let snapshots = [neighbor(2, 100), neighbor(3, 50), neighbor(4, 10)];
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let preferred = select_preferred(&snapshots, 2, false, &mut rng);
        assert_eq!(preferred, ids(&[2, 3]));

        let optimistic = select_optimistic(&snapshots, &preferred, &mut rng);
        assert_eq!(optimistic, Some(PeerId::new(4)));
    }

    #[test]
    fn test_preferred_skips_uninterested() {
        let mut snapshots = [neighbor(2, 100), neighbor(3, 50), neighbor(4, 10)];
        snapshots[0].peer_interested = false;
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let preferred = select_preferred(&snapshots, 2, false, &mut rng);
        assert_eq!(preferred, ids(&[3, 4]));
    }

    #[test]
    fn test_preferred_never_exceeds_count() {
        let snapshots: Vec<_> = (2..12).map(|peer| neighbor(peer, u64::from(peer))).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(9);

        for count in 0..12 {
            let preferred = select_preferred(&snapshots, count, false, &mut rng);
            assert_eq!(preferred.len(), count.min(snapshots.len()));
        }
    }

    #[test]
    fn test_complete_peer_ranks_randomly_but_reproducibly() {
        let snapshots: Vec<_> = (2..10)
            .map(|peer| neighbor(peer, 1000 - u64::from(peer)))
            .collect();

        let pick = |seed| {
            select_preferred(&snapshots, 3, true, &mut ChaCha8Rng::seed_from_u64(seed))
        };
        assert_eq!(pick(5), pick(5));

        let distinct: BTreeSet<_> = (0..20).map(pick).collect();
        assert!(distinct.len() > 1, "ranking ignored the RNG");
    }

    #[test]
    fn test_ties_broken_randomly() {
        let snapshots = [neighbor(2, 10), neighbor(3, 10), neighbor(4, 10)];
        let distinct: BTreeSet<_> = (0..20)
            .map(|seed| {
                select_preferred(&snapshots, 1, false, &mut ChaCha8Rng::seed_from_u64(seed))
            })
            .collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn test_optimistic_none_without_candidates() {
        let mut snapshots = [neighbor(2, 0)];
        snapshots[0].am_choking = false;
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(select_optimistic(&snapshots, &BTreeSet::new(), &mut rng), None);
    }

    #[tokio::test]
    async fn test_recompute_unchokes_top_uploaders() {
        let test = TestSwarm::builder(1, &[2, 3, 4]).pieces(8).build();
        let mut outboxes = Vec::new();
        for (peer, downloaded) in [(2, 100), (3, 50), (4, 10)] {
            let (handle, outbox) = test
                .swarm
                .attach(PeerId::new(peer), ConnectionDirection::Inbound)
                .unwrap();
            let mut session = handle.lock();
            session.set_peer_interested(true);
            session.record_download(downloaded);
            outboxes.push(outbox);
        }

        let mut scheduler = ChokeScheduler::new(
            Arc::clone(&test.swarm),
            2,
            Duration::from_secs(5),
            Duration::from_secs(15),
            ChaCha8Rng::seed_from_u64(3),
        );
        scheduler.recompute_preferred();
        assert_eq!(scheduler.preferred(), &ids(&[2, 3]));

        assert_eq!(drain_outbox(&mut outboxes[0]), vec![PeerMessage::Unchoke]);
        assert_eq!(drain_outbox(&mut outboxes[1]), vec![PeerMessage::Unchoke]);
        assert!(drain_outbox(&mut outboxes[2]).is_empty());

        for handle in test.swarm.session_handles() {
            assert_eq!(handle.lock().downloaded_this_interval(), 0);
        }

        scheduler.rotate_optimistic();
        assert_eq!(scheduler.optimistic(), Some(PeerId::new(4)));
        assert_eq!(drain_outbox(&mut outboxes[2]), vec![PeerMessage::Unchoke]);

        // Rates reset: the next round ranks on fresh counters
        test.swarm
            .session(PeerId::new(4))
            .unwrap()
            .lock()
            .record_download(500);
        test.swarm
            .session(PeerId::new(3))
            .unwrap()
            .lock()
            .record_download(400);
        scheduler.recompute_preferred();
        assert_eq!(scheduler.preferred(), &ids(&[3, 4]));
        assert_eq!(drain_outbox(&mut outboxes[0]), vec![PeerMessage::Choke]);
        assert!(drain_outbox(&mut outboxes[2]).is_empty(), "already unchoked");
    }

    #[tokio::test]
    async fn test_optimistic_neighbor_survives_recompute() {
        let test = TestSwarm::builder(1, &[2, 3]).pieces(8).complete().build();
        let mut outboxes = Vec::new();
        for peer in [2, 3] {
            let (handle, outbox) = test
                .swarm
                .attach(PeerId::new(peer), ConnectionDirection::Inbound)
                .unwrap();
            handle.lock().set_peer_interested(true);
            outboxes.push(outbox);
        }
        for outbox in &mut outboxes {
            drain_outbox(outbox);
        }

        let mut scheduler = ChokeScheduler::new(
            Arc::clone(&test.swarm),
            1,
            Duration::from_secs(5),
            Duration::from_secs(15),
            ChaCha8Rng::seed_from_u64(11),
        );
        scheduler.recompute_preferred();
        scheduler.rotate_optimistic();
        let optimistic = scheduler.optimistic().unwrap();
        assert!(!scheduler.preferred().contains(&optimistic));

        // Whatever the next ranking, the optimistic neighbor is never choked by it
        for _ in 0..10 {
            scheduler.recompute_preferred();
            let session = test.swarm.session(optimistic).unwrap();
            assert!(!session.lock().am_choking());
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let test = TestSwarm::builder(1, &[2]).pieces(4).complete().build();
        let scheduler = ChokeScheduler::new(
            Arc::clone(&test.swarm),
            1,
            Duration::from_millis(10),
            Duration::from_millis(20),
            ChaCha8Rng::seed_from_u64(0),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
