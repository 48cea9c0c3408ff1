use std::collections::BTreeSet;

use bytes::Bytes;
use criterion::{Criterion, criterion_group, criterion_main};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use shoal_core::swarm::Bitfield;
use shoal_core::swarm::scheduler::{NeighborSnapshot, select_optimistic, select_preferred};
use shoal_core::wire::{MessageCodec, PeerId, PeerMessage, PieceIndex};

const PIECE_SIZE: usize = 16 * 1024;

fn bench_piece_frames(c: &mut Criterion) {
    let codec = MessageCodec::new(PIECE_SIZE as u32 + 5);
    let message = PeerMessage::Piece {
        piece_index: PieceIndex::new(42),
        data: Bytes::from(vec![0xAB; PIECE_SIZE]),
    };
    let frame = MessageCodec::serialize_message(&message);

    c.bench_function("serialize_piece_16k", |b| {
        b.iter(|| MessageCodec::serialize_message(std::hint::black_box(&message)))
    });
    c.bench_function("deserialize_piece_16k", |b| {
        b.iter(|| codec.deserialize_message(std::hint::black_box(&frame)))
    });
}

fn bench_bitfield(c: &mut Criterion) {
    let mut local = Bitfield::new(4096);
    for index in (0..4096).step_by(3) {
        local.set_piece(PieceIndex::new(index));
    }
    let remote = Bitfield::full(4096);

    c.bench_function("bitfield_missing_from_4096", |b| {
        b.iter(|| local.missing_from(std::hint::black_box(&remote)).count())
    });
}

fn bench_neighbor_selection(c: &mut Criterion) {
    let snapshots: Vec<NeighborSnapshot> = (0..64)
        .map(|i| NeighborSnapshot {
            peer: PeerId::new(1000 + i),
            peer_interested: i % 4 != 0,
            am_choking: i % 2 == 0,
            downloaded: u64::from(i % 7) * 1024,
        })
        .collect();
    let mut rng = ChaCha8Rng::seed_from_u64(0);

    c.bench_function("select_preferred_64", |b| {
        b.iter(|| select_preferred(std::hint::black_box(&snapshots), 4, false, &mut rng))
    });
    let preferred: BTreeSet<PeerId> = select_preferred(&snapshots, 4, false, &mut rng);
    c.bench_function("select_optimistic_64", |b| {
        b.iter(|| select_optimistic(std::hint::black_box(&snapshots), &preferred, &mut rng))
    });
}

criterion_group!(benches, bench_piece_frames, bench_bitfield, bench_neighbor_selection);
criterion_main!(benches);
