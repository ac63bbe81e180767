//! Benchmarks for header decoding and chain verification
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use electrumx_sync::block::{BlockHash, BlockHeader};
use electrumx_sync::headers::HeaderChain;
use electrumx_sync::network_type::BITCOIN_HEADER_SIZE;

const CHAIN_LEN: usize = 20_160;

fn synthetic_chain(n: usize) -> Vec<u8> {
    let mut raw = Vec::with_capacity(n * BITCOIN_HEADER_SIZE);
    let mut prev = BlockHash::ZERO;
    for i in 0..n as u32 {
        let header = BlockHeader::new(1, prev, [7u8; 32], 1_600_000_000 + i * 600, 0x1d00_ffff, i);
        prev = header.block_hash();
        raw.extend_from_slice(header.as_bytes());
    }
    raw
}

fn bench_verify_from_tip(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let chain = HeaderChain::open(dir.path().join("headers.bin"), 0, BITCOIN_HEADER_SIZE).unwrap();
    chain.append(&synthetic_chain(CHAIN_LEN)).unwrap();
    chain.rebuild_from_file().unwrap();

    c.bench_function("verify_full_chain_10_chunks", |b| {
        b.iter(|| chain.verify_from_tip(black_box(0), true).unwrap())
    });

    c.bench_function("verify_last_8", |b| {
        b.iter(|| chain.verify_from_tip(black_box(8), false).unwrap())
    });
}

fn bench_rebuild_from_file(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let chain = HeaderChain::open(dir.path().join("headers.bin"), 0, BITCOIN_HEADER_SIZE).unwrap();
    chain.append(&synthetic_chain(2016)).unwrap();

    c.bench_function("rebuild_one_chunk", |b| {
        b.iter(|| chain.rebuild_from_file().unwrap())
    });
}

criterion_group!(benches, bench_verify_from_tip, bench_rebuild_from_file);
criterion_main!(benches);
