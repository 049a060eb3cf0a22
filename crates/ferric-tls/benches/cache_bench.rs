//! Session cache and TLSA record benchmarks.
//!
//! Run with: cargo bench

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use ferric_tls::dane::{DaneStore, DaneTable, MATCHING_SHA256, MATCHING_SHA512};
use ferric_tls::{CipherSuite, DerCheckProvider, Session, SessionKey, SessionStore, TlsVersion};

fn session_with_id(seed: u32) -> Arc<Session> {
    let mut s = Session::new(TlsVersion::Tls13, CipherSuite::TLS_AES_128_GCM_SHA256);
    let mut id = seed.to_le_bytes().to_vec();
    id.resize(32, 0x5a);
    s.id = id;
    Arc::new(s)
}

fn bench_session_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_store");

    for size in [256usize, 4096, 65536] {
        let mut store = SessionStore::new(size + 1);
        for i in 0..size as u32 {
            store.put(session_with_id(i));
        }
        let key = SessionKey::new(TlsVersion::Tls13, session_with_id(size as u32 / 2).id.as_slice());

        group.bench_with_input(BenchmarkId::new("lookup", size), &size, |bench, _| {
            bench.iter(|| store.get(&key));
        });
    }

    group.finish();
}

fn bench_tlsa_insert(c: &mut Criterion) {
    let mut table = DaneTable::default();
    table.enable();

    let mut group = c.benchmark_group("tlsa");
    for count in [8usize, 64, 256] {
        group.bench_with_input(BenchmarkId::new("insert_sorted", count), &count, |bench, _| {
            bench.iter(|| {
                let mut store = DaneStore::new(0);
                for i in 0..count {
                    let usage = (i % 4) as u8;
                    let selector = (i % 2) as u8;
                    let (mtype, len) = if i % 2 == 0 {
                        (MATCHING_SHA256, 32)
                    } else {
                        (MATCHING_SHA512, 64)
                    };
                    store
                        .add_record(
                            &table,
                            &DerCheckProvider,
                            usage,
                            selector,
                            mtype,
                            &vec![i as u8; len],
                        )
                        .unwrap();
                }
                store
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_session_store, bench_tlsa_insert);
criterion_main!(benches);
