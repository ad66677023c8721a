//! Benchmarks for cache fingerprinting and endpoint rotation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::collections::BTreeMap;

use taskgrid::cache::{compute_fingerprint, InputFingerprint};
use taskgrid::graph::{ProcessDef, VariableDecl};
use taskgrid::processor::{DispatcherEndpoint, RoundRobin};
use taskgrid::storage::ContentIdentity;

fn fingerprint_benchmark(c: &mut Criterion) {
    let process = ProcessDef::new("resize", "fn.resize")
        .with_input(VariableDecl::local("image"))
        .with_input(VariableDecl::array("tiles"))
        .with_output(VariableDecl::local("thumb"))
        .with_cache(false);
    let image = vec![7_u8; 64 * 1024];
    let inputs = vec![
        ("image".to_string(), InputFingerprint::Content(ContentIdentity::of(&image))),
        (
            "tiles".to_string(),
            InputFingerprint::Contents(vec![Some(ContentIdentity::of(b"a")), None, Some(ContentIdentity::of(b"c"))]),
        ),
    ];
    let inline = BTreeMap::from([("width".to_string(), "128".to_string())]);

    c.bench_function("compute_fingerprint", |b| {
        b.iter(|| compute_fingerprint(black_box(&process), black_box(&inputs), black_box(&inline)).unwrap());
    });
    c.bench_function("content_identity_64k", |b| {
        b.iter(|| ContentIdentity::of(black_box(&image)));
    });
}

fn round_robin_benchmark(c: &mut Criterion) {
    let endpoints: Vec<_> = (0..8).map(|i| DispatcherEndpoint::new(format!("http://d{i}:8080"))).collect();
    let rotation = RoundRobin::new(&endpoints).unwrap();
    c.bench_function("round_robin_next", |b| {
        b.iter(|| black_box(rotation.next()));
    });
}

criterion_group!(benches, fingerprint_benchmark, round_robin_benchmark);
criterion_main!(benches);
