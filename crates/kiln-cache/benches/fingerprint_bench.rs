use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use kiln_cache::config::RuntimeDefaults;
use kiln_cache::keys::{FingerprintBuilder, PretrainedModel};
use kiln_core::{hash_file, Precision, StateDict, Tensor};
use tempfile::TempDir;

/// Synthetic weights: `layers` float32 matrices of `dim` x `dim`.
fn generate_weights(layers: usize, dim: usize) -> StateDict {
    (0..layers)
        .map(|i| {
            let data: Vec<u8> = (0..dim * dim * 4).map(|j| (j % 251) as u8).collect();
            (
                format!("layer.{i}.weight"),
                Tensor::new(vec![dim, dim], Precision::Float32, data).unwrap(),
            )
        })
        .collect()
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    let defaults = RuntimeDefaults::new(2, Some("2.10".into()));

    for (layers, dim) in [(4, 64), (12, 256)] {
        let model = PretrainedModel::new("bert", generate_weights(layers, dim));
        group.throughput(Throughput::Bytes(model.state_dict().total_bytes() as u64));

        group.bench_function(format!("compute_hash_{layers}x{dim}"), |b| {
            b.iter(|| {
                let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
                    .build(&defaults)
                    .unwrap();
                black_box(fp.compute_hash().unwrap().overall_hash.clone())
            })
        });
    }

    group.bench_function("memoized_cache_path", |b| {
        let model = PretrainedModel::new("bert", generate_weights(4, 64));
        let fp = FingerprintBuilder::new(&model, vec![1, 128], Precision::Float32)
            .build(&defaults)
            .unwrap();
        fp.compute_hash().unwrap();
        b.iter(|| black_box(fp.cache_path().unwrap()))
    });

    group.finish();
}

fn bench_hash_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_file");
    let temp_dir = TempDir::new().unwrap();

    for size in [64 * 1024, 16 * 1024 * 1024] {
        let path = temp_dir.path().join(format!("blob_{size}"));
        std::fs::write(&path, vec![0xABu8; size]).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("sha256_{size}"), |b| {
            b.iter(|| hash_file(black_box(&path)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fingerprint, bench_hash_file);
criterion_main!(benches);
