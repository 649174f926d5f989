use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vulcan::kernels::{masked_softmax, matmul_naive, matmul_tiled, softmax_rows};
use vulcan::quant::{QuantScheme, QuantizedMatrix};

// ============================================================================
// MATMUL BENCHMARKS
// ============================================================================

fn bench_matmul_naive_vs_tiled(c: &mut Criterion) {
    let mut group = c.benchmark_group("matmul");
    for size in [64usize, 128, 256].iter() {
        let n = *size;
        let a: Vec<f32> = (0..n * n).map(|i| (i % 17) as f32 * 0.1).collect();
        let b: Vec<f32> = (0..n * n).map(|i| (i % 13) as f32 * 0.2).collect();
        let mut out = vec![0.0; n * n];

        group.bench_with_input(BenchmarkId::new("naive", n), &n, |bench, _| {
            bench.iter(|| {
                matmul_naive(black_box(&a), black_box(&b), n, n, n, &mut out).unwrap();
            })
        });
        group.bench_with_input(BenchmarkId::new("tiled", n), &n, |bench, _| {
            bench.iter(|| {
                matmul_tiled(black_box(&a), black_box(&b), n, n, n, &mut out).unwrap();
            })
        });
    }
    group.finish();
}

// ============================================================================
// SOFTMAX BENCHMARKS
// ============================================================================

fn bench_softmax(c: &mut Criterion) {
    let rows = 64;
    let cols = 512;
    let data: Vec<f32> = (0..rows * cols).map(|i| (i % 29) as f32 * 0.05).collect();

    c.bench_function("softmax_rows_64x512", |b| {
        b.iter(|| {
            let mut scratch = data.clone();
            softmax_rows(black_box(&mut scratch), cols).unwrap();
        })
    });

    c.bench_function("masked_softmax_64x512", |b| {
        b.iter(|| {
            let mut scratch = data.clone();
            masked_softmax(black_box(&mut scratch), rows, cols, 0.125, 0).unwrap();
        })
    });
}

// ============================================================================
// DEQUANTIZATION BENCHMARKS
// ============================================================================

fn bench_dequantize_schemes(c: &mut Criterion) {
    let mut group = c.benchmark_group("dequantize");
    let rows = 64;
    let cols = 256;
    let src: Vec<f32> = (0..rows * cols).map(|i| (i as f32 * 0.37).sin()).collect();

    for scheme in [
        QuantScheme::Q8_0,
        QuantScheme::Q4_0,
        QuantScheme::Q4_1,
        QuantScheme::Q5_0,
        QuantScheme::Q6K,
    ] {
        let matrix = QuantizedMatrix::quantize(&src, rows, cols, scheme).unwrap();
        let mut out = vec![0.0; rows * cols];
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{scheme:?}")),
            &matrix,
            |b, matrix| {
                b.iter(|| {
                    matrix.dequantize(black_box(&mut out)).unwrap();
                })
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_matmul_naive_vs_tiled,
    bench_softmax,
    bench_dequantize_schemes
);
criterion_main!(benches);
