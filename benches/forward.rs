//! Forward pass benchmarks.
//!
//! # Methodology
//!
//! **Layer recreation per batch size**: A fresh `ConvolutionLayer` is built for
//! each batch size because the plan's geometry fixes the batch. The seed keeps
//! the weights identical across sizes.
//!
//! **Steady state**: Input and output tensors are reused across iterations.
//! After the first iteration the filter and input copies are cached, so the
//! `blocked` group measures the convolution plus the lazy output bookkeeping.
//!
//! **Comparison groups**:
//! - `forward_blocked`: 8-lane channel blocking (conversions cached)
//! - `forward_plain`: canonical layout everywhere (pass-through)
//! - `forward_materialized`: blocked forward plus reading the output back

use std::rc::Rc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dnnconv::{ConvConfig, ConvolutionLayer, CpuBackend, CpuBackendOptions, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

const INPUT: [usize; 3] = [16, 28, 28];

fn make_input(batch: usize, seed: u64) -> Tensor<CpuBackend> {
    let mut rng = StdRng::seed_from_u64(seed);
    let shape = [batch, INPUT[0], INPUT[1], INPUT[2]];
    let values = (0..shape.iter().product::<usize>())
        .map(|_| rng.gen_range(-1.0f32..1.0))
        .collect();
    Tensor::from_data(&shape, values).expect("input shape")
}

fn make_layer(options: CpuBackendOptions, batch: usize) -> ConvolutionLayer<CpuBackend> {
    let config = ConvConfig::square(32, 3, 1, 1).with_seed(42);
    let backend = Rc::new(CpuBackend::with_options(options));
    ConvolutionLayer::new(backend, config, [batch, INPUT[0], INPUT[1], INPUT[2]]).expect("layer")
}

fn bench_forward_layouts(c: &mut Criterion) {
    let batch_sizes = [1_usize, 8, 32];

    for (name, options) in [
        ("forward_blocked", CpuBackendOptions::default()),
        ("forward_plain", CpuBackendOptions::plain()),
    ] {
        let mut group = c.benchmark_group(name);
        for &batch in &batch_sizes {
            let mut layer = make_layer(options, batch);
            let mut input = make_input(batch, 7);
            let mut output = layer.new_output();

            group.throughput(Throughput::Elements(input.count() as u64));
            group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &_batch| {
                b.iter(|| {
                    layer
                        .forward(black_box(&mut input), black_box(&mut output))
                        .expect("forward");
                });
            });
        }
        group.finish();
    }
}

fn bench_forward_materialized(c: &mut Criterion) {
    let batch_sizes = [1_usize, 8, 32];
    let mut group = c.benchmark_group("forward_materialized");

    for &batch in &batch_sizes {
        let mut layer = make_layer(CpuBackendOptions::default(), batch);
        let mut input = make_input(batch, 7);
        let mut output = layer.new_output();

        group.throughput(Throughput::Elements(input.count() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &_batch| {
            b.iter(|| {
                layer.forward(&mut input, &mut output).expect("forward");
                black_box(output.data().expect("materialize"));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_forward_layouts, bench_forward_materialized);
criterion_main!(benches);
