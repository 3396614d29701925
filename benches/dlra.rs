use criterion::{Criterion, black_box, criterion_group, criterion_main};

use rust_dlra::{Activation, DlraNet, DlraNetBuilder, Loss, Optimizer, Phase};

const BATCH: usize = 64;

fn net() -> DlraNet {
    DlraNetBuilder::new(128)
        .unwrap()
        .tolerance(0.05)
        .unwrap()
        .rmax_total(32)
        .unwrap()
        .add_block(256, 16, Activation::ReLU)
        .unwrap()
        .add_block(256, 16, Activation::ReLU)
        .unwrap()
        .add_block(10, 10, Activation::Identity)
        .unwrap()
        .build_with_seed(0)
        .unwrap()
}

fn dlra_inference_bench(c: &mut Criterion) {
    let net = net();
    let mut scratch = net.scratch();
    let input = vec![0.1_f32; BATCH * net.input_dim()];

    c.bench_function("dlra_inference_128_256_256_10_b64", |b| {
        b.iter(|| {
            let out = net
                .forward(black_box(&input), BATCH, Phase::K, false, &mut scratch)
                .unwrap();
            black_box(out);
        })
    });
}

fn dlra_train_step_bench(c: &mut Criterion) {
    let mut net = net();
    let mut trainer = net.trainer(Optimizer::adam(), Loss::SoftmaxCrossEntropy).unwrap();
    let input: Vec<f32> = (0..BATCH * net.input_dim())
        .map(|i| ((i * 31 % 97) as f32 - 48.0) / 48.0)
        .collect();
    let mut target = vec![0.0_f32; BATCH * net.output_dim()];
    for (s, row) in target.chunks_exact_mut(10).enumerate() {
        row[s % 10] = 1.0;
    }

    c.bench_function("dlra_train_step_128_256_256_10_b64", |b| {
        b.iter(|| {
            let report = net
                .train_step(black_box(&input), &target, BATCH, 1e-3, &mut trainer)
                .unwrap();
            black_box(report);
        })
    });
}

criterion_group!(benches, dlra_inference_bench, dlra_train_step_bench);
criterion_main!(benches);
