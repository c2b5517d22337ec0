use criterion::{Criterion, criterion_group, criterion_main};
use lm_batch::{TracedValue, wrap_batched};
use lm_core::{OpParams, Primitive, TensorValue, Value};
use lm_dispatch::{BatchRuleRegistry, dispatch};
use lm_stack::{TransformKind, shared_stack};

fn benchmark_dispatch(c: &mut Criterion) {
    let registry = BatchRuleRegistry::with_default_rules();
    let stack = shared_stack();
    stack
        .borrow_mut()
        .push(TransformKind::Vectorize { batch_size: 64 });
    let layers = stack.borrow().layers().to_vec();
    let level = layers[0].level();

    let data: Vec<f64> = (0..64).map(|i| i as f64).collect();
    let tensor = TensorValue::from_f64_slice(&[64], &data).expect("bench tensor should build");

    c.bench_function("dispatch/batched_unary_abs", |b| {
        b.iter(|| {
            let arg = wrap_batched(
                TracedValue::Plain(Value::Tensor(tensor.clone())),
                Some(0),
                level,
            );
            let out = dispatch(&registry, &layers, Primitive::Abs, &[arg], &OpParams::new())
                .expect("bench dispatch should succeed");
            assert!(out.is_batched());
        });
    });

    c.bench_function("dispatch/fallback_loop_sort", |b| {
        let wide =
            TensorValue::from_f64_slice(&[8, 8], &(0..64).map(|i| (63 - i) as f64).collect::<Vec<_>>())
                .expect("bench tensor should build");
        let small_stack = shared_stack();
        small_stack
            .borrow_mut()
            .push(TransformKind::Vectorize { batch_size: 8 });
        let small_layers = small_stack.borrow().layers().to_vec();
        let small_level = small_layers[0].level();
        b.iter(|| {
            let arg = wrap_batched(
                TracedValue::Plain(Value::Tensor(wide.clone())),
                Some(0),
                small_level,
            );
            let out = dispatch(
                &registry,
                &small_layers,
                Primitive::Sort,
                &[arg],
                &OpParams::new(),
            )
            .expect("bench dispatch should succeed");
            assert!(out.is_batched());
        });
    });
}

criterion_group!(dispatch_benches, benchmark_dispatch);
criterion_main!(dispatch_benches);
