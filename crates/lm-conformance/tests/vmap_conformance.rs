//! Vmap conformance: vectorized execution must agree with the slice-loop
//! reference, for single and nested transforms, broadcast operands, and
//! axis placement.

use lm_api::{ApiError, AxisSpec, Interpreter, Primitive, TracedValue};
use lm_conformance::{ConformanceFixture, assert_allclose, tensor_f64, values_of};
use lm_core::{OpParams, TensorValue, Value};

const TOLERANCE: f64 = 1e-9;

/// Slice-loop-stack reference computed entirely outside the runtime.
fn reference_map(
    op: Primitive,
    opts: &OpParams,
    batched: &[(usize, &Value)],
    shared: &[(usize, &Value)],
    arity: usize,
    batch_size: usize,
) -> Value {
    let mut per_element = Vec::with_capacity(batch_size);
    for i in 0..batch_size {
        let mut call_args: Vec<Option<Value>> = vec![None; arity];
        for (slot, value) in batched {
            let t = value.as_tensor().expect("batched operand is a tensor");
            call_args[*slot] = Some(Value::Tensor(t.select(0, i).expect("slice")));
        }
        for (slot, value) in shared {
            call_args[*slot] = Some((*value).clone());
        }
        let args: Vec<Value> = call_args.into_iter().map(|v| v.expect("slot filled")).collect();
        let out = lm_ops::eval_primitive(op, &args, opts).expect("reference eval");
        per_element.push(out.to_tensor());
    }
    Value::Tensor(TensorValue::stack_axis0(&per_element).expect("reference stack"))
}

fn unary_body(
    op: Primitive,
) -> impl Fn(&Interpreter, &[TracedValue]) -> Result<Vec<TracedValue>, ApiError> {
    move |interp, args| Ok(vec![interp.call0(op, &[args[0].clone()])?])
}

#[test]
fn vmap_matches_stacked_per_element_results_for_unary_ops() {
    let input = tensor_f64(&[4, 3], &[0.1, 0.2, 0.3, 1.0, -1.0, 2.0, 3.5, -0.5, 0.0, 9.0, 4.0, 1.0]);
    for op in [Primitive::Neg, Primitive::Exp, Primitive::Sin, Primitive::Tanh] {
        let interp = Interpreter::new();
        let out = interp
            .vmap(unary_body(op))
            .call(std::slice::from_ref(&input))
            .expect("vmap should succeed");
        let reference = reference_map(op, &OpParams::new(), &[(0, &input)], &[], 1, 4);
        assert_allclose(&out[0], &reference, TOLERANCE);
    }
    ConformanceFixture::new("vmap_unary_family", "neg/exp/sin/tanh", &[4, 3])
        .log_pass(module_path!(), "vmap_matches_stacked_per_element_results_for_unary_ops");
}

#[test]
fn vmap_matches_stacked_results_for_binary_ops() {
    let lhs = tensor_f64(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let rhs = tensor_f64(&[3, 2], &[0.5, 0.5, 2.0, 2.0, -1.0, -1.0]);
    for op in [Primitive::Add, Primitive::Mul, Primitive::Div] {
        let interp = Interpreter::new();
        let body = move |interp: &Interpreter, args: &[TracedValue]| {
            Ok(vec![interp.call0(op, &[args[0].clone(), args[1].clone()])?])
        };
        let out = interp
            .vmap(body)
            .call(&[lhs.clone(), rhs.clone()])
            .expect("vmap should succeed");
        let reference = reference_map(
            op,
            &OpParams::new(),
            &[(0, &lhs), (1, &rhs)],
            &[],
            2,
            3,
        );
        assert_allclose(&out[0], &reference, TOLERANCE);
    }
}

#[test]
fn vmap_broadcast_operand_equals_shared_argument_loop() {
    let batched = tensor_f64(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let shared = tensor_f64(&[2], &[100.0, 200.0]);
    let interp = Interpreter::new();
    let body = |interp: &Interpreter, args: &[TracedValue]| {
        Ok(vec![interp.call0(
            Primitive::Add,
            &[args[0].clone(), args[1].clone()],
        )?])
    };
    let out = interp
        .vmap(body)
        .with_in_axes(&[AxisSpec::Batched(0), AxisSpec::NotBatched])
        .call(&[batched.clone(), shared.clone()])
        .expect("vmap should succeed");
    let reference = reference_map(
        Primitive::Add,
        &OpParams::new(),
        &[(0, &batched)],
        &[(1, &shared)],
        2,
        3,
    );
    assert_allclose(&out[0], &reference, TOLERANCE);
    ConformanceFixture::new("vmap_broadcast_operand", "add", &[3, 2])
        .log_pass(module_path!(), "vmap_broadcast_operand_equals_shared_argument_loop");
}

#[test]
fn vmap_reduction_reduces_only_logical_axes() {
    let input = tensor_f64(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let interp = Interpreter::new();
    let body = |interp: &Interpreter, args: &[TracedValue]| {
        Ok(vec![interp.call0(Primitive::ReduceSum, &[args[0].clone()])?])
    };
    let out = interp
        .vmap(body)
        .call(std::slice::from_ref(&input))
        .expect("vmap should succeed");
    assert_eq!(values_of(&out[0]), vec![6.0, 15.0]);
}

#[test]
fn nested_vmap_equals_doubly_nested_loop_both_axis_orders() {
    let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let input = tensor_f64(&[2, 3], &data);

    let square_then_add = |interp: &Interpreter, args: &[TracedValue]| {
        let squared = interp.call0(Primitive::Mul, &[args[0].clone(), args[0].clone()])?;
        Ok(vec![interp.call0(
            Primitive::Add,
            &[squared, args[0].clone()],
        )?])
    };

    // Outer over axis 0, inner over the remaining axis.
    let interp = Interpreter::new();
    let outer = |interp: &Interpreter, args: &[TracedValue]| {
        interp.vmap(square_then_add).call_traced(&[args[0].clone()])
    };
    let nested = interp
        .vmap(outer)
        .call(std::slice::from_ref(&input))
        .expect("nested vmap should succeed");

    let elementwise: Vec<f64> = data.iter().map(|x| x * x + x).collect();
    assert_eq!(values_of(&nested[0]), elementwise);

    // Caller flips the axis order via in_axes: outer over axis 1.
    let interp = Interpreter::new();
    let flipped = interp
        .vmap(outer)
        .with_in_axes(&[AxisSpec::Batched(1)])
        .call(std::slice::from_ref(&input))
        .expect("nested vmap should succeed");
    // Output is (3, 2): the outer (second) axis leads.
    assert_eq!(flipped[0].dims(), &[3, 2]);
    let transposed: Vec<f64> = (0..3)
        .flat_map(|j| (0..2).map(move |i| data[i * 3 + j]))
        .map(|x| x * x + x)
        .collect();
    assert_eq!(values_of(&flipped[0]), transposed);

    ConformanceFixture::new("nested_vmap_axis_orders", "mul/add", &[2, 3])
        .log_pass(module_path!(), "nested_vmap_equals_doubly_nested_loop_both_axis_orders");
}

#[test]
fn vmap_norm_family_matches_per_element_normalization() {
    // Each batch element is an independent (2, 2) batch-norm problem.
    let input = tensor_f64(
        &[3, 2, 2],
        &[
            1.0, 10.0, 3.0, 30.0, //
            2.0, 0.0, 6.0, 8.0, //
            -1.0, -2.0, 1.0, 2.0,
        ],
    );
    let interp = Interpreter::new();
    let body = |interp: &Interpreter, args: &[TracedValue]| {
        Ok(vec![interp.call0(Primitive::BatchNorm, &[args[0].clone()])?])
    };
    let out = interp
        .vmap(body)
        .call(std::slice::from_ref(&input))
        .expect("vmap should succeed");
    let reference = reference_map(
        Primitive::BatchNorm,
        &OpParams::new(),
        &[(0, &input)],
        &[],
        1,
        3,
    );
    assert_allclose(&out[0], &reference, 1e-6);
    ConformanceFixture::new("vmap_batch_norm", "batch_norm", &[3, 2, 2])
        .log_pass(module_path!(), "vmap_norm_family_matches_per_element_normalization");
}

#[test]
fn vmap_index_family_matches_per_element_indexing() {
    let base = tensor_f64(&[2, 4], &[0.0, 1.0, 2.0, 3.0, 10.0, 11.0, 12.0, 13.0]);
    let idx = Value::Tensor(
        lm_core::TensorValue::from_i64_slice(&[2, 2], &[3, 0, 1, 2]).expect("index tensor"),
    );
    let interp = Interpreter::new();
    let body = |interp: &Interpreter, args: &[TracedValue]| {
        Ok(vec![interp.call0(
            Primitive::Index,
            &[args[0].clone(), args[1].clone()],
        )?])
    };
    let out = interp
        .vmap(body)
        .call(&[base.clone(), idx.clone()])
        .expect("vmap should succeed");
    let reference = reference_map(
        Primitive::Index,
        &OpParams::new(),
        &[(0, &base), (1, &idx)],
        &[],
        2,
        2,
    );
    assert_allclose(&out[0], &reference, TOLERANCE);
    assert_eq!(values_of(&out[0]), vec![3.0, 0.0, 11.0, 12.0]);
}

#[test]
fn vmap_out_axes_controls_result_layout() {
    let input = tensor_f64(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let interp = Interpreter::new();
    let body = |interp: &Interpreter, args: &[TracedValue]| {
        Ok(vec![interp.call0(Primitive::Neg, &[args[0].clone()])?])
    };
    let out = interp
        .vmap(body)
        .with_out_axes(&[AxisSpec::Batched(1)])
        .call(std::slice::from_ref(&input))
        .expect("vmap should succeed");
    assert_eq!(out[0].dims(), &[3, 2]);
    assert_eq!(
        values_of(&out[0]),
        vec![-1.0, -4.0, -2.0, -5.0, -3.0, -6.0]
    );
}
