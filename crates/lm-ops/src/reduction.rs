//! Reductions, cumulative ops, sorting, and the rank-1 dot product.

use crate::{EvalError, expect_arity, for_each_index, linear_of, params};
use lm_core::{DType, Literal, Primitive, Shape, TensorValue, Value};

fn reject_bool(primitive: Primitive, t: &TensorValue) -> Result<(), EvalError> {
    if t.dtype == DType::Bool {
        return Err(EvalError::UnsupportedDType {
            primitive,
            dtype: DType::Bool,
        });
    }
    Ok(())
}

pub(crate) fn eval_reduce(
    primitive: Primitive,
    args: &[Value],
    opts: &lm_core::OpParams,
) -> Result<Value, EvalError> {
    expect_arity(primitive, args, 1, "1")?;
    let t = args[0].to_tensor();
    reject_bool(primitive, &t)?;

    let rank = t.rank();
    let mut axes = params::usize_list(opts, "axes");
    if axes.is_empty() {
        axes = (0..rank).collect();
    }
    axes.sort_unstable();
    axes.dedup();
    if let Some(&axis) = axes.iter().find(|&&axis| axis >= rank) {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!("reduction axis {axis} out of bounds for rank {rank}"),
        });
    }

    let keep: Vec<usize> = (0..rank).filter(|d| !axes.contains(d)).collect();
    let out_dims: Vec<usize> = keep.iter().map(|&d| t.dims()[d]).collect();
    let out_count = out_dims.iter().product::<usize>();

    let integral = t.dtype == DType::I64;
    let mut acc: Vec<Option<Literal>> = vec![None; out_count];
    let mut fold_err = None;
    for_each_index(t.dims(), |idx| {
        if fold_err.is_some() {
            return;
        }
        let out_idx: Vec<usize> = keep.iter().map(|&d| idx[d]).collect();
        let pos = linear_of(&out_idx, &out_dims);
        let value = t.get(idx);
        let folded = match acc[pos] {
            None => Some(value),
            Some(prev) => match fold_pair(primitive, integral, prev, value) {
                Ok(lit) => Some(lit),
                Err(err) => {
                    fold_err = Some(err);
                    None
                }
            },
        };
        acc[pos] = folded;
    });
    if let Some(err) = fold_err {
        return Err(err);
    }

    let identity = if integral {
        Literal::I64(0)
    } else {
        Literal::from_f64(0.0)
    };
    let elements: Vec<Literal> = acc
        .into_iter()
        .map(|slot| slot.unwrap_or(identity))
        .collect();
    Ok(Value::Tensor(
        TensorValue::new(t.dtype, Shape::of(&out_dims), elements)?
            .with_requires_grad(t.requires_grad),
    ))
}

fn fold_pair(
    primitive: Primitive,
    integral: bool,
    a: Literal,
    b: Literal,
) -> Result<Literal, EvalError> {
    if integral {
        let (x, y) = (
            a.as_i64().unwrap_or_default(),
            b.as_i64().unwrap_or_default(),
        );
        return Ok(Literal::I64(match primitive {
            Primitive::ReduceSum => x + y,
            Primitive::ReduceMax => x.max(y),
            _ => unreachable!("reduce dispatch covers sum/max"),
        }));
    }
    let x = a.as_f64().ok_or(EvalError::UnsupportedDType {
        primitive,
        dtype: a.dtype(),
    })?;
    let y = b.as_f64().ok_or(EvalError::UnsupportedDType {
        primitive,
        dtype: b.dtype(),
    })?;
    Ok(Literal::from_f64(match primitive {
        Primitive::ReduceSum => x + y,
        Primitive::ReduceMax => x.max(y),
        _ => unreachable!("reduce dispatch covers sum/max"),
    }))
}

pub(crate) fn eval_dot(args: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::Dot;
    expect_arity(primitive, args, 2, "2")?;
    let (a, b) = (args[0].to_tensor(), args[1].to_tensor());
    reject_bool(primitive, &a)?;
    reject_bool(primitive, &b)?;
    if a.rank() != 1 || b.rank() != 1 || a.dims() != b.dims() {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!(
                "dot requires equal-length rank-1 operands, got {:?} and {:?}",
                a.dims(),
                b.dims()
            ),
        });
    }

    if a.dtype == DType::I64 && b.dtype == DType::I64 {
        let mut sum = 0_i64;
        for linear in 0..a.len() {
            sum += a.get_linear(linear).as_i64().unwrap_or_default()
                * b.get_linear(linear).as_i64().unwrap_or_default();
        }
        return Ok(Value::Tensor(TensorValue::from_literal(Literal::I64(sum))));
    }

    let mut sum = 0.0_f64;
    for linear in 0..a.len() {
        let x = a.get_linear(linear).as_f64().ok_or(EvalError::UnsupportedDType {
            primitive,
            dtype: a.dtype,
        })?;
        let y = b.get_linear(linear).as_f64().ok_or(EvalError::UnsupportedDType {
            primitive,
            dtype: b.dtype,
        })?;
        sum += x * y;
    }
    let requires_grad = a.requires_grad || b.requires_grad;
    Ok(Value::Tensor(
        TensorValue::from_literal(Literal::from_f64(sum)).with_requires_grad(requires_grad),
    ))
}

/// Ascending sort of each lane along `axis` (defaults to the last axis).
pub(crate) fn eval_sort(args: &[Value], opts: &lm_core::OpParams) -> Result<Value, EvalError> {
    let primitive = Primitive::Sort;
    expect_arity(primitive, args, 1, "1")?;
    let t = args[0].to_tensor();
    reject_bool(primitive, &t)?;
    let rank = t.rank();
    if rank == 0 {
        return Ok(Value::Tensor(t));
    }
    let axis = params::usize_or(primitive, opts, "axis", rank - 1)?;
    if axis >= rank {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!("sort axis {axis} out of bounds for rank {rank}"),
        });
    }

    let lane_dims: Vec<usize> = t
        .dims()
        .iter()
        .enumerate()
        .filter(|&(d, _)| d != axis)
        .map(|(_, &size)| size)
        .collect();
    let axis_size = t.dims()[axis];
    let out_dims = t.dims().to_vec();
    let mut elements = vec![Literal::zero(t.dtype); t.len()];
    for_each_index(&lane_dims, |lane| {
        let mut full = Vec::with_capacity(out_dims.len());
        let mut lane_iter = lane.iter();
        for d in 0..out_dims.len() {
            if d == axis {
                full.push(0);
            } else {
                full.push(*lane_iter.next().expect("lane index covers other axes"));
            }
        }
        let mut values: Vec<Literal> = (0..axis_size)
            .map(|i| {
                full[axis] = i;
                t.get(&full)
            })
            .collect();
        values.sort_by(|x, y| match (x, y) {
            (Literal::I64(a), Literal::I64(b)) => a.cmp(b),
            _ => x
                .as_f64()
                .unwrap_or(f64::NAN)
                .total_cmp(&y.as_f64().unwrap_or(f64::NAN)),
        });
        for (i, lit) in values.into_iter().enumerate() {
            full[axis] = i;
            elements[linear_of(&full, &out_dims)] = lit;
        }
    });
    Ok(Value::Tensor(
        TensorValue::new(t.dtype, Shape::of(&out_dims), elements)?
            .with_requires_grad(t.requires_grad),
    ))
}

pub(crate) fn eval_cumsum(args: &[Value], opts: &lm_core::OpParams) -> Result<Value, EvalError> {
    let primitive = Primitive::Cumsum;
    expect_arity(primitive, args, 1, "1")?;
    let t = args[0].to_tensor();
    reject_bool(primitive, &t)?;
    let rank = t.rank();
    if rank == 0 {
        return Ok(Value::Tensor(t));
    }
    let axis = params::usize_or(primitive, opts, "axis", 0)?;
    if axis >= rank {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!("cumsum axis {axis} out of bounds for rank {rank}"),
        });
    }

    let integral = t.dtype == DType::I64;
    let out_dims = t.dims().to_vec();
    let mut elements = vec![Literal::zero(t.dtype); t.len()];
    let lane_dims: Vec<usize> = out_dims
        .iter()
        .enumerate()
        .filter(|&(d, _)| d != axis)
        .map(|(_, &size)| size)
        .collect();
    let axis_size = out_dims[axis];
    for_each_index(&lane_dims, |lane| {
        let mut full = Vec::with_capacity(out_dims.len());
        let mut lane_iter = lane.iter();
        for d in 0..out_dims.len() {
            if d == axis {
                full.push(0);
            } else {
                full.push(*lane_iter.next().expect("lane index covers other axes"));
            }
        }
        let mut acc_i = 0_i64;
        let mut acc_f = 0.0_f64;
        for i in 0..axis_size {
            full[axis] = i;
            let lit = t.get(&full);
            let out = if integral {
                acc_i += lit.as_i64().unwrap_or_default();
                Literal::I64(acc_i)
            } else {
                acc_f += lit.as_f64().unwrap_or(f64::NAN);
                Literal::from_f64(acc_f)
            };
            elements[linear_of(&full, &out_dims)] = out;
        }
    });
    Ok(Value::Tensor(
        TensorValue::new(t.dtype, Shape::of(&out_dims), elements)?
            .with_requires_grad(t.requires_grad),
    ))
}
