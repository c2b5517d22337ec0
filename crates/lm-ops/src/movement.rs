//! Movement primitives: thin adapters over the strided view algebra.

use crate::{EvalError, expect_arity, for_each_index, linear_of, params};
use lm_core::{Literal, Primitive, Shape, TensorValue, Value};

fn single_tensor(primitive: Primitive, args: &[Value]) -> Result<TensorValue, EvalError> {
    expect_arity(primitive, args, 1, "1")?;
    Ok(args[0].to_tensor())
}

pub(crate) fn eval_reshape(args: &[Value], opts: &lm_core::OpParams) -> Result<Value, EvalError> {
    let t = single_tensor(Primitive::Reshape, args)?;
    let shape = params::usize_list(opts, "shape");
    Ok(Value::Tensor(t.reshape(&shape)?))
}

pub(crate) fn eval_transpose(args: &[Value], opts: &lm_core::OpParams) -> Result<Value, EvalError> {
    let t = single_tensor(Primitive::Transpose, args)?;
    let permutation = params::usize_list(opts, "permutation");
    Ok(Value::Tensor(t.permute(&permutation)?))
}

pub(crate) fn eval_expand(args: &[Value], opts: &lm_core::OpParams) -> Result<Value, EvalError> {
    let t = single_tensor(Primitive::Expand, args)?;
    let shape = params::usize_list(opts, "shape");
    Ok(Value::Tensor(t.expand(&shape)?))
}

pub(crate) fn eval_squeeze(args: &[Value], opts: &lm_core::OpParams) -> Result<Value, EvalError> {
    let t = single_tensor(Primitive::Squeeze, args)?;
    let axis = params::require_usize(Primitive::Squeeze, opts, "axis")?;
    Ok(Value::Tensor(t.squeeze(axis)?))
}

pub(crate) fn eval_unsqueeze(args: &[Value], opts: &lm_core::OpParams) -> Result<Value, EvalError> {
    let t = single_tensor(Primitive::Unsqueeze, args)?;
    let axis = params::require_usize(Primitive::Unsqueeze, opts, "axis")?;
    Ok(Value::Tensor(t.unsqueeze(axis)?))
}

pub(crate) fn eval_movedim(args: &[Value], opts: &lm_core::OpParams) -> Result<Value, EvalError> {
    let t = single_tensor(Primitive::MoveDim, args)?;
    let src = params::require_usize(Primitive::MoveDim, opts, "src")?;
    let dst = params::require_usize(Primitive::MoveDim, opts, "dst")?;
    Ok(Value::Tensor(t.movedim(src, dst)?))
}

pub(crate) fn eval_select(args: &[Value], opts: &lm_core::OpParams) -> Result<Value, EvalError> {
    let t = single_tensor(Primitive::Select, args)?;
    let axis = params::require_usize(Primitive::Select, opts, "axis")?;
    let index = params::require_usize(Primitive::Select, opts, "index")?;
    Ok(Value::Tensor(t.select(axis, index)?))
}

pub(crate) fn eval_narrow(args: &[Value], opts: &lm_core::OpParams) -> Result<Value, EvalError> {
    let t = single_tensor(Primitive::Narrow, args)?;
    let axis = params::require_usize(Primitive::Narrow, opts, "axis")?;
    let start = params::require_usize(Primitive::Narrow, opts, "start")?;
    let len = params::require_usize(Primitive::Narrow, opts, "len")?;
    Ok(Value::Tensor(t.narrow(axis, start, len)?))
}

pub(crate) fn eval_stack(args: &[Value], opts: &lm_core::OpParams) -> Result<Value, EvalError> {
    let primitive = Primitive::Stack;
    if args.is_empty() {
        return Err(EvalError::Arity {
            primitive,
            expected: "1 or more",
            actual: 0,
        });
    }
    let parts: Vec<TensorValue> = args.iter().map(Value::to_tensor).collect();
    let stacked = TensorValue::stack_axis0(&parts)?;
    let axis = params::usize_or(primitive, opts, "axis", 0)?;
    Ok(Value::Tensor(stacked.movedim(0, axis)?))
}

pub(crate) fn eval_concatenate(
    args: &[Value],
    opts: &lm_core::OpParams,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Concatenate;
    if args.is_empty() {
        return Err(EvalError::Arity {
            primitive,
            expected: "1 or more",
            actual: 0,
        });
    }
    let parts: Vec<TensorValue> = args.iter().map(Value::to_tensor).collect();
    let axis = params::usize_or(primitive, opts, "axis", 0)?;
    let first = &parts[0];
    let rank = first.rank();
    if axis >= rank {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!("concat axis {axis} out of bounds for rank {rank}"),
        });
    }
    let mut axis_total = 0;
    for part in &parts {
        if part.dtype != first.dtype {
            return Err(EvalError::Value(lm_core::ValueError::StackDTypeMismatch {
                expected: first.dtype,
                actual: part.dtype,
            }));
        }
        if part.rank() != rank
            || part
                .dims()
                .iter()
                .enumerate()
                .any(|(d, &size)| d != axis && size != first.dims()[d])
        {
            return Err(EvalError::ShapeMismatch {
                primitive,
                detail: format!(
                    "concat operand shape {:?} incompatible with {:?} on axis {axis}",
                    part.dims(),
                    first.dims()
                ),
            });
        }
        axis_total += part.dims()[axis];
    }

    let mut out_dims = first.dims().to_vec();
    out_dims[axis] = axis_total;
    let mut elements = vec![Literal::zero(first.dtype); out_dims.iter().product()];
    let mut requires_grad = false;
    let mut axis_offset = 0;
    for part in &parts {
        requires_grad |= part.requires_grad;
        for_each_index(part.dims(), |idx| {
            let mut shifted = idx.to_vec();
            shifted[axis] += axis_offset;
            elements[linear_of(&shifted, &out_dims)] = part.get(idx);
        });
        axis_offset += part.dims()[axis];
    }
    Ok(Value::Tensor(
        TensorValue::new(first.dtype, Shape::of(&out_dims), elements)?
            .with_requires_grad(requires_grad),
    ))
}

/// `arange(start..end)` as a rank-1 i64 tensor.
pub(crate) fn eval_arange(args: &[Value], opts: &lm_core::OpParams) -> Result<Value, EvalError> {
    let primitive = Primitive::Arange;
    expect_arity(primitive, args, 0, "0")?;
    let start = params::i64_or(primitive, opts, "start", 0)?;
    let end = params::require_i64(primitive, opts, "end")?;
    if end < start {
        return Err(EvalError::InvalidParam {
            primitive,
            key: "end",
            value: end.to_string(),
        });
    }
    let values: Vec<i64> = (start..end).collect();
    Ok(Value::Tensor(TensorValue::from_i64_slice(
        &[values.len()],
        &values,
    )?))
}

#[cfg(test)]
mod tests {
    use crate::eval_primitive;
    use lm_core::{OpParams, Primitive, TensorValue, Value};

    fn iota(dims: &[usize]) -> Value {
        let n = dims.iter().product::<usize>();
        Value::Tensor(
            TensorValue::from_i64_slice(dims, &(0..n as i64).collect::<Vec<_>>()).expect("tensor"),
        )
    }

    fn with(pairs: &[(&str, &str)]) -> OpParams {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn movedim_param_form_matches_view_algebra() {
        let out = eval_primitive(
            Primitive::MoveDim,
            &[iota(&[2, 3, 4])],
            &with(&[("src", "2"), ("dst", "0")]),
        )
        .expect("movedim");
        assert_eq!(out.dims(), &[4, 2, 3]);
    }

    #[test]
    fn stack_with_axis_param_places_new_axis() {
        let out = eval_primitive(
            Primitive::Stack,
            &[iota(&[2]), iota(&[2]), iota(&[2])],
            &with(&[("axis", "1")]),
        )
        .expect("stack");
        assert_eq!(out.dims(), &[2, 3]);
        assert_eq!(
            out.as_tensor().expect("tensor").to_i64_vec(),
            Some(vec![0, 0, 0, 1, 1, 1])
        );
    }

    #[test]
    fn concatenate_joins_along_axis() {
        let out = eval_primitive(
            Primitive::Concatenate,
            &[iota(&[1, 2]), iota(&[2, 2])],
            &OpParams::new(),
        )
        .expect("concat");
        assert_eq!(out.dims(), &[3, 2]);
        assert_eq!(
            out.as_tensor().expect("tensor").to_i64_vec(),
            Some(vec![0, 1, 0, 1, 2, 3])
        );
    }

    #[test]
    fn arange_generates_index_vector() {
        let out = eval_primitive(Primitive::Arange, &[], &with(&[("end", "4")])).expect("arange");
        assert_eq!(
            out.as_tensor().expect("tensor").to_i64_vec(),
            Some(vec![0, 1, 2, 3])
        );
    }

    #[test]
    fn select_keeps_rank_zero_as_tensor() {
        let out = eval_primitive(
            Primitive::Select,
            &[iota(&[3])],
            &with(&[("axis", "0"), ("index", "2")]),
        )
        .expect("select");
        assert_eq!(out.rank(), 0);
        assert!(out.as_tensor().is_some());
    }
}
