//! Index-family primitives: advanced indexing, gather/scatter, index_select.
//!
//! Operand conventions (arity encodes the overload):
//! - `index`:      [self, idx_0, .., idx_{n-1}]: integer tensors applied to
//!   the first n axes with broadcasting, or one boolean mask over the
//!   leading axes.
//! - `index_put`:  [self, values, idx_0, ..] with param `accumulate`.
//! - `gather` / `scatter` / `scatter_add` / `index_select` / `index_add`:
//!   torch-style signatures with param `dim`.

use crate::elementwise::broadcast_dims;
use crate::{EvalError, expect_arity, for_each_index, linear_of, normalize_index, params};
use lm_core::{DType, Literal, Primitive, Shape, TensorValue, Value, contiguous_strides};

fn require_int_indices(
    primitive: Primitive,
    indices: &[TensorValue],
) -> Result<(), EvalError> {
    for index in indices {
        if index.dtype != DType::I64 {
            return Err(EvalError::UnsupportedDType {
                primitive,
                dtype: index.dtype,
            });
        }
    }
    Ok(())
}

/// Broadcast every index tensor to the common shape.
fn broadcast_indices(
    primitive: Primitive,
    indices: &[TensorValue],
) -> Result<(Vec<usize>, Vec<TensorValue>), EvalError> {
    let mut dims: Vec<usize> = Vec::new();
    for index in indices {
        dims = broadcast_dims(primitive, &dims, index.dims())?;
    }
    let expanded = indices
        .iter()
        .map(|index| index.expand(&dims))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((dims, expanded))
}

fn mask_positions(
    primitive: Primitive,
    base: &TensorValue,
    mask: &TensorValue,
) -> Result<Vec<Vec<usize>>, EvalError> {
    if mask.rank() > base.rank() || mask.dims() != &base.dims()[..mask.rank()] {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!(
                "boolean mask shape {:?} must match the leading axes of {:?}",
                mask.dims(),
                base.dims()
            ),
        });
    }
    let mut positions = Vec::new();
    for_each_index(mask.dims(), |idx| {
        if mask.get(idx) == Literal::Bool(true) {
            positions.push(idx.to_vec());
        }
    });
    Ok(positions)
}

fn chain_select(base: &TensorValue, leading: &[usize]) -> Result<TensorValue, EvalError> {
    let mut view = base.clone();
    for &index in leading {
        view = view.select(0, index)?;
    }
    Ok(view)
}

pub(crate) fn eval_index(args: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::Index;
    if args.len() < 2 {
        return Err(EvalError::Arity {
            primitive,
            expected: "2 or more",
            actual: args.len(),
        });
    }
    let base = args[0].to_tensor();
    let indices: Vec<TensorValue> = args[1..].iter().map(Value::to_tensor).collect();

    // Single boolean mask over the leading axes.
    if indices.len() == 1 && indices[0].dtype == DType::Bool {
        let positions = mask_positions(primitive, &base, &indices[0])?;
        let rest = &base.dims()[indices[0].rank()..];
        let mut out_dims = vec![positions.len()];
        out_dims.extend_from_slice(rest);
        let mut elements = Vec::new();
        for position in &positions {
            elements.extend(chain_select(&base, position)?.elements());
        }
        return Ok(Value::Tensor(
            TensorValue::new(base.dtype, Shape::of(&out_dims), elements)?
                .with_requires_grad(base.requires_grad),
        ));
    }

    require_int_indices(primitive, &indices)?;
    if indices.len() > base.rank() {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!(
                "{} index tensors for base of rank {}",
                indices.len(),
                base.rank()
            ),
        });
    }
    let (bdims, expanded) = broadcast_indices(primitive, &indices)?;
    let bcount = bdims.iter().product::<usize>();
    let rest = &base.dims()[indices.len()..];
    let mut out_dims = bdims.clone();
    out_dims.extend_from_slice(rest);

    let mut elements = Vec::new();
    for linear in 0..bcount {
        let mut leading = Vec::with_capacity(expanded.len());
        for (axis, index) in expanded.iter().enumerate() {
            let raw = index.get_linear(linear).as_i64().unwrap_or_default();
            leading.push(normalize_index(primitive, raw, base.dims()[axis])?);
        }
        elements.extend(chain_select(&base, &leading)?.elements());
    }
    Ok(Value::Tensor(
        TensorValue::new(base.dtype, Shape::of(&out_dims), elements)?
            .with_requires_grad(base.requires_grad),
    ))
}

fn accumulate_or_assign(
    accumulate: bool,
    slot: &mut Literal,
    value: Literal,
) {
    if !accumulate {
        *slot = value;
        return;
    }
    *slot = match (*slot, value) {
        (Literal::I64(a), Literal::I64(b)) => Literal::I64(a + b),
        (a, b) => Literal::from_f64(
            a.as_f64().unwrap_or(f64::NAN) + b.as_f64().unwrap_or(f64::NAN),
        ),
    };
}

pub(crate) fn eval_index_put(
    args: &[Value],
    opts: &lm_core::OpParams,
) -> Result<Value, EvalError> {
    let primitive = Primitive::IndexPut;
    if args.len() < 3 {
        return Err(EvalError::Arity {
            primitive,
            expected: "3 or more",
            actual: args.len(),
        });
    }
    let base = args[0].to_tensor();
    let values = args[1].to_tensor();
    let indices: Vec<TensorValue> = args[2..].iter().map(Value::to_tensor).collect();
    let accumulate = params::bool_or(opts, "accumulate", false);

    let out_dims = base.dims().to_vec();
    let out_strides = contiguous_strides(&out_dims);
    let mut elements = base.elements();
    let requires_grad = base.requires_grad || values.requires_grad;

    if indices.len() == 1 && indices[0].dtype == DType::Bool {
        let positions = mask_positions(primitive, &base, &indices[0])?;
        let rest = &base.dims()[indices[0].rank()..];
        let mut target = vec![positions.len()];
        target.extend_from_slice(rest);
        let expanded = values.expand(&target)?;
        let rest_count = rest.iter().product::<usize>();
        for (row, position) in positions.iter().enumerate() {
            let head: usize = position
                .iter()
                .zip(out_strides.iter())
                .map(|(i, s)| i * s)
                .sum();
            for rest_linear in 0..rest_count {
                let value = expanded.get_linear(row * rest_count + rest_linear);
                accumulate_or_assign(accumulate, &mut elements[head + rest_linear], value);
            }
        }
        return Ok(Value::Tensor(
            TensorValue::new(base.dtype, Shape::of(&out_dims), elements)?
                .with_requires_grad(requires_grad),
        ));
    }

    require_int_indices(primitive, &indices)?;
    if indices.len() > base.rank() {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!(
                "{} index tensors for base of rank {}",
                indices.len(),
                base.rank()
            ),
        });
    }
    let (bdims, expanded_indices) = broadcast_indices(primitive, &indices)?;
    let bcount = bdims.iter().product::<usize>();
    let rest = &base.dims()[indices.len()..];
    let rest_count = rest.iter().product::<usize>();
    let mut target = bdims.clone();
    target.extend_from_slice(rest);
    let expanded_values = values.expand(&target)?;

    for linear in 0..bcount {
        let mut head = 0_usize;
        for (axis, index) in expanded_indices.iter().enumerate() {
            let raw = index.get_linear(linear).as_i64().unwrap_or_default();
            head += normalize_index(primitive, raw, base.dims()[axis])? * out_strides[axis];
        }
        for rest_linear in 0..rest_count {
            let value = expanded_values.get_linear(linear * rest_count + rest_linear);
            accumulate_or_assign(accumulate, &mut elements[head + rest_linear], value);
        }
    }
    Ok(Value::Tensor(
        TensorValue::new(base.dtype, Shape::of(&out_dims), elements)?
            .with_requires_grad(requires_grad),
    ))
}

pub(crate) fn eval_gather(args: &[Value], opts: &lm_core::OpParams) -> Result<Value, EvalError> {
    let primitive = Primitive::Gather;
    expect_arity(primitive, args, 2, "2")?;
    let base = args[0].to_tensor();
    let index = args[1].to_tensor();
    let dim = params::require_usize(primitive, opts, "dim")?;
    require_int_indices(primitive, std::slice::from_ref(&index))?;
    if index.rank() != base.rank() || dim >= base.rank() {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!(
                "gather dim {dim}, base {:?}, index {:?}",
                base.dims(),
                index.dims()
            ),
        });
    }
    for d in 0..base.rank() {
        if d != dim && index.dims()[d] > base.dims()[d] {
            return Err(EvalError::ShapeMismatch {
                primitive,
                detail: format!(
                    "index shape {:?} exceeds base {:?} on axis {d}",
                    index.dims(),
                    base.dims()
                ),
            });
        }
    }

    let mut elements = Vec::with_capacity(index.len());
    let mut first_err = None;
    for_each_index(index.dims(), |idx| {
        if first_err.is_some() {
            return;
        }
        let raw = index.get(idx).as_i64().unwrap_or_default();
        match normalize_index(primitive, raw, base.dims()[dim]) {
            Ok(i) => {
                let mut pos = idx.to_vec();
                pos[dim] = i;
                elements.push(base.get(&pos));
            }
            Err(err) => first_err = Some(err),
        }
    });
    if let Some(err) = first_err {
        return Err(err);
    }
    Ok(Value::Tensor(
        TensorValue::new(base.dtype, Shape::of(index.dims()), elements)?
            .with_requires_grad(base.requires_grad),
    ))
}

pub(crate) fn eval_scatter(
    primitive: Primitive,
    args: &[Value],
    opts: &lm_core::OpParams,
) -> Result<Value, EvalError> {
    expect_arity(primitive, args, 3, "3")?;
    let base = args[0].to_tensor();
    let index = args[1].to_tensor();
    let src = args[2].to_tensor();
    let dim = params::require_usize(primitive, opts, "dim")?;
    require_int_indices(primitive, std::slice::from_ref(&index))?;
    if index.rank() != base.rank() || index.dims() != src.dims() || dim >= base.rank() {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!(
                "dim {dim}, base {:?}, index {:?}, src {:?}",
                base.dims(),
                index.dims(),
                src.dims()
            ),
        });
    }
    for d in 0..base.rank() {
        if d != dim && index.dims()[d] > base.dims()[d] {
            return Err(EvalError::ShapeMismatch {
                primitive,
                detail: format!(
                    "index shape {:?} exceeds base {:?} on axis {d}",
                    index.dims(),
                    base.dims()
                ),
            });
        }
    }

    let accumulate = primitive == Primitive::ScatterAdd;
    let out_dims = base.dims().to_vec();
    let out_strides = contiguous_strides(&out_dims);
    let mut elements = base.elements();
    let mut first_err = None;
    for_each_index(index.dims(), |idx| {
        if first_err.is_some() {
            return;
        }
        let raw = index.get(idx).as_i64().unwrap_or_default();
        match normalize_index(primitive, raw, base.dims()[dim]) {
            Ok(i) => {
                let mut pos = idx.to_vec();
                pos[dim] = i;
                let linear: usize = pos
                    .iter()
                    .zip(out_strides.iter())
                    .map(|(p, s)| p * s)
                    .sum();
                accumulate_or_assign(accumulate, &mut elements[linear], src.get(idx));
            }
            Err(err) => first_err = Some(err),
        }
    });
    if let Some(err) = first_err {
        return Err(err);
    }
    let requires_grad = base.requires_grad || src.requires_grad;
    Ok(Value::Tensor(
        TensorValue::new(base.dtype, Shape::of(&out_dims), elements)?
            .with_requires_grad(requires_grad),
    ))
}

pub(crate) fn eval_index_select(
    args: &[Value],
    opts: &lm_core::OpParams,
) -> Result<Value, EvalError> {
    let primitive = Primitive::IndexSelect;
    expect_arity(primitive, args, 2, "2")?;
    let base = args[0].to_tensor();
    let index = args[1].to_tensor();
    let dim = params::require_usize(primitive, opts, "dim")?;
    require_int_indices(primitive, std::slice::from_ref(&index))?;
    if index.rank() != 1 || dim >= base.rank() {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!(
                "index_select dim {dim}, base {:?}, index {:?}",
                base.dims(),
                index.dims()
            ),
        });
    }

    let mut parts = Vec::with_capacity(index.len());
    for linear in 0..index.len() {
        let raw = index.get_linear(linear).as_i64().unwrap_or_default();
        let i = normalize_index(primitive, raw, base.dims()[dim])?;
        parts.push(base.select(dim, i)?);
    }
    let stacked = TensorValue::stack_axis0(&parts)?;
    Ok(Value::Tensor(stacked.movedim(0, dim)?))
}

pub(crate) fn eval_index_add(
    args: &[Value],
    opts: &lm_core::OpParams,
) -> Result<Value, EvalError> {
    let primitive = Primitive::IndexAdd;
    expect_arity(primitive, args, 3, "3")?;
    let base = args[0].to_tensor();
    let index = args[1].to_tensor();
    let source = args[2].to_tensor();
    let dim = params::require_usize(primitive, opts, "dim")?;
    require_int_indices(primitive, std::slice::from_ref(&index))?;
    let valid = index.rank() == 1
        && dim < base.rank()
        && source.rank() == base.rank()
        && source.dims()[dim] == index.len()
        && source
            .dims()
            .iter()
            .enumerate()
            .all(|(d, &size)| d == dim || size == base.dims()[d]);
    if !valid {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!(
                "index_add dim {dim}, base {:?}, index {:?}, source {:?}",
                base.dims(),
                index.dims(),
                source.dims()
            ),
        });
    }

    let out_dims = base.dims().to_vec();
    let out_strides = contiguous_strides(&out_dims);
    let mut elements = base.elements();
    for j in 0..index.len() {
        let raw = index.get_linear(j).as_i64().unwrap_or_default();
        let i = normalize_index(primitive, raw, base.dims()[dim])?;
        let slice = source.select(dim, j)?;
        for_each_index(slice.dims(), |idx| {
            let mut pos = Vec::with_capacity(out_dims.len());
            let mut it = idx.iter();
            for d in 0..out_dims.len() {
                if d == dim {
                    pos.push(i);
                } else {
                    pos.push(*it.next().expect("slice index covers other axes"));
                }
            }
            let linear: usize = pos
                .iter()
                .zip(out_strides.iter())
                .map(|(p, s)| p * s)
                .sum();
            accumulate_or_assign(true, &mut elements[linear], slice.get(idx));
        });
    }
    let requires_grad = base.requires_grad || source.requires_grad;
    Ok(Value::Tensor(
        TensorValue::new(base.dtype, Shape::of(&out_dims), elements)?
            .with_requires_grad(requires_grad),
    ))
}

#[cfg(test)]
mod tests {
    use crate::eval_primitive;
    use lm_core::{DType, Literal, OpParams, Primitive, Shape, TensorValue, Value};

    fn t_f64(dims: &[usize], values: &[f64]) -> Value {
        Value::Tensor(TensorValue::from_f64_slice(dims, values).expect("tensor"))
    }

    fn t_i64(dims: &[usize], values: &[i64]) -> Value {
        Value::Tensor(TensorValue::from_i64_slice(dims, values).expect("tensor"))
    }

    fn t_bool(dims: &[usize], values: &[bool]) -> Value {
        Value::Tensor(
            TensorValue::new(
                DType::Bool,
                Shape::of(dims),
                values.iter().copied().map(Literal::Bool).collect(),
            )
            .expect("tensor"),
        )
    }

    fn dim(d: usize) -> OpParams {
        let mut params = OpParams::new();
        params.insert("dim".to_owned(), d.to_string());
        params
    }

    #[test]
    fn index_with_single_integer_tensor() {
        let base = t_f64(&[3, 2], &[0.0, 1.0, 10.0, 11.0, 20.0, 21.0]);
        let idx = t_i64(&[2], &[2, 0]);
        let out = eval_primitive(Primitive::Index, &[base, idx], &OpParams::new()).expect("index");
        assert_eq!(out.dims(), &[2, 2]);
        assert_eq!(
            out.as_tensor().expect("tensor").to_f64_vec(),
            Some(vec![20.0, 21.0, 0.0, 1.0])
        );
    }

    #[test]
    fn index_with_two_broadcast_index_tensors() {
        let base = t_f64(&[2, 2], &[0.0, 1.0, 10.0, 11.0]);
        let rows = t_i64(&[2], &[0, 1]);
        let cols = t_i64(&[2], &[1, 0]);
        let out =
            eval_primitive(Primitive::Index, &[base, rows, cols], &OpParams::new()).expect("index");
        assert_eq!(out.dims(), &[2]);
        assert_eq!(
            out.as_tensor().expect("tensor").to_f64_vec(),
            Some(vec![1.0, 10.0])
        );
    }

    #[test]
    fn index_negative_indices_wrap() {
        let base = t_f64(&[3], &[1.0, 2.0, 3.0]);
        let idx = t_i64(&[1], &[-1]);
        let out = eval_primitive(Primitive::Index, &[base, idx], &OpParams::new()).expect("index");
        assert_eq!(
            out.as_tensor().expect("tensor").to_f64_vec(),
            Some(vec![3.0])
        );
    }

    #[test]
    fn index_with_boolean_mask_compacts_rows() {
        let base = t_f64(&[3, 2], &[0.0, 1.0, 10.0, 11.0, 20.0, 21.0]);
        let mask = t_bool(&[3], &[true, false, true]);
        let out = eval_primitive(Primitive::Index, &[base, mask], &OpParams::new()).expect("index");
        assert_eq!(out.dims(), &[2, 2]);
        assert_eq!(
            out.as_tensor().expect("tensor").to_f64_vec(),
            Some(vec![0.0, 1.0, 20.0, 21.0])
        );
    }

    #[test]
    fn index_put_assigns_and_accumulates() {
        let base = t_f64(&[3], &[1.0, 2.0, 3.0]);
        let idx = t_i64(&[2], &[0, 0]);
        let values = t_f64(&[2], &[5.0, 7.0]);

        let assigned = eval_primitive(
            Primitive::IndexPut,
            &[base.clone(), values.clone(), idx.clone()],
            &OpParams::new(),
        )
        .expect("index_put");
        assert_eq!(
            assigned.as_tensor().expect("tensor").to_f64_vec(),
            Some(vec![7.0, 2.0, 3.0])
        );

        let mut params = OpParams::new();
        params.insert("accumulate".to_owned(), "true".to_owned());
        let accumulated =
            eval_primitive(Primitive::IndexPut, &[base, values, idx], &params)
                .expect("index_put accumulate");
        assert_eq!(
            accumulated.as_tensor().expect("tensor").to_f64_vec(),
            Some(vec![13.0, 2.0, 3.0])
        );
    }

    #[test]
    fn gather_along_dim_one() {
        let base = t_f64(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let index = t_i64(&[2, 2], &[0, 0, 1, 0]);
        let out = eval_primitive(Primitive::Gather, &[base, index], &dim(1)).expect("gather");
        assert_eq!(
            out.as_tensor().expect("tensor").to_f64_vec(),
            Some(vec![1.0, 1.0, 4.0, 3.0])
        );
    }

    #[test]
    fn scatter_writes_src_positions() {
        let base = t_f64(&[1, 4], &[0.0, 0.0, 0.0, 0.0]);
        let index = t_i64(&[1, 2], &[3, 1]);
        let src = t_f64(&[1, 2], &[9.0, 8.0]);
        let out =
            eval_primitive(Primitive::Scatter, &[base, index, src], &dim(1)).expect("scatter");
        assert_eq!(
            out.as_tensor().expect("tensor").to_f64_vec(),
            Some(vec![0.0, 8.0, 0.0, 9.0])
        );
    }

    #[test]
    fn scatter_add_accumulates_collisions() {
        let base = t_f64(&[1, 2], &[0.0, 0.0]);
        let index = t_i64(&[1, 2], &[0, 0]);
        let src = t_f64(&[1, 2], &[3.0, 4.0]);
        let out = eval_primitive(Primitive::ScatterAdd, &[base, index, src], &dim(1))
            .expect("scatter_add");
        assert_eq!(
            out.as_tensor().expect("tensor").to_f64_vec(),
            Some(vec![7.0, 0.0])
        );
    }

    #[test]
    fn index_select_picks_rows() {
        let base = t_f64(&[3, 2], &[0.0, 1.0, 10.0, 11.0, 20.0, 21.0]);
        let index = t_i64(&[2], &[2, 2]);
        let out = eval_primitive(Primitive::IndexSelect, &[base, index], &dim(0))
            .expect("index_select");
        assert_eq!(out.dims(), &[2, 2]);
        assert_eq!(
            out.as_tensor().expect("tensor").to_f64_vec(),
            Some(vec![20.0, 21.0, 20.0, 21.0])
        );
    }

    #[test]
    fn index_add_accumulates_rows() {
        let base = t_f64(&[3, 2], &[0.0; 6]);
        let index = t_i64(&[2], &[1, 1]);
        let source = t_f64(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let out = eval_primitive(Primitive::IndexAdd, &[base, index, source], &dim(0))
            .expect("index_add");
        assert_eq!(
            out.as_tensor().expect("tensor").to_f64_vec(),
            Some(vec![0.0, 0.0, 4.0, 6.0, 0.0, 0.0])
        );
    }

    #[test]
    fn index_rejects_out_of_bounds() {
        let base = t_f64(&[2], &[1.0, 2.0]);
        let idx = t_i64(&[1], &[5]);
        assert!(eval_primitive(Primitive::Index, &[base, idx], &OpParams::new()).is_err());
    }
}
