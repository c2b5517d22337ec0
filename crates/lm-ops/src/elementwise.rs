//! Elementwise primitives with trailing-aligned broadcasting.

use crate::{EvalError, expect_arity};
use lm_core::{DType, Literal, Primitive, Shape, TensorValue, Value};

/// Broadcast two dim lists, aligning from the trailing dimension.
pub(crate) fn broadcast_dims(
    primitive: Primitive,
    a: &[usize],
    b: &[usize],
) -> Result<Vec<usize>, EvalError> {
    let rank = a.len().max(b.len());
    let mut out = vec![0_usize; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return Err(EvalError::ShapeMismatch {
                primitive,
                detail: format!("cannot broadcast {a:?} with {b:?}"),
            });
        };
    }
    Ok(out)
}

fn tensor_result(
    was_scalar: bool,
    dtype: DType,
    dims: &[usize],
    elements: Vec<Literal>,
    requires_grad: bool,
) -> Result<Value, EvalError> {
    if was_scalar {
        return Ok(Value::Scalar(elements[0]));
    }
    Ok(Value::Tensor(
        TensorValue::new(dtype, Shape::of(dims), elements)?.with_requires_grad(requires_grad),
    ))
}

pub(crate) fn eval_unary(primitive: Primitive, args: &[Value]) -> Result<Value, EvalError> {
    expect_arity(primitive, args, 1, "1")?;
    let input = &args[0];
    let t = input.to_tensor();
    if t.dtype == DType::Bool {
        return Err(EvalError::UnsupportedDType {
            primitive,
            dtype: DType::Bool,
        });
    }

    // Neg/Abs/Sign/Square preserve integer dtype; the transcendentals promote.
    let integral = t.dtype == DType::I64
        && matches!(
            primitive,
            Primitive::Neg | Primitive::Abs | Primitive::Sign | Primitive::Square
        );

    let n = t.len();
    let mut elements = Vec::with_capacity(n);
    for linear in 0..n {
        let lit = t.get_linear(linear);
        let out = if integral {
            let x = lit.as_i64().ok_or(EvalError::UnsupportedDType {
                primitive,
                dtype: lit.dtype(),
            })?;
            Literal::I64(match primitive {
                Primitive::Neg => -x,
                Primitive::Abs => x.abs(),
                Primitive::Sign => x.signum(),
                Primitive::Square => x * x,
                _ => unreachable!("integral set covers only these"),
            })
        } else {
            let x = lit.as_f64().ok_or(EvalError::UnsupportedDType {
                primitive,
                dtype: lit.dtype(),
            })?;
            Literal::from_f64(match primitive {
                Primitive::Neg => -x,
                Primitive::Abs => x.abs(),
                Primitive::Exp => x.exp(),
                Primitive::Log => x.ln(),
                Primitive::Sqrt => x.sqrt(),
                Primitive::Sin => x.sin(),
                Primitive::Cos => x.cos(),
                Primitive::Tanh => x.tanh(),
                Primitive::Sign => {
                    if x > 0.0 {
                        1.0
                    } else if x < 0.0 {
                        -1.0
                    } else {
                        x
                    }
                }
                Primitive::Square => x * x,
                _ => unreachable!("unary dispatch covers only these"),
            })
        };
        elements.push(out);
    }

    let dtype = if integral { DType::I64 } else { DType::F64 };
    tensor_result(
        matches!(input, Value::Scalar(_)),
        dtype,
        t.dims(),
        elements,
        t.requires_grad,
    )
}

pub(crate) fn eval_binary(primitive: Primitive, args: &[Value]) -> Result<Value, EvalError> {
    expect_arity(primitive, args, 2, "2")?;
    let (lhs, rhs) = (&args[0], &args[1]);
    let (ta, tb) = (lhs.to_tensor(), rhs.to_tensor());

    let comparison = matches!(primitive, Primitive::Eq | Primitive::Lt);
    if !comparison && (ta.dtype == DType::Bool || tb.dtype == DType::Bool) {
        return Err(EvalError::UnsupportedDType {
            primitive,
            dtype: DType::Bool,
        });
    }
    if primitive == Primitive::Lt && (ta.dtype == DType::Bool || tb.dtype == DType::Bool) {
        return Err(EvalError::UnsupportedDType {
            primitive,
            dtype: DType::Bool,
        });
    }

    let dims = broadcast_dims(primitive, ta.dims(), tb.dims())?;
    let ea = ta.expand(&dims)?;
    let eb = tb.expand(&dims)?;

    // Integer arithmetic only when both sides are integral and the op is
    // closed over the integers; Div and Pow always promote.
    let integral = ta.dtype == DType::I64
        && tb.dtype == DType::I64
        && matches!(
            primitive,
            Primitive::Add | Primitive::Sub | Primitive::Mul | Primitive::Max | Primitive::Min
        );

    let n = ea.len();
    let mut elements = Vec::with_capacity(n);
    for linear in 0..n {
        let (la, lb) = (ea.get_linear(linear), eb.get_linear(linear));
        let out = if comparison {
            match (la, lb) {
                (Literal::Bool(x), Literal::Bool(y)) => Literal::Bool(x == y),
                _ => {
                    let (x, y) = numeric_pair(primitive, la, lb)?;
                    Literal::Bool(match primitive {
                        Primitive::Eq => x == y,
                        Primitive::Lt => x < y,
                        _ => unreachable!("comparison covers eq/lt"),
                    })
                }
            }
        } else if integral {
            let x = la.as_i64().ok_or(EvalError::UnsupportedDType {
                primitive,
                dtype: la.dtype(),
            })?;
            let y = lb.as_i64().ok_or(EvalError::UnsupportedDType {
                primitive,
                dtype: lb.dtype(),
            })?;
            Literal::I64(match primitive {
                Primitive::Add => x + y,
                Primitive::Sub => x - y,
                Primitive::Mul => x * y,
                Primitive::Max => x.max(y),
                Primitive::Min => x.min(y),
                _ => unreachable!("integral set covers only these"),
            })
        } else {
            let (x, y) = numeric_pair(primitive, la, lb)?;
            Literal::from_f64(match primitive {
                Primitive::Add => x + y,
                Primitive::Sub => x - y,
                Primitive::Mul => x * y,
                Primitive::Div => x / y,
                Primitive::Pow => x.powf(y),
                Primitive::Max => x.max(y),
                Primitive::Min => x.min(y),
                _ => unreachable!("binary dispatch covers only these"),
            })
        };
        elements.push(out);
    }

    let dtype = if comparison {
        DType::Bool
    } else if integral {
        DType::I64
    } else {
        DType::F64
    };
    let requires_grad = !comparison && (ta.requires_grad || tb.requires_grad);
    tensor_result(
        matches!(lhs, Value::Scalar(_)) && matches!(rhs, Value::Scalar(_)),
        dtype,
        &dims,
        elements,
        requires_grad,
    )
}

fn numeric_pair(
    primitive: Primitive,
    a: Literal,
    b: Literal,
) -> Result<(f64, f64), EvalError> {
    let x = a.as_f64().ok_or(EvalError::UnsupportedDType {
        primitive,
        dtype: a.dtype(),
    })?;
    let y = b.as_f64().ok_or(EvalError::UnsupportedDType {
        primitive,
        dtype: b.dtype(),
    })?;
    Ok((x, y))
}
