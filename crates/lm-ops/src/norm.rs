//! Normalization primitives.
//!
//! Operand conventions (arity encodes the overload):
//! - `batch_norm`: [input] | [input, weight, bias] (param `affine=true`) |
//!   [input, running_mean, running_var] | [input, weight, bias,
//!   running_mean, running_var]. Params: `training` (default true), `eps`.
//! - `group_norm`: [input] | [input, weight, bias]. Params: `num_groups`,
//!   `eps`.
//!
//! Input layout is (N, C, spatial...). Outputs are f64; running statistics
//! are consumed, never updated (storage is immutable here).

use crate::{EvalError, for_each_index, linear_of, params};
use lm_core::{DType, Literal, Primitive, Shape, TensorValue, Value};

struct NormOperands {
    input: TensorValue,
    weight: Option<TensorValue>,
    bias: Option<TensorValue>,
    running_mean: Option<TensorValue>,
    running_var: Option<TensorValue>,
}

fn split_batch_norm_operands(
    args: &[Value],
    opts: &lm_core::OpParams,
) -> Result<NormOperands, EvalError> {
    let primitive = Primitive::BatchNorm;
    let tensors: Vec<TensorValue> = args.iter().map(Value::to_tensor).collect();
    match tensors.len() {
        1 => Ok(NormOperands {
            input: tensors[0].clone(),
            weight: None,
            bias: None,
            running_mean: None,
            running_var: None,
        }),
        3 if params::bool_or(opts, "affine", false) => Ok(NormOperands {
            input: tensors[0].clone(),
            weight: Some(tensors[1].clone()),
            bias: Some(tensors[2].clone()),
            running_mean: None,
            running_var: None,
        }),
        3 => Ok(NormOperands {
            input: tensors[0].clone(),
            weight: None,
            bias: None,
            running_mean: Some(tensors[1].clone()),
            running_var: Some(tensors[2].clone()),
        }),
        5 => Ok(NormOperands {
            input: tensors[0].clone(),
            weight: Some(tensors[1].clone()),
            bias: Some(tensors[2].clone()),
            running_mean: Some(tensors[3].clone()),
            running_var: Some(tensors[4].clone()),
        }),
        actual => Err(EvalError::Arity {
            primitive,
            expected: "1, 3, or 5",
            actual,
        }),
    }
}

fn f64_at(primitive: Primitive, t: &TensorValue, idx: &[usize]) -> Result<f64, EvalError> {
    t.get(idx).as_f64().ok_or(EvalError::UnsupportedDType {
        primitive,
        dtype: t.dtype,
    })
}

fn check_param_shape(
    primitive: Primitive,
    name: &str,
    param: &TensorValue,
    channels: usize,
) -> Result<(), EvalError> {
    if param.dims() != [channels] {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!(
                "{name} shape {:?} does not match channel count {channels}",
                param.dims()
            ),
        });
    }
    Ok(())
}

pub(crate) fn eval_batch_norm(
    args: &[Value],
    opts: &lm_core::OpParams,
) -> Result<Value, EvalError> {
    let primitive = Primitive::BatchNorm;
    let operands = split_batch_norm_operands(args, opts)?;
    let input = &operands.input;
    let training = params::bool_or(opts, "training", true);
    let eps = params::f64_or(primitive, opts, "eps", 1e-5)?;

    if input.rank() < 2 {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!("batch_norm input must be (N, C, ...), got {:?}", input.dims()),
        });
    }
    if input.dtype == DType::Bool {
        return Err(EvalError::UnsupportedDType {
            primitive,
            dtype: DType::Bool,
        });
    }
    let channels = input.dims()[1];
    for (name, param) in [
        ("weight", operands.weight.as_ref()),
        ("bias", operands.bias.as_ref()),
        ("running_mean", operands.running_mean.as_ref()),
        ("running_var", operands.running_var.as_ref()),
    ] {
        if let Some(param) = param {
            check_param_shape(primitive, name, param, channels)?;
        }
    }

    let (mean, var) = if training {
        per_channel_stats(primitive, input, channels)?
    } else {
        let running_mean = operands.running_mean.as_ref().ok_or(EvalError::ShapeMismatch {
            primitive,
            detail: "eval-mode batch_norm requires running statistics".to_owned(),
        })?;
        let running_var = operands.running_var.as_ref().ok_or(EvalError::ShapeMismatch {
            primitive,
            detail: "eval-mode batch_norm requires running statistics".to_owned(),
        })?;
        let mut mean = Vec::with_capacity(channels);
        let mut var = Vec::with_capacity(channels);
        for c in 0..channels {
            mean.push(f64_at(primitive, running_mean, &[c])?);
            var.push(f64_at(primitive, running_var, &[c])?);
        }
        (mean, var)
    };

    normalize_per_group(
        primitive,
        input,
        |idx| idx[1],
        &mean,
        &var,
        eps,
        operands.weight.as_ref(),
        operands.bias.as_ref(),
    )
}

fn per_channel_stats(
    primitive: Primitive,
    input: &TensorValue,
    channels: usize,
) -> Result<(Vec<f64>, Vec<f64>), EvalError> {
    let mut sum = vec![0.0_f64; channels];
    let mut sum_sq = vec![0.0_f64; channels];
    let mut count = vec![0_usize; channels];
    let mut first_err = None;
    for_each_index(input.dims(), |idx| {
        if first_err.is_some() {
            return;
        }
        match f64_at(primitive, input, idx) {
            Ok(x) => {
                let c = idx[1];
                sum[c] += x;
                sum_sq[c] += x * x;
                count[c] += 1;
            }
            Err(err) => first_err = Some(err),
        }
    });
    if let Some(err) = first_err {
        return Err(err);
    }
    let mut mean = vec![0.0_f64; channels];
    let mut var = vec![0.0_f64; channels];
    for c in 0..channels {
        let n = count[c].max(1) as f64;
        mean[c] = sum[c] / n;
        var[c] = sum_sq[c] / n - mean[c] * mean[c];
    }
    Ok((mean, var))
}

/// Normalize every element against its group's statistics, then apply
/// per-channel affine parameters when present.
#[allow(clippy::too_many_arguments)]
fn normalize_per_group(
    primitive: Primitive,
    input: &TensorValue,
    group_of: impl Fn(&[usize]) -> usize,
    mean: &[f64],
    var: &[f64],
    eps: f64,
    weight: Option<&TensorValue>,
    bias: Option<&TensorValue>,
) -> Result<Value, EvalError> {
    let out_dims = input.dims().to_vec();
    let mut elements = vec![Literal::from_f64(0.0); input.len()];
    let mut first_err = None;
    for_each_index(input.dims(), |idx| {
        if first_err.is_some() {
            return;
        }
        let result = (|| -> Result<Literal, EvalError> {
            let x = f64_at(primitive, input, idx)?;
            let g = group_of(idx);
            let mut y = (x - mean[g]) / (var[g] + eps).sqrt();
            let c = idx[1];
            if let Some(weight) = weight {
                y *= f64_at(primitive, weight, &[c])?;
            }
            if let Some(bias) = bias {
                y += f64_at(primitive, bias, &[c])?;
            }
            Ok(Literal::from_f64(y))
        })();
        match result {
            Ok(lit) => elements[linear_of(idx, &out_dims)] = lit,
            Err(err) => first_err = Some(err),
        }
    });
    if let Some(err) = first_err {
        return Err(err);
    }
    let requires_grad = input.requires_grad
        || weight.is_some_and(|w| w.requires_grad)
        || bias.is_some_and(|b| b.requires_grad);
    Ok(Value::Tensor(
        TensorValue::new(DType::F64, Shape::of(&out_dims), elements)?
            .with_requires_grad(requires_grad),
    ))
}

pub(crate) fn eval_group_norm(
    args: &[Value],
    opts: &lm_core::OpParams,
) -> Result<Value, EvalError> {
    let primitive = Primitive::GroupNorm;
    let tensors: Vec<TensorValue> = args.iter().map(Value::to_tensor).collect();
    let (input, weight, bias) = match tensors.as_slice() {
        [input] => (input.clone(), None, None),
        [input, weight, bias] => (input.clone(), Some(weight.clone()), Some(bias.clone())),
        _ => {
            return Err(EvalError::Arity {
                primitive,
                expected: "1 or 3",
                actual: tensors.len(),
            });
        }
    };
    let num_groups = params::require_usize(primitive, opts, "num_groups")?;
    let eps = params::f64_or(primitive, opts, "eps", 1e-5)?;

    if input.rank() < 2 {
        return Err(EvalError::ShapeMismatch {
            primitive,
            detail: format!("group_norm input must be (N, C, ...), got {:?}", input.dims()),
        });
    }
    let (samples, channels) = (input.dims()[0], input.dims()[1]);
    if num_groups == 0 || channels % num_groups != 0 {
        return Err(EvalError::InvalidParam {
            primitive,
            key: "num_groups",
            value: num_groups.to_string(),
        });
    }
    for (name, param) in [("weight", weight.as_ref()), ("bias", bias.as_ref())] {
        if let Some(param) = param {
            check_param_shape(primitive, name, param, channels)?;
        }
    }

    let channels_per_group = channels / num_groups;
    let group_count = samples * num_groups;
    let mut sum = vec![0.0_f64; group_count];
    let mut sum_sq = vec![0.0_f64; group_count];
    let mut count = vec![0_usize; group_count];
    let group_of = |idx: &[usize]| idx[0] * num_groups + idx[1] / channels_per_group;
    let mut first_err = None;
    for_each_index(input.dims(), |idx| {
        if first_err.is_some() {
            return;
        }
        match f64_at(primitive, &input, idx) {
            Ok(x) => {
                let g = group_of(idx);
                sum[g] += x;
                sum_sq[g] += x * x;
                count[g] += 1;
            }
            Err(err) => first_err = Some(err),
        }
    });
    if let Some(err) = first_err {
        return Err(err);
    }
    let mut mean = vec![0.0_f64; group_count];
    let mut var = vec![0.0_f64; group_count];
    for g in 0..group_count {
        let n = count[g].max(1) as f64;
        mean[g] = sum[g] / n;
        var[g] = sum_sq[g] / n - mean[g] * mean[g];
    }

    normalize_per_group(
        primitive,
        &input,
        group_of,
        &mean,
        &var,
        eps,
        weight.as_ref(),
        bias.as_ref(),
    )
}
