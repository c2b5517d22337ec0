//! Batching rules for the normalization family.
//!
//! Two fold patterns cover the family: `batch_norm` folds the batch axis
//! into the channel axis so per-channel statistics become per-(element,
//! channel) statistics, and `group_norm` folds it into the leading sample
//! axis, changing the per-sample statistics count. Optional affine
//! parameters are applied after the primitive, padded to the result's
//! logical rank; a paired running mean/var must agree on being batched.

use crate::{
    BatchRuleRegistry, BatchedArg, DispatchCtx, DispatchError, RuleEntry, RuleResult,
    common_batch_size,
};
use lm_batch::TracedValue;
use lm_core::{OpParams, Primitive};
use lm_ops::params;

pub(crate) fn register(registry: &mut BatchRuleRegistry) {
    registry.register(Primitive::BatchNorm, RuleEntry::Rule(batch_norm));
    registry.register(Primitive::GroupNorm, RuleEntry::Rule(group_norm));
}

struct NormArgs<'a> {
    input: &'a BatchedArg,
    weight: Option<&'a BatchedArg>,
    bias: Option<&'a BatchedArg>,
    running_mean: Option<&'a BatchedArg>,
    running_var: Option<&'a BatchedArg>,
}

fn split_batch_norm_args<'a>(
    primitive: Primitive,
    args: &'a [BatchedArg],
    opts: &OpParams,
) -> Result<NormArgs<'a>, DispatchError> {
    match args.len() {
        1 => Ok(NormArgs {
            input: &args[0],
            weight: None,
            bias: None,
            running_mean: None,
            running_var: None,
        }),
        3 if params::bool_or(opts, "affine", false) => Ok(NormArgs {
            input: &args[0],
            weight: Some(&args[1]),
            bias: Some(&args[2]),
            running_mean: None,
            running_var: None,
        }),
        3 => Ok(NormArgs {
            input: &args[0],
            weight: None,
            bias: None,
            running_mean: Some(&args[1]),
            running_var: Some(&args[2]),
        }),
        5 => Ok(NormArgs {
            input: &args[0],
            weight: Some(&args[1]),
            bias: Some(&args[2]),
            running_mean: Some(&args[3]),
            running_var: Some(&args[4]),
        }),
        actual => Err(DispatchError::Eval(lm_ops::EvalError::Arity {
            primitive,
            expected: "1, 3, or 5",
            actual,
        })),
    }
}

/// Pad an affine parameter (logical `[C]`) to broadcast per-channel against
/// a result of logical rank `result_logical_rank`: one leading sample axis,
/// trailing spatial axes, batch axis kept leading when present.
fn broadcast_affine(
    ctx: &DispatchCtx<'_>,
    arg: &BatchedArg,
    result_logical_rank: usize,
) -> Result<TracedValue, DispatchError> {
    let has_bdim = arg.bdim.is_some();
    let mut value = ctx.unsqueeze(arg.value.clone(), usize::from(has_bdim))?;
    while value.logical_rank()?.saturating_sub(usize::from(has_bdim)) < result_logical_rank {
        value = ctx.unsqueeze_last(value)?;
    }
    Ok(value)
}

fn batch_norm(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let norm = split_batch_norm_args(primitive, args, opts)?;
    let input = norm.input;

    let stats_batched = match (norm.running_mean, norm.running_var) {
        (Some(mean), Some(var)) => {
            if mean.bdim.is_some() != var.bdim.is_some() {
                return Err(DispatchError::RunningStatsMismatch);
            }
            mean.bdim.is_some()
        }
        (None, None) => false,
        _ => unreachable!("running stats are split as a pair"),
    };
    if input.bdim.is_some() && norm.running_mean.is_some() && !stats_batched {
        return Err(DispatchError::UnbatchedRunningStats);
    }

    let refs: Vec<&BatchedArg> = args.iter().collect();
    let batch_size = common_batch_size(primitive, &refs)?;
    let input_logical_rank = input.rank_without_bdim()?;

    // Fold the batch axis into the channel axis; statistics then come out
    // per (batch element, channel).
    let mut input_ = input.value.clone();
    let mut input_batched = input.bdim.is_some();
    if !input_batched && stats_batched {
        let batch_size = batch_size.ok_or(DispatchError::MalformedBatchedOperand {
            primitive,
            detail: "batched running stats without a batch size".to_owned(),
        })?;
        input_ = ctx.ensure_has_bdim(input_, false, batch_size)?;
        input_batched = true;
    }
    if input_batched {
        input_ = ctx.reshape_dim_into(0, 1, input_)?;
    }

    let mut inner_args = vec![input_];
    if let (Some(mean), Some(var)) = (norm.running_mean, norm.running_var) {
        for stat in [mean, var] {
            let flattened = if stats_batched {
                ctx.reshape_dim_into(0, 0, stat.value.clone())?
            } else {
                stat.value.clone()
            };
            inner_args.push(flattened);
        }
    }
    let mut inner_opts = opts.clone();
    inner_opts.remove("affine");
    let mut result = ctx.call(primitive, &inner_args, &inner_opts)?;

    // Unfold (N, B*C, ...) back into (B, N, C, ...).
    if input_batched {
        let batch_size = batch_size.ok_or(DispatchError::MalformedBatchedOperand {
            primitive,
            detail: "batched input without a batch size".to_owned(),
        })?;
        result = ctx.reshape_dim_outof(1, batch_size, result)?;
        result = ctx.movedim(result, 1, 0)?;
    }

    let mut result_batched = input_batched;
    if let Some(weight) = norm.weight {
        let weight_ = broadcast_affine(ctx, weight, input_logical_rank)?;
        result = ctx.call(Primitive::Mul, &[result, weight_], &OpParams::new())?;
        result_batched |= weight.bdim.is_some();
    }
    if let Some(bias) = norm.bias {
        let bias_ = broadcast_affine(ctx, bias, input_logical_rank)?;
        result = ctx.call(Primitive::Add, &[result, bias_], &OpParams::new())?;
        result_batched |= bias.bdim.is_some();
    }

    Ok(RuleResult {
        value: result,
        bdim: result_batched.then_some(0),
    })
}

fn group_norm(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let (input, weight, bias) = match args {
        [input] => (input, None, None),
        [input, weight, bias] => (input, Some(weight), Some(bias)),
        _ => {
            return Err(DispatchError::Eval(lm_ops::EvalError::Arity {
                primitive,
                expected: "1 or 3",
                actual: args.len(),
            }));
        }
    };
    let input_logical_rank = input.rank_without_bdim()?;
    let refs: Vec<&BatchedArg> = args.iter().collect();
    let batch_size = common_batch_size(primitive, &refs)?;

    // Fold the batch axis into the leading sample axis: the per-sample
    // statistics count changes from N to B*N.
    let mut result = if input.bdim.is_some() {
        let batch_size = batch_size.ok_or(DispatchError::MalformedBatchedOperand {
            primitive,
            detail: "batched input without a batch size".to_owned(),
        })?;
        let folded = ctx.reshape_dim_into(0, 0, input.value.clone())?;
        let inner = ctx.call(primitive, std::slice::from_ref(&folded), opts)?;
        ctx.reshape_dim_outof(0, batch_size, inner)?
    } else {
        ctx.call(primitive, std::slice::from_ref(&input.value), opts)?
    };

    let mut result_batched = input.bdim.is_some();
    if let Some(weight) = weight {
        let weight_ = broadcast_affine(ctx, weight, input_logical_rank)?;
        result = ctx.call(Primitive::Mul, &[result, weight_], &OpParams::new())?;
        result_batched |= weight.bdim.is_some();
    }
    if let Some(bias) = bias {
        let bias_ = broadcast_affine(ctx, bias, input_logical_rank)?;
        result = ctx.call(Primitive::Add, &[result, bias_], &OpParams::new())?;
        result_batched |= bias.bdim.is_some();
    }

    Ok(RuleResult {
        value: result,
        bdim: result_batched.then_some(0),
    })
}
