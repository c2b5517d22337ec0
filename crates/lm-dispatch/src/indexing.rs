//! Batching rules for the index / scatter / gather family.
//!
//! The composite case: when the base and any index tensor are both batched,
//! a synthetic `arange(batch_size)` index is prepended (broadcast to the
//! rank of the widest index) so each batch slice of the base indexes only
//! its own slice: batched indexing becomes one extra leading index
//! dimension over the unbatched primitive. Batched boolean masks are
//! rejected outright: a per-batch-varying mask yields per-element shapes
//! that one array cannot represent.

use crate::{
    BatchRuleRegistry, BatchedArg, DispatchCtx, DispatchError, RuleEntry, RuleResult,
    common_batch_size,
};
use lm_batch::{TracedValue, dtype_of};
use lm_core::{DType, OpParams, Primitive};
use lm_ops::params;

pub(crate) fn register(registry: &mut BatchRuleRegistry) {
    use Primitive as P;
    registry.register(P::Index, RuleEntry::Rule(index));
    registry.register(P::IndexPut, RuleEntry::Rule(index_put));
    registry.register(P::Gather, RuleEntry::Rule(gather));
    registry.register(P::Scatter, RuleEntry::Rule(scatter));
    registry.register(P::ScatterAdd, RuleEntry::Rule(scatter));
    registry.register(P::IndexAdd, RuleEntry::Rule(index_add));
    registry.register(P::IndexSelect, RuleEntry::Decompose(index_select_decompose));
}

/// Build the physical index list for a batched `index`/`index_put` call.
///
/// Index operands arrive batch-axis-front. Batched indices are padded with
/// size-1 axes directly after the batch axis so that axis broadcasts against
/// the other indices as a leading dimension; when the base itself is
/// batched, the `arange` index is prepended at the same rank.
fn batch_indices(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    index_args: &[BatchedArg],
    batch_size: usize,
    base_batched: bool,
) -> Result<Vec<TracedValue>, DispatchError> {
    let mut max_logical = 0;
    for arg in index_args {
        if dtype_of(&arg.value) == DType::Bool && arg.bdim.is_some() {
            return Err(DispatchError::BatchedBooleanMask { primitive });
        }
        max_logical = max_logical.max(arg.rank_without_bdim()?);
    }

    let mut indices = Vec::with_capacity(index_args.len() + 1);
    for arg in index_args {
        let mut value = arg.value.clone();
        if arg.bdim.is_some() {
            // (B, k...) -> (B, 1..., k...): the batch axis must broadcast as
            // a leading dimension against every other index.
            while value.logical_rank()?.saturating_sub(1) < max_logical {
                value = ctx.unsqueeze(value, 1)?;
            }
        }
        indices.push(value);
    }

    if base_batched {
        let mut arange = ctx.arange(batch_size)?;
        while arange.logical_rank()? < max_logical + 1 {
            arange = ctx.unsqueeze_last(arange)?;
        }
        indices.insert(0, arange);
    }
    Ok(indices)
}

fn index(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let base = &args[0];
    let index_args = &args[1..];
    let refs: Vec<&BatchedArg> = args.iter().collect();
    let Some(batch_size) = common_batch_size(primitive, &refs)? else {
        let values: Vec<TracedValue> = args.iter().map(|arg| arg.value.clone()).collect();
        return Ok(RuleResult {
            value: ctx.call(primitive, &values, opts)?,
            bdim: None,
        });
    };

    // Batched masks were rejected above; a shared (unbatched) mask cannot
    // ride along with the synthetic arange index, so that case runs through
    // the per-element loop instead.
    if index_args
        .iter()
        .any(|arg| dtype_of(&arg.value) == DType::Bool && arg.bdim.is_some())
    {
        return Err(DispatchError::BatchedBooleanMask { primitive });
    }
    if index_args
        .iter()
        .any(|arg| dtype_of(&arg.value) == DType::Bool)
    {
        return crate::fallback_loop(ctx, primitive, args, opts);
    }

    let indices = batch_indices(ctx, primitive, index_args, batch_size, base.bdim.is_some())?;
    let mut call_args = Vec::with_capacity(indices.len() + 1);
    call_args.push(base.value.clone());
    call_args.extend(indices);
    let value = ctx.call(primitive, &call_args, opts)?;
    Ok(RuleResult {
        value,
        bdim: Some(0),
    })
}

fn index_put(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let base = &args[0];
    let values = &args[1];
    let index_args = &args[2..];

    // The destination is mutated in place: it cannot retroactively grow the
    // batch axis the other operands carry.
    if base.bdim.is_none() {
        return Err(DispatchError::IncompatibleInplace { primitive });
    }
    let refs: Vec<&BatchedArg> = args.iter().collect();
    let batch_size = common_batch_size(primitive, &refs)?
        .ok_or(DispatchError::MalformedBatchedOperand {
            primitive,
            detail: "batched destination without a batch size".to_owned(),
        })?;

    let indices = batch_indices(ctx, primitive, index_args, batch_size, true)?;
    let mut call_args = Vec::with_capacity(indices.len() + 2);
    call_args.push(base.value.clone());
    call_args.push(values.value.clone());
    call_args.extend(indices);
    let value = ctx.call(primitive, &call_args, opts)?;
    Ok(RuleResult {
        value,
        bdim: Some(0),
    })
}

fn gather(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let (base, index) = (&args[0], &args[1]);
    let dim = params::require_usize(primitive, opts, "dim")?;
    let base_logical = base.rank_without_bdim()?;
    let index_logical = index.rank_without_bdim()?;
    let refs = [base, index];
    let Some(batch_size) = common_batch_size(primitive, &refs)? else {
        let value = ctx.call(
            primitive,
            &[base.value.clone(), index.value.clone()],
            opts,
        )?;
        return Ok(RuleResult { value, bdim: None });
    };

    let mut base_ = base.value.clone();
    let mut index_ = index.value.clone();
    if base_logical == 0 {
        base_ = ctx.unsqueeze_last(base_)?;
    }
    if index_logical == 0 {
        index_ = ctx.unsqueeze_last(index_)?;
    }
    base_ = ctx.ensure_has_bdim(base_, base.bdim.is_some(), batch_size)?;
    index_ = ctx.ensure_has_bdim(index_, index.bdim.is_some(), batch_size)?;

    let mut new_opts = opts.clone();
    new_opts.insert("dim".to_owned(), (dim + 1).to_string());
    let mut value = ctx.call(primitive, &[base_, index_], &new_opts)?;
    // Gather's result has the index's rank.
    if index_logical == 0 {
        value = ctx.squeeze_last(value)?;
    }
    Ok(RuleResult {
        value,
        bdim: Some(0),
    })
}

/// Shared rule for `scatter` and `scatter_add` (src-tensor overloads).
fn scatter(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let (base, index, src) = (&args[0], &args[1], &args[2]);
    let dim = params::require_usize(primitive, opts, "dim")?;
    let base_logical = base.rank_without_bdim()?;
    let index_logical = index.rank_without_bdim()?;
    let src_logical = src.rank_without_bdim()?;
    let refs = [base, index, src];
    let Some(batch_size) = common_batch_size(primitive, &refs)? else {
        let value = ctx.call(
            primitive,
            &[base.value.clone(), index.value.clone(), src.value.clone()],
            opts,
        )?;
        return Ok(RuleResult { value, bdim: None });
    };

    let mut base_ = base.value.clone();
    let mut index_ = index.value.clone();
    let mut src_ = src.value.clone();
    if base_logical == 0 {
        base_ = ctx.unsqueeze_last(base_)?;
    }
    if index_logical == 0 {
        index_ = ctx.unsqueeze_last(index_)?;
    }
    if src_logical == 0 {
        src_ = ctx.unsqueeze_last(src_)?;
    }
    base_ = ctx.ensure_has_bdim(base_, base.bdim.is_some(), batch_size)?;
    index_ = ctx.ensure_has_bdim(index_, index.bdim.is_some(), batch_size)?;
    src_ = ctx.ensure_has_bdim(src_, src.bdim.is_some(), batch_size)?;

    let mut new_opts = opts.clone();
    new_opts.insert("dim".to_owned(), (dim + 1).to_string());
    let mut value = ctx.call(primitive, &[base_, index_, src_], &new_opts)?;
    // The result has the destination's shape.
    if base_logical == 0 {
        value = ctx.squeeze_last(value)?;
    }
    Ok(RuleResult {
        value,
        bdim: Some(0),
    })
}

fn index_add(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let (base, index, source) = (&args[0], &args[1], &args[2]);
    let dim = params::require_usize(primitive, opts, "dim")?;

    if index.bdim.is_none() {
        let refs = [base, source];
        let Some(batch_size) = common_batch_size(primitive, &refs)? else {
            let value = ctx.call(
                primitive,
                &[base.value.clone(), index.value.clone(), source.value.clone()],
                opts,
            )?;
            return Ok(RuleResult { value, bdim: None });
        };
        let base_ = ctx.ensure_has_bdim(base.value.clone(), base.bdim.is_some(), batch_size)?;
        let source_ =
            ctx.ensure_has_bdim(source.value.clone(), source.bdim.is_some(), batch_size)?;
        let mut new_opts = opts.clone();
        new_opts.insert("dim".to_owned(), (dim + 1).to_string());
        let value = ctx.call(primitive, &[base_, index.value.clone(), source_], &new_opts)?;
        return Ok(RuleResult {
            value,
            bdim: Some(0),
        });
    }

    // Batched index: slice-loop-restack is the only general strategy.
    let refs: Vec<&BatchedArg> = args.iter().collect();
    let batch_size = common_batch_size(primitive, &refs)?
        .ok_or(DispatchError::MalformedBatchedOperand {
            primitive,
            detail: "batched index without a batch size".to_owned(),
        })?;
    let mut results = Vec::with_capacity(batch_size);
    for i in 0..batch_size {
        let mut slices = Vec::with_capacity(3);
        for arg in [base, index, source] {
            match arg.bdim {
                Some(_) => slices.push(ctx.select(arg.value.clone(), 0, i)?),
                None => slices.push(arg.value.clone()),
            }
        }
        results.push(ctx.call(primitive, &slices, opts)?);
    }
    Ok(RuleResult {
        value: ctx.stack0(&results)?,
        bdim: Some(0),
    })
}

/// `index_select` rewrites into `gather` after expanding the index to the
/// base's shape: a fixed decomposition into already-batchable primitives,
/// running at the current level on the still-wrapped operands.
fn index_select_decompose(
    ctx: &DispatchCtx<'_>,
    _primitive: Primitive,
    args: &[TracedValue],
    opts: &OpParams,
) -> Result<TracedValue, DispatchError> {
    let (base, index) = (&args[0], &args[1]);
    let dim = params::require_usize(Primitive::IndexSelect, opts, "dim")?;
    let base_dims = base.logical_dims()?;
    let index_rank = index.logical_rank()?;

    let index_ = if base_dims.len() > index_rank {
        expanded_index(ctx, index, &base_dims, dim)?
    } else {
        index.clone()
    };

    let mut gather_opts = OpParams::new();
    gather_opts.insert("dim".to_owned(), dim.to_string());
    let mut result = ctx.call(Primitive::Gather, &[base.clone(), index_], &gather_opts)?;
    // index_select keeps the base's rank; gather keeps the index's.
    if base_dims.is_empty() && result.logical_rank()? != 0 {
        let last = result.logical_rank()? - 1;
        result = ctx.squeeze(result, last)?;
    }
    Ok(result)
}

/// Reshape a rank-1 index of length k to `[1, ..., k, ..., 1]` at `dim` and
/// expand it across the base's other axes.
fn expanded_index(
    ctx: &DispatchCtx<'_>,
    index: &TracedValue,
    base_dims: &[usize],
    dim: usize,
) -> Result<TracedValue, DispatchError> {
    if index.logical_rank()? == 0 {
        return ctx.expand(index.clone(), base_dims);
    }
    let k = index.logical_dims()?[0];
    let mut view = vec![1; base_dims.len()];
    view[dim] = k;
    let reshaped = ctx.reshape(index.clone(), &view)?;
    let mut target = base_dims.to_vec();
    target[dim] = k;
    ctx.expand(reshaped, &target)
}
