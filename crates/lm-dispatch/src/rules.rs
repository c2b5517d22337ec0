//! Batching rules for the elementwise, reduction, and movement families.
//!
//! Every rule receives operands already unwrapped at the current level and
//! normalized to a leading batch axis, and returns its result with axis 0
//! (batched) or none. Rules run primitives through the context, one layer
//! out, so nested transforms compose by recursion.

use crate::{
    BatchRuleRegistry, BatchedArg, DispatchCtx, DispatchError, RuleEntry, RuleResult,
    common_batch_size,
};
use lm_batch::TracedValue;
use lm_core::{OpParams, Primitive};
use lm_ops::params;

pub(crate) fn register(registry: &mut BatchRuleRegistry) {
    use Primitive as P;
    for op in [
        P::Neg,
        P::Abs,
        P::Exp,
        P::Log,
        P::Sqrt,
        P::Sin,
        P::Cos,
        P::Tanh,
        P::Sign,
        P::Square,
    ] {
        registry.register(op, RuleEntry::Rule(unary_elementwise));
    }
    for op in [
        P::Add,
        P::Sub,
        P::Mul,
        P::Div,
        P::Pow,
        P::Max,
        P::Min,
        P::Eq,
        P::Lt,
    ] {
        registry.register(op, RuleEntry::Rule(binary_pointwise));
    }
    registry.register(P::ReduceSum, RuleEntry::Rule(reduce));
    registry.register(P::ReduceMax, RuleEntry::Rule(reduce));
    registry.register(P::Reshape, RuleEntry::Rule(reshape));
    registry.register(P::Transpose, RuleEntry::Rule(transpose));
    registry.register(P::Expand, RuleEntry::Rule(expand));
    registry.register(P::Squeeze, RuleEntry::Rule(shift_axis_param));
    registry.register(P::Unsqueeze, RuleEntry::Rule(shift_axis_param));
    registry.register(P::Narrow, RuleEntry::Rule(shift_axis_param));
    registry.register(P::Select, RuleEntry::Rule(shift_axis_param));
    registry.register(P::MoveDim, RuleEntry::Rule(movedim));
    registry.register(P::Stack, RuleEntry::Rule(stack_like));
    registry.register(P::Concatenate, RuleEntry::Rule(stack_like));
    // Dot, Sort, and Cumsum fall back to slice-loop-restack by design.
    registry.register(P::Dot, RuleEntry::FallbackLoop);
    registry.register(P::Sort, RuleEntry::FallbackLoop);
    registry.register(P::Cumsum, RuleEntry::FallbackLoop);
}

fn unary_elementwise(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let input = &args[0];
    let value = ctx.call(primitive, std::slice::from_ref(&input.value), opts)?;
    Ok(RuleResult {
        value,
        bdim: input.bdim,
    })
}

/// Shared rule for binary elementwise and comparison ops: pad every operand
/// to the common logical rank (keeping batch axes leading) and let the
/// underlying broadcast do the rest.
fn binary_pointwise(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let mut out_logical_rank = 0;
    for arg in args {
        out_logical_rank = out_logical_rank.max(arg.rank_without_bdim()?);
    }
    let mut operands = Vec::with_capacity(args.len());
    for arg in args {
        operands.push(ctx.pad_to_logical_rank(
            arg.value.clone(),
            arg.bdim.is_some(),
            out_logical_rank,
        )?);
    }
    let value = ctx.call(primitive, &operands, opts)?;
    let bdim = args.iter().any(|arg| arg.bdim.is_some()).then_some(0);
    Ok(RuleResult { value, bdim })
}

fn reduce(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let input = &args[0];
    if input.bdim.is_none() {
        let value = ctx.call(primitive, std::slice::from_ref(&input.value), opts)?;
        return Ok(RuleResult { value, bdim: None });
    }

    let logical_rank = input.rank_without_bdim()?;
    let mut axes = params::usize_list(opts, "axes");
    if axes.is_empty() {
        axes = (0..logical_rank).collect();
    }
    if axes.is_empty() {
        // Rank-0 logical operand: reducing over no axes is the identity.
        return Ok(RuleResult {
            value: input.value.clone(),
            bdim: Some(0),
        });
    }
    let shifted: Vec<usize> = axes.iter().map(|axis| axis + 1).collect();
    let mut new_opts = opts.clone();
    new_opts.insert("axes".to_owned(), params::format_csv(&shifted));
    let value = ctx.call(primitive, std::slice::from_ref(&input.value), &new_opts)?;
    Ok(RuleResult {
        value,
        bdim: Some(0),
    })
}

fn reshape(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let input = &args[0];
    if input.bdim.is_none() {
        let value = ctx.call(primitive, std::slice::from_ref(&input.value), opts)?;
        return Ok(RuleResult { value, bdim: None });
    }
    let batch_size = batch_size_of(primitive, input)?;
    let mut shape = vec![batch_size];
    shape.extend(params::usize_list(opts, "shape"));
    let mut new_opts = opts.clone();
    new_opts.insert("shape".to_owned(), params::format_csv(&shape));
    let value = ctx.call(primitive, std::slice::from_ref(&input.value), &new_opts)?;
    Ok(RuleResult {
        value,
        bdim: Some(0),
    })
}

fn transpose(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let input = &args[0];
    if input.bdim.is_none() {
        let value = ctx.call(primitive, std::slice::from_ref(&input.value), opts)?;
        return Ok(RuleResult { value, bdim: None });
    }
    let permutation = params::usize_list(opts, "permutation");
    let mut adjusted = Vec::with_capacity(permutation.len() + 1);
    adjusted.push(0);
    adjusted.extend(permutation.iter().map(|&p| p + 1));
    let mut new_opts = opts.clone();
    new_opts.insert("permutation".to_owned(), params::format_csv(&adjusted));
    let value = ctx.call(primitive, std::slice::from_ref(&input.value), &new_opts)?;
    Ok(RuleResult {
        value,
        bdim: Some(0),
    })
}

fn expand(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let input = &args[0];
    if input.bdim.is_none() {
        let value = ctx.call(primitive, std::slice::from_ref(&input.value), opts)?;
        return Ok(RuleResult { value, bdim: None });
    }
    let batch_size = batch_size_of(primitive, input)?;
    let mut shape = vec![batch_size];
    shape.extend(params::usize_list(opts, "shape"));
    let mut new_opts = opts.clone();
    new_opts.insert("shape".to_owned(), params::format_csv(&shape));
    let value = ctx.call(primitive, std::slice::from_ref(&input.value), &new_opts)?;
    Ok(RuleResult {
        value,
        bdim: Some(0),
    })
}

/// Squeeze/Unsqueeze/Narrow/Select: one input, one `axis` param that shifts
/// past the leading batch axis.
fn shift_axis_param(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let input = &args[0];
    if input.bdim.is_none() {
        let value = ctx.call(primitive, std::slice::from_ref(&input.value), opts)?;
        return Ok(RuleResult { value, bdim: None });
    }
    let axis = params::require_usize(primitive, opts, "axis")?;
    let mut new_opts = opts.clone();
    new_opts.insert("axis".to_owned(), (axis + 1).to_string());
    let value = ctx.call(primitive, std::slice::from_ref(&input.value), &new_opts)?;
    Ok(RuleResult {
        value,
        bdim: Some(0),
    })
}

fn movedim(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let input = &args[0];
    if input.bdim.is_none() {
        let value = ctx.call(primitive, std::slice::from_ref(&input.value), opts)?;
        return Ok(RuleResult { value, bdim: None });
    }
    let src = params::require_usize(primitive, opts, "src")?;
    let dst = params::require_usize(primitive, opts, "dst")?;
    let mut new_opts = opts.clone();
    new_opts.insert("src".to_owned(), (src + 1).to_string());
    new_opts.insert("dst".to_owned(), (dst + 1).to_string());
    let value = ctx.call(primitive, std::slice::from_ref(&input.value), &new_opts)?;
    Ok(RuleResult {
        value,
        bdim: Some(0),
    })
}

/// Stack/Concatenate over any number of operands: every operand gets the
/// batch axis (broadcasting the unbatched ones), then the joining axis
/// shifts past it.
fn stack_like(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let refs: Vec<&BatchedArg> = args.iter().collect();
    let Some(batch_size) = common_batch_size(primitive, &refs)? else {
        let values: Vec<TracedValue> = args.iter().map(|arg| arg.value.clone()).collect();
        return Ok(RuleResult {
            value: ctx.call(primitive, &values, opts)?,
            bdim: None,
        });
    };
    let mut operands = Vec::with_capacity(args.len());
    for arg in args {
        operands.push(ctx.ensure_has_bdim(
            arg.value.clone(),
            arg.bdim.is_some(),
            batch_size,
        )?);
    }
    let axis = params::usize_or(primitive, opts, "axis", 0)?;
    let mut new_opts = opts.clone();
    new_opts.insert("axis".to_owned(), (axis + 1).to_string());
    let value = ctx.call(primitive, &operands, &new_opts)?;
    Ok(RuleResult {
        value,
        bdim: Some(0),
    })
}

fn batch_size_of(primitive: Primitive, arg: &BatchedArg) -> Result<usize, DispatchError> {
    let dims = arg.value.logical_dims()?;
    dims.first()
        .copied()
        .ok_or(DispatchError::MalformedBatchedOperand {
            primitive,
            detail: "batch axis on a rank-0 operand".to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use crate::{BatchRuleRegistry, dispatch};
    use lm_batch::{TracedValue, unwrap_at, wrap_batched};
    use lm_core::{OpParams, Primitive, TensorValue, Value};
    use lm_stack::{Layer, TransformKind, shared_stack};

    fn layers(batch_size: usize) -> Vec<Layer> {
        let stack = shared_stack();
        stack
            .borrow_mut()
            .push(TransformKind::Vectorize { batch_size });
        let layers = stack.borrow().layers().to_vec();
        layers
    }

    fn plain(dims: &[usize], values: &[f64]) -> TracedValue {
        TracedValue::Plain(Value::Tensor(
            TensorValue::from_f64_slice(dims, values).expect("tensor"),
        ))
    }

    fn as_f64(value: &TracedValue) -> Vec<f64> {
        match value {
            TracedValue::Plain(Value::Tensor(t)) => t.to_f64_vec().expect("f64"),
            other => panic!("expected plain tensor, got {other:?}"),
        }
    }

    fn dims_of(value: &TracedValue) -> Vec<usize> {
        value.logical_dims().expect("dims")
    }

    #[test]
    fn binary_broadcasts_unbatched_operand_across_the_batch() {
        let registry = BatchRuleRegistry::with_default_rules();
        let layers = layers(2);
        let level = layers[0].level();
        let batched = wrap_batched(plain(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), Some(0), level);
        let shared = plain(&[3], &[10.0, 20.0, 30.0]);
        let out = dispatch(
            &registry,
            &layers,
            Primitive::Add,
            &[batched, shared],
            &OpParams::new(),
        )
        .expect("dispatch");
        let (base, bdim) = unwrap_at(&out, level);
        assert_eq!(bdim, Some(0));
        assert_eq!(as_f64(&base), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn binary_pads_unbatched_operand_of_equal_physical_rank() {
        let registry = BatchRuleRegistry::with_default_rules();
        let layers = layers(2);
        let level = layers[0].level();
        // Batched logical shape (3,), unbatched logical shape (2, 3): the
        // batched operand must be padded so the batch axis does not collide
        // with the unbatched leading axis.
        let batched = wrap_batched(plain(&[2, 3], &[0.0, 0.0, 0.0, 1.0, 1.0, 1.0]), Some(0), level);
        let shared = plain(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = dispatch(
            &registry,
            &layers,
            Primitive::Add,
            &[batched, shared],
            &OpParams::new(),
        )
        .expect("dispatch");
        let (base, bdim) = unwrap_at(&out, level);
        assert_eq!(bdim, Some(0));
        assert_eq!(dims_of(&base), vec![2, 2, 3]);
        assert_eq!(
            as_f64(&base),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]
        );
    }

    #[test]
    fn reduce_shifts_axes_past_the_batch_axis() {
        let registry = BatchRuleRegistry::with_default_rules();
        let layers = layers(2);
        let level = layers[0].level();
        let batched = wrap_batched(plain(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), Some(0), level);
        let mut opts = OpParams::new();
        opts.insert("axes".to_owned(), "0".to_owned());
        let out = dispatch(&registry, &layers, Primitive::ReduceSum, &[batched], &opts)
            .expect("dispatch");
        let (base, bdim) = unwrap_at(&out, level);
        assert_eq!(bdim, Some(0));
        assert_eq!(as_f64(&base), vec![6.0, 15.0]);
    }

    #[test]
    fn reduce_all_logical_axes_keeps_the_batch_axis() {
        let registry = BatchRuleRegistry::with_default_rules();
        let layers = layers(2);
        let level = layers[0].level();
        let batched = wrap_batched(plain(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), Some(0), level);
        let out = dispatch(
            &registry,
            &layers,
            Primitive::ReduceSum,
            &[batched],
            &OpParams::new(),
        )
        .expect("dispatch");
        let (base, bdim) = unwrap_at(&out, level);
        assert_eq!(bdim, Some(0));
        assert_eq!(dims_of(&base), vec![2]);
        assert_eq!(as_f64(&base), vec![6.0, 15.0]);
    }

    #[test]
    fn reshape_prepends_the_batch_size() {
        let registry = BatchRuleRegistry::with_default_rules();
        let layers = layers(2);
        let level = layers[0].level();
        let batched = wrap_batched(plain(&[2, 6], &[0.0; 12]), Some(0), level);
        let mut opts = OpParams::new();
        opts.insert("shape".to_owned(), "2,3".to_owned());
        let out =
            dispatch(&registry, &layers, Primitive::Reshape, &[batched], &opts).expect("dispatch");
        let (base, _) = unwrap_at(&out, level);
        assert_eq!(dims_of(&base), vec![2, 2, 3]);
    }

    #[test]
    fn transpose_fixes_the_batch_axis_in_place() {
        let registry = BatchRuleRegistry::with_default_rules();
        let layers = layers(2);
        let level = layers[0].level();
        let batched = wrap_batched(
            plain(&[2, 2, 3], &(0..12).map(f64::from).collect::<Vec<_>>()),
            Some(0),
            level,
        );
        let mut opts = OpParams::new();
        opts.insert("permutation".to_owned(), "1,0".to_owned());
        let out = dispatch(&registry, &layers, Primitive::Transpose, &[batched], &opts)
            .expect("dispatch");
        let (base, bdim) = unwrap_at(&out, level);
        assert_eq!(bdim, Some(0));
        assert_eq!(dims_of(&base), vec![2, 3, 2]);
    }

    #[test]
    fn stack_broadcasts_unbatched_parts() {
        let registry = BatchRuleRegistry::with_default_rules();
        let layers = layers(2);
        let level = layers[0].level();
        let batched = wrap_batched(plain(&[2, 2], &[1.0, 2.0, 3.0, 4.0]), Some(0), level);
        let shared = plain(&[2], &[9.0, 9.0]);
        let out = dispatch(
            &registry,
            &layers,
            Primitive::Stack,
            &[batched, shared],
            &OpParams::new(),
        )
        .expect("dispatch");
        let (base, bdim) = unwrap_at(&out, level);
        assert_eq!(bdim, Some(0));
        assert_eq!(dims_of(&base), vec![2, 2, 2]);
        assert_eq!(
            as_f64(&base),
            vec![1.0, 2.0, 9.0, 9.0, 3.0, 4.0, 9.0, 9.0]
        );
    }
}
