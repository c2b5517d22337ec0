#![forbid(unsafe_code)]

//! Dispatch & batching-rule engine.
//!
//! Every primitive call enters [`dispatch`] together with the slice of
//! active layers, innermost last. The engine inspects operand wrappers at
//! the current (innermost) level only: if none are present the call is
//! forwarded to the next-outer layer, otherwise operands are unwrapped,
//! normalized to a leading batch axis, and handed to the operation's
//! batching rule: or to the per-batch-element fallback loop when no rule is
//! registered. Rules re-enter the engine through a [`DispatchCtx`] bound to
//! the remaining outer layers, which is how nested transforms compose.

mod indexing;
mod norm;
mod rules;

use lm_batch::{
    TraceError, TracedValue, materialize_plain, unwrap_at, wrap_batched, wrap_tracked, wrapped_at,
};
use lm_core::{OpParams, Primitive, Value};
use lm_ops::{EvalError, params};
use lm_stack::{Layer, TransformKind};
use rustc_hash::FxHashMap;

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum DispatchError {
    Eval(EvalError),
    Trace(TraceError),
    /// Batched operands disagree on the size of the current level's axis.
    BatchSizeMismatch { expected: usize, actual: usize },
    /// A batching rule returned an axis other than 0/none.
    RuleReturnedBadAxis { primitive: Primitive, axis: usize },
    /// A batched wrapper claims an axis its base does not have.
    MalformedBatchedOperand { primitive: Primitive, detail: String },
    /// In-place operation whose destination lacks the batch axis other
    /// operands carry.
    IncompatibleInplace { primitive: Primitive },
    /// Indexing with a boolean mask that varies per batch element.
    BatchedBooleanMask { primitive: Primitive },
    /// Running mean and running var disagree on being batched.
    RunningStatsMismatch,
    /// Batched input with unbatched in-place running statistics.
    UnbatchedRunningStats,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eval(err) => write!(f, "primitive eval failed: {err}"),
            Self::Trace(err) => write!(f, "wrapper error: {err}"),
            Self::BatchSizeMismatch { expected, actual } => {
                write!(
                    f,
                    "batched operands disagree on batch size: expected {expected}, got {actual}"
                )
            }
            Self::RuleReturnedBadAxis { primitive, axis } => {
                write!(
                    f,
                    "batching rule for {} returned batch axis {axis}; only 0 or none are valid",
                    primitive.as_str()
                )
            }
            Self::MalformedBatchedOperand { primitive, detail } => {
                write!(
                    f,
                    "malformed batched operand for {}: {detail}",
                    primitive.as_str()
                )
            }
            Self::IncompatibleInplace { primitive } => {
                write!(
                    f,
                    "vectorized {}: the destination has no batch axis but another operand does; \
                     an in-place operation cannot grow a batch axis on its destination",
                    primitive.as_str()
                )
            }
            Self::BatchedBooleanMask { primitive } => {
                write!(
                    f,
                    "vectorized {}: indexing with a batched boolean mask is unsupported; a \
                     per-batch-varying mask would produce differently shaped results per element",
                    primitive.as_str()
                )
            }
            Self::RunningStatsMismatch => {
                write!(
                    f,
                    "running mean and running var must either both be batched or both be unbatched"
                )
            }
            Self::UnbatchedRunningStats => {
                write!(
                    f,
                    "batch_norm got a batched input while the running statistics, which are \
                     updated in place, are not batched"
                )
            }
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<EvalError> for DispatchError {
    fn from(value: EvalError) -> Self {
        Self::Eval(value)
    }
}

impl From<TraceError> for DispatchError {
    fn from(value: TraceError) -> Self {
        Self::Trace(value)
    }
}

// ── Rule registry ──────────────────────────────────────────────────

/// One unwrapped operand, normalized so that a present batch axis is always
/// physical axis 0 of `value`.
#[derive(Debug, Clone)]
pub struct BatchedArg {
    pub value: TracedValue,
    pub bdim: Option<usize>,
}

impl BatchedArg {
    /// Logical rank as the wrapped code saw it: the batch axis removed.
    pub fn rank_without_bdim(&self) -> Result<usize, DispatchError> {
        let rank = self.value.logical_rank()?;
        Ok(rank.saturating_sub(usize::from(self.bdim.is_some())))
    }
}

/// A batching rule's result: the produced value and its batch axis, which
/// must be 0 (batched) or none (unbatched).
#[derive(Debug)]
pub struct RuleResult {
    pub value: TracedValue,
    pub bdim: Option<usize>,
}

pub type BatchRuleFn =
    fn(&DispatchCtx<'_>, Primitive, &[BatchedArg], &OpParams) -> Result<RuleResult, DispatchError>;

/// A decomposition runs against the *current* level on the still-wrapped
/// operands, rewriting the operation into already-batchable primitives.
pub type DecomposeFn =
    fn(&DispatchCtx<'_>, Primitive, &[TracedValue], &OpParams) -> Result<TracedValue, DispatchError>;

#[derive(Debug, Clone, Copy)]
pub enum RuleEntry {
    Rule(BatchRuleFn),
    /// Correct for any operation: slice, recurse per batch element, restack.
    FallbackLoop,
    Decompose(DecomposeFn),
}

#[derive(Debug, Default)]
pub struct BatchRuleRegistry {
    entries: FxHashMap<Primitive, RuleEntry>,
}

impl BatchRuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with the built-in rule set.
    #[must_use]
    pub fn with_default_rules() -> Self {
        let mut registry = Self::new();
        rules::register(&mut registry);
        indexing::register(&mut registry);
        norm::register(&mut registry);
        registry
    }

    pub fn register(&mut self, primitive: Primitive, entry: RuleEntry) {
        self.entries.insert(primitive, entry);
    }

    #[must_use]
    pub fn entry(&self, primitive: Primitive) -> Option<RuleEntry> {
        self.entries.get(&primitive).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Dispatch context ───────────────────────────────────────────────

/// Handle a batching rule uses to run primitives "one layer out": every call
/// re-enters [`dispatch`] with the remaining outer layers, so operands that
/// carry outer-level wrappers are handled by those levels' rules in turn.
#[derive(Debug, Clone, Copy)]
pub struct DispatchCtx<'a> {
    pub registry: &'a BatchRuleRegistry,
    pub layers: &'a [Layer],
}

impl DispatchCtx<'_> {
    pub fn call(
        &self,
        primitive: Primitive,
        args: &[TracedValue],
        opts: &OpParams,
    ) -> Result<TracedValue, DispatchError> {
        dispatch(self.registry, self.layers, primitive, args, opts)
    }

    fn call1(
        &self,
        primitive: Primitive,
        value: TracedValue,
        pairs: &[(&str, String)],
    ) -> Result<TracedValue, DispatchError> {
        let opts: OpParams = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect();
        self.call(primitive, std::slice::from_ref(&value), &opts)
    }

    pub fn movedim(
        &self,
        value: TracedValue,
        src: usize,
        dst: usize,
    ) -> Result<TracedValue, DispatchError> {
        if src == dst {
            return Ok(value);
        }
        self.call1(
            Primitive::MoveDim,
            value,
            &[("src", src.to_string()), ("dst", dst.to_string())],
        )
    }

    /// Move a discovered batch axis to physical axis 0.
    pub fn move_bdim_to_front(
        &self,
        value: TracedValue,
        bdim: usize,
    ) -> Result<TracedValue, DispatchError> {
        self.movedim(value, bdim, 0)
    }

    pub fn select(
        &self,
        value: TracedValue,
        axis: usize,
        index: usize,
    ) -> Result<TracedValue, DispatchError> {
        self.call1(
            Primitive::Select,
            value,
            &[("axis", axis.to_string()), ("index", index.to_string())],
        )
    }

    pub fn stack0(&self, parts: &[TracedValue]) -> Result<TracedValue, DispatchError> {
        self.call(Primitive::Stack, parts, &OpParams::new())
    }

    pub fn unsqueeze(&self, value: TracedValue, axis: usize) -> Result<TracedValue, DispatchError> {
        self.call1(Primitive::Unsqueeze, value, &[("axis", axis.to_string())])
    }

    pub fn squeeze(&self, value: TracedValue, axis: usize) -> Result<TracedValue, DispatchError> {
        self.call1(Primitive::Squeeze, value, &[("axis", axis.to_string())])
    }

    pub fn unsqueeze_last(&self, value: TracedValue) -> Result<TracedValue, DispatchError> {
        let axis = value.logical_rank()?;
        self.unsqueeze(value, axis)
    }

    pub fn squeeze_last(&self, value: TracedValue) -> Result<TracedValue, DispatchError> {
        let rank = value.logical_rank()?;
        debug_assert!(rank > 0);
        self.squeeze(value, rank - 1)
    }

    pub fn expand(&self, value: TracedValue, dims: &[usize]) -> Result<TracedValue, DispatchError> {
        self.call1(Primitive::Expand, value, &[("shape", params::format_csv(dims))])
    }

    pub fn reshape(
        &self,
        value: TracedValue,
        dims: &[usize],
    ) -> Result<TracedValue, DispatchError> {
        self.call1(Primitive::Reshape, value, &[("shape", params::format_csv(dims))])
    }

    pub fn arange(&self, end: usize) -> Result<TracedValue, DispatchError> {
        let mut opts = OpParams::new();
        opts.insert("end".to_owned(), end.to_string());
        self.call(Primitive::Arange, &[], &opts)
    }

    /// Give an operand the batch axis it is missing: logically a broadcast
    /// (stride-0 expand), never a data copy.
    pub fn ensure_has_bdim(
        &self,
        value: TracedValue,
        has_bdim: bool,
        batch_size: usize,
    ) -> Result<TracedValue, DispatchError> {
        if has_bdim {
            return Ok(value);
        }
        let mut target = vec![batch_size];
        target.extend(value.logical_dims()?);
        self.expand(value, &target)
    }

    /// Insert size-1 axes (after the batch axis when present) until the
    /// value's logical rank reaches `logical_rank`.
    pub fn pad_to_logical_rank(
        &self,
        mut value: TracedValue,
        has_bdim: bool,
        logical_rank: usize,
    ) -> Result<TracedValue, DispatchError> {
        let insert_at = usize::from(has_bdim);
        while value.logical_rank()?.saturating_sub(insert_at) < logical_rank {
            value = self.unsqueeze(value, insert_at)?;
        }
        Ok(value)
    }

    /// Fold axis `src` into axis `dst` (multiplying sizes), `dst` indexed in
    /// the reduced shape. `reshape_dim_into(0, 1, x)` folds a leading batch
    /// axis into the channel axis.
    pub fn reshape_dim_into(
        &self,
        src: usize,
        dst: usize,
        value: TracedValue,
    ) -> Result<TracedValue, DispatchError> {
        let dims = value.logical_dims()?;
        let mut new_dims = dims.clone();
        let removed = new_dims.remove(src);
        new_dims[dst] *= removed;
        let moved = self.movedim(value, src, dst)?;
        self.reshape(moved, &new_dims)
    }

    /// Split axis `src` into `(size1, old / size1)`, inverse of
    /// [`Self::reshape_dim_into`].
    pub fn reshape_dim_outof(
        &self,
        src: usize,
        size1: usize,
        value: TracedValue,
    ) -> Result<TracedValue, DispatchError> {
        let dims = value.logical_dims()?;
        let mut new_dims = Vec::with_capacity(dims.len() + 1);
        new_dims.extend_from_slice(&dims[..src]);
        new_dims.push(size1);
        new_dims.push(dims[src] / size1);
        new_dims.extend_from_slice(&dims[src + 1..]);
        self.reshape(value, &new_dims)
    }
}

/// Common batch size of every operand that carries one; sizes must agree.
pub(crate) fn common_batch_size(
    primitive: Primitive,
    args: &[&BatchedArg],
) -> Result<Option<usize>, DispatchError> {
    let mut size = None;
    for arg in args {
        if arg.bdim != Some(0) {
            continue;
        }
        let dims = arg.value.logical_dims()?;
        let actual = *dims.first().ok_or(DispatchError::MalformedBatchedOperand {
            primitive,
            detail: "batch axis on a rank-0 operand".to_owned(),
        })?;
        match size {
            None => size = Some(actual),
            Some(expected) if expected != actual => {
                return Err(DispatchError::BatchSizeMismatch { expected, actual });
            }
            Some(_) => {}
        }
    }
    Ok(size)
}

// ── The engine ─────────────────────────────────────────────────────

pub fn dispatch(
    registry: &BatchRuleRegistry,
    layers: &[Layer],
    primitive: Primitive,
    args: &[TracedValue],
    opts: &OpParams,
) -> Result<TracedValue, DispatchError> {
    let Some((current, outer)) = layers.split_last() else {
        return eval_base(primitive, args, opts);
    };
    let level = current.level();

    // Step 1: nothing wrapped at the current level: the call belongs to an
    // outer layer (or to the plain implementation).
    if !args.iter().any(|arg| wrapped_at(arg, level)) {
        return dispatch(registry, outer, primitive, args, opts);
    }

    match current.kind() {
        TransformKind::Differentiate { .. } => {
            let bases: Vec<TracedValue> =
                args.iter().map(|arg| unwrap_at(arg, level).0).collect();
            let result = dispatch(registry, outer, primitive, &bases, opts)?;
            Ok(wrap_tracked(result, current))
        }
        TransformKind::Vectorize { .. } => {
            // Decompositions rewrite the call at the same level, on the
            // still-wrapped operands.
            if let Some(RuleEntry::Decompose(decompose)) = registry.entry(primitive) {
                let ctx = DispatchCtx { registry, layers };
                return decompose(&ctx, primitive, args, opts);
            }

            let ctx = DispatchCtx {
                registry,
                layers: outer,
            };

            // Step 2: unwrap at the current level and normalize any batch
            // axis to physical axis 0.
            let mut unwrapped = Vec::with_capacity(args.len());
            for arg in args {
                let (base, bdim) = unwrap_at(arg, level);
                let normalized = match bdim {
                    Some(axis) if axis != 0 => BatchedArg {
                        value: ctx.move_bdim_to_front(base, axis)?,
                        bdim: Some(0),
                    },
                    other => BatchedArg {
                        value: base,
                        bdim: other,
                    },
                };
                unwrapped.push(normalized);
            }

            // Step 3: rule lookup, with the loop as universal safety net.
            let out = match registry.entry(primitive) {
                Some(RuleEntry::Rule(rule)) => rule(&ctx, primitive, &unwrapped, opts)?,
                Some(RuleEntry::FallbackLoop) | None => {
                    fallback_loop(&ctx, primitive, &unwrapped, opts)?
                }
                Some(RuleEntry::Decompose(_)) => {
                    unreachable!("decompositions were handled before unwrapping")
                }
            };

            // Step 4: re-wrap at the current level.
            match out.bdim {
                None => Ok(out.value),
                Some(0) => Ok(wrap_batched(out.value, Some(0), level)),
                Some(axis) => Err(DispatchError::RuleReturnedBadAxis { primitive, axis }),
            }
        }
    }
}

/// The universal safety net: slice every batched operand along its batch
/// axis, run the operation per batch element one layer out, and restack
/// along a new leading axis. Output order follows slice order, so the result
/// is identical to manually looping and stacking outside the runtime.
pub(crate) fn fallback_loop(
    ctx: &DispatchCtx<'_>,
    primitive: Primitive,
    args: &[BatchedArg],
    opts: &OpParams,
) -> Result<RuleResult, DispatchError> {
    let refs: Vec<&BatchedArg> = args.iter().collect();
    let Some(batch_size) = common_batch_size(primitive, &refs)? else {
        // Only broadcast wrappers at this level: run once, unbatched.
        let values: Vec<TracedValue> = args.iter().map(|arg| arg.value.clone()).collect();
        return Ok(RuleResult {
            value: ctx.call(primitive, &values, opts)?,
            bdim: None,
        });
    };

    let mut results = Vec::with_capacity(batch_size);
    for index in 0..batch_size {
        let mut slices = Vec::with_capacity(args.len());
        for arg in args {
            match arg.bdim {
                Some(_) => slices.push(ctx.select(arg.value.clone(), 0, index)?),
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

/// Bottom of the stack: all wrappers are gone (dead tracked wrappers are
/// transparent) and the plain implementation runs.
fn eval_base(
    primitive: Primitive,
    args: &[TracedValue],
    opts: &OpParams,
) -> Result<TracedValue, DispatchError> {
    let mut plain: Vec<Value> = Vec::with_capacity(args.len());
    for arg in args {
        plain.push(materialize_plain(arg)?);
    }
    let out = lm_ops::eval_primitive(primitive, &plain, opts)?;
    Ok(TracedValue::Plain(out))
}

#[cfg(test)]
mod tests {
    use super::{BatchRuleRegistry, DispatchError, RuleEntry, dispatch};
    use lm_batch::{TracedValue, unwrap_at, wrap_batched};
    use lm_core::{OpParams, Primitive, TensorValue, Value};
    use lm_stack::{Layer, TransformKind, shared_stack};

    fn vectorize_layers(batch_sizes: &[usize]) -> Vec<Layer> {
        let stack = shared_stack();
        for &batch_size in batch_sizes {
            stack
                .borrow_mut()
                .push(TransformKind::Vectorize { batch_size });
        }
        let layers = stack.borrow().layers().to_vec();
        layers
    }

    fn plain(dims: &[usize], values: &[f64]) -> TracedValue {
        TracedValue::Plain(Value::Tensor(
            TensorValue::from_f64_slice(dims, values).expect("tensor"),
        ))
    }

    fn expect_f64(value: &TracedValue) -> Vec<f64> {
        match value {
            TracedValue::Plain(Value::Tensor(t)) => t.to_f64_vec().expect("f64 tensor"),
            other => panic!("expected plain tensor, got {other:?}"),
        }
    }

    #[test]
    fn no_layers_evaluates_plainly() {
        let registry = BatchRuleRegistry::with_default_rules();
        let out = dispatch(
            &registry,
            &[],
            Primitive::Add,
            &[plain(&[2], &[1.0, 2.0]), plain(&[2], &[10.0, 20.0])],
            &OpParams::new(),
        )
        .expect("dispatch");
        assert_eq!(expect_f64(&out), vec![11.0, 22.0]);
    }

    #[test]
    fn unwrapped_operands_forward_past_the_layer() {
        let registry = BatchRuleRegistry::with_default_rules();
        let layers = vectorize_layers(&[4]);
        let out = dispatch(
            &registry,
            &layers,
            Primitive::Add,
            &[plain(&[2], &[1.0, 2.0]), plain(&[2], &[1.0, 1.0])],
            &OpParams::new(),
        )
        .expect("dispatch");
        assert!(matches!(out, TracedValue::Plain(_)));
        assert_eq!(expect_f64(&out), vec![2.0, 3.0]);
    }

    #[test]
    fn batched_unary_applies_elementwise_and_rewraps() {
        let registry = BatchRuleRegistry::with_default_rules();
        let layers = vectorize_layers(&[3]);
        let level = layers[0].level();
        let arg = wrap_batched(plain(&[3], &[1.0, -2.0, 3.0]), Some(0), level);
        let out = dispatch(&registry, &layers, Primitive::Abs, &[arg], &OpParams::new())
            .expect("dispatch");
        let (base, bdim) = unwrap_at(&out, level);
        assert_eq!(bdim, Some(0));
        assert_eq!(expect_f64(&base), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn non_leading_batch_axis_is_normalized() {
        let registry = BatchRuleRegistry::with_default_rules();
        let layers = vectorize_layers(&[3]);
        let level = layers[0].level();
        // Physical (2, 3) with batch axis 1: logically 3 batch elements of
        // shape (2,).
        let arg = wrap_batched(
            plain(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            Some(1),
            level,
        );
        let out = dispatch(&registry, &layers, Primitive::Neg, &[arg], &OpParams::new())
            .expect("dispatch");
        let (base, bdim) = unwrap_at(&out, level);
        assert_eq!(bdim, Some(0));
        // Batch moved to the front: (3, 2), each row one batch element.
        assert_eq!(
            expect_f64(&base),
            vec![-1.0, -4.0, -2.0, -5.0, -3.0, -6.0]
        );
    }

    #[test]
    fn fallback_loop_matches_manual_loop_bit_for_bit() {
        let registry = BatchRuleRegistry::with_default_rules();
        let layers = vectorize_layers(&[2]);
        let level = layers[0].level();
        let data = [3.0, 1.0, 2.0, 0.5, -1.0, 7.25];
        let arg = wrap_batched(plain(&[2, 3], &data), Some(0), level);

        // Sort is registered as an explicit fallback-loop entry.
        assert!(matches!(
            registry.entry(Primitive::Sort),
            Some(RuleEntry::FallbackLoop)
        ));
        let out = dispatch(&registry, &layers, Primitive::Sort, &[arg], &OpParams::new())
            .expect("dispatch");
        let (base, _) = unwrap_at(&out, level);

        // Manual loop outside the runtime.
        let full = TensorValue::from_f64_slice(&[2, 3], &data).expect("tensor");
        let mut manual = Vec::new();
        for i in 0..2 {
            let slice = Value::Tensor(full.select(0, i).expect("select"));
            let sorted =
                lm_ops::eval_primitive(Primitive::Sort, &[slice], &OpParams::new()).expect("sort");
            manual.push(sorted.to_tensor());
        }
        let stacked = TensorValue::stack_axis0(&manual).expect("stack");
        match base {
            TracedValue::Plain(Value::Tensor(t)) => {
                assert_eq!(t.elements(), stacked.elements(), "must be bit-identical");
            }
            other => panic!("expected plain tensor, got {other:?}"),
        }
    }

    #[test]
    fn unregistered_op_with_bad_slices_names_the_operation() {
        let registry = BatchRuleRegistry::new();
        let layers = vectorize_layers(&[2]);
        let level = layers[0].level();
        // Dot on mismatched slices fails inside the fallback loop; the error
        // must name the operation.
        let a = wrap_batched(plain(&[2, 3], &[1.0; 6]), Some(0), level);
        let b = plain(&[2], &[1.0, 2.0]);
        let err = dispatch(&registry, &layers, Primitive::Dot, &[a, b], &OpParams::new())
            .expect_err("mismatched dot must fail");
        assert!(err.to_string().contains("dot"));
    }

    #[test]
    fn batch_size_disagreement_is_rejected() {
        let registry = BatchRuleRegistry::new();
        let layers = vectorize_layers(&[2]);
        let level = layers[0].level();
        let a = wrap_batched(plain(&[2, 1], &[1.0, 2.0]), Some(0), level);
        let b = wrap_batched(plain(&[3, 1], &[1.0, 2.0, 3.0]), Some(0), level);
        let err = dispatch(
            &registry,
            &layers,
            Primitive::Cumsum,
            &[a, b],
            &OpParams::new(),
        )
        .expect_err("batch sizes disagree");
        assert!(matches!(err, DispatchError::BatchSizeMismatch { .. }));
    }
}
