#![forbid(unsafe_code)]

//! Wrapped-value representations.
//!
//! A [`TracedValue`] is either a plain array value or a wrapper tagged with
//! the level of the transform layer that created it. Wrappers nest: the
//! outermost wrapper always belongs to the innermost (highest) active level,
//! so composition of transforms is literally wrapper nesting. A dispatch at
//! some level inspects only the outermost wrapper: values wrapped at outer
//! levels look like ordinary unbatched values to it.

use lm_core::Value;
use lm_stack::{Layer, Level, TransformKind};
use std::cell::Cell;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub enum TracedValue {
    Plain(Value),
    Batched(Box<BatchedValue>),
    Tracked(Box<TrackedValue>),
}

/// A value carrying an implicit batch axis for one vectorize level.
///
/// `bdim`, when present, indexes a physical axis of `base`; the logical
/// shape seen through this wrapper is `base`'s shape with that axis removed.
/// `bdim == None` marks a value that never interacted with the level's batch
/// (broadcast semantics).
#[derive(Debug, Clone)]
pub struct BatchedValue {
    pub base: TracedValue,
    pub bdim: Option<usize>,
    pub level: Level,
}

/// A value tagged as eligible for differentiation bookkeeping at one level.
/// The `alive` flag is shared with the owning layer; once that layer pops,
/// the wrapper is dead and is treated as transparent by the evaluator while
/// its provenance stays queryable for debugging.
#[derive(Debug, Clone)]
pub struct TrackedValue {
    pub base: TracedValue,
    pub level: Level,
    alive: Rc<Cell<bool>>,
}

impl TrackedValue {
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    BatchAxisOutOfBounds {
        axis: usize,
        rank: usize,
        level: Level,
    },
    LeakedWrapper {
        level: Level,
        kind: &'static str,
    },
}

impl std::fmt::Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BatchAxisOutOfBounds { axis, rank, level } => {
                write!(
                    f,
                    "batch axis {axis} out of bounds for rank {rank} (wrapper at {level})"
                )
            }
            Self::LeakedWrapper { level, kind } => {
                write!(
                    f,
                    "{kind} wrapper at {level} reached the evaluator; a transform leaked a \
                     wrapper past its pop"
                )
            }
        }
    }
}

impl std::error::Error for TraceError {}

impl From<Value> for TracedValue {
    fn from(value: Value) -> Self {
        Self::Plain(value)
    }
}

#[must_use]
pub fn wrap_batched(base: TracedValue, bdim: Option<usize>, level: Level) -> TracedValue {
    TracedValue::Batched(Box::new(BatchedValue { base, bdim, level }))
}

/// Wrap a value for differentiation bookkeeping at `layer`'s level. The
/// wrapper shares the layer's liveness flag.
#[must_use]
pub fn wrap_tracked(base: TracedValue, layer: &Layer) -> TracedValue {
    debug_assert!(matches!(
        layer.kind(),
        TransformKind::Differentiate { .. }
    ));
    TracedValue::Tracked(Box::new(TrackedValue {
        base,
        level: layer.level(),
        alive: layer.alive_handle(),
    }))
}

impl TracedValue {
    /// Level of the outermost wrapper, if any.
    #[must_use]
    pub fn level_of(&self) -> Option<Level> {
        match self {
            Self::Plain(_) => None,
            Self::Batched(b) => Some(b.level),
            Self::Tracked(t) => Some(t.level),
        }
    }

    #[must_use]
    pub fn is_batched(&self) -> bool {
        matches!(self, Self::Batched(_))
    }

    #[must_use]
    pub fn is_tracked(&self) -> bool {
        matches!(self, Self::Tracked(_))
    }

    /// Batch axis of the outermost wrapper, if it is a live batched wrapper.
    #[must_use]
    pub fn batch_axis_of(&self) -> Option<usize> {
        match self {
            Self::Batched(b) => b.bdim,
            _ => None,
        }
    }

    /// One wrapper peeled off, regardless of level.
    #[must_use]
    pub fn get_unwrapped(&self) -> Option<&TracedValue> {
        match self {
            Self::Plain(_) => None,
            Self::Batched(b) => Some(&b.base),
            Self::Tracked(t) => Some(&t.base),
        }
    }

    /// Debug level probe: 0 for plain values, -1 for dead tracked wrappers,
    /// otherwise the outermost wrapper's level.
    #[must_use]
    pub fn dlevel(&self) -> i64 {
        match self {
            Self::Plain(_) => 0,
            Self::Batched(b) => i64::from(b.level.0),
            Self::Tracked(t) => {
                if t.is_alive() {
                    i64::from(t.level.0)
                } else {
                    -1
                }
            }
        }
    }

    /// The shape this value presents to the code currently running under its
    /// outermost wrapper: batch axes are hidden, everything else passes
    /// through.
    pub fn logical_dims(&self) -> Result<Vec<usize>, TraceError> {
        match self {
            Self::Plain(value) => Ok(value.dims().to_vec()),
            Self::Tracked(t) => t.base.logical_dims(),
            Self::Batched(b) => {
                let mut dims = b.base.logical_dims()?;
                match b.bdim {
                    None => Ok(dims),
                    Some(axis) => {
                        if axis >= dims.len() {
                            return Err(TraceError::BatchAxisOutOfBounds {
                                axis,
                                rank: dims.len(),
                                level: b.level,
                            });
                        }
                        dims.remove(axis);
                        Ok(dims)
                    }
                }
            }
        }
    }

    pub fn logical_rank(&self) -> Result<usize, TraceError> {
        Ok(self.logical_dims()?.len())
    }
}

/// Logical dtype of a value, seen through any wrappers.
#[must_use]
pub fn dtype_of(value: &TracedValue) -> lm_core::DType {
    match value {
        TracedValue::Plain(v) => v.dtype(),
        TracedValue::Batched(b) => dtype_of(&b.base),
        TracedValue::Tracked(t) => dtype_of(&t.base),
    }
}

/// Unwrap `value` at `level`: the outermost wrapper is inspected and peeled
/// only if it belongs to that level. Values that never interacted with the
/// level come back unchanged with no batch axis: implicit broadcast, not an
/// error.
#[must_use]
pub fn unwrap_at(value: &TracedValue, level: Level) -> (TracedValue, Option<usize>) {
    match value {
        TracedValue::Batched(b) if b.level == level => (b.base.clone(), b.bdim),
        TracedValue::Tracked(t) if t.level == level => (t.base.clone(), None),
        other => (other.clone(), None),
    }
}

/// True if the outermost wrapper belongs to `level`.
#[must_use]
pub fn wrapped_at(value: &TracedValue, level: Level) -> bool {
    value.level_of() == Some(level)
}

/// Reduce a traced value to the plain value the evaluator consumes. Dead
/// tracked wrappers are transparent; any other remaining wrapper means a
/// transform leaked it past its pop.
pub fn materialize_plain(value: &TracedValue) -> Result<Value, TraceError> {
    match value {
        TracedValue::Plain(v) => Ok(v.clone()),
        TracedValue::Tracked(t) => {
            if t.is_alive() {
                Err(TraceError::LeakedWrapper {
                    level: t.level,
                    kind: "tracked",
                })
            } else {
                materialize_plain(&t.base)
            }
        }
        TracedValue::Batched(b) => Err(TraceError::LeakedWrapper {
            level: b.level,
            kind: "batched",
        }),
    }
}
