#![forbid(unsafe_code)]

//! Caller-facing surface of the laminar transform runtime.
//!
//! An [`Interpreter`] owns one execution context: its own layer stack, the
//! batching-rule registry, and the ambient grad-mode flag. Independent
//! top-level computations each build their own interpreter; nothing is
//! shared process-wide except whatever [`CompileCache`] the caller chooses
//! to share.

pub mod debug;
mod transforms;

pub use lm_batch::{TracedValue, unwrap_at, wrap_batched, wrap_tracked};
pub use lm_cache::{CompileCache, DispatchKeySet, HashMode, LocalState, SpecializationKey};
pub use lm_core::{OpParams, Primitive, Value};
pub use lm_dispatch::{BatchRuleRegistry, DispatchError};
pub use lm_stack::{KindTag, Layer, Level, StackError, TransformKind};
pub use transforms::{AxisSpec, Vmapped};

use lm_stack::{SharedStack, shared_stack};
use std::cell::Cell;

#[derive(Debug)]
pub enum ApiError {
    Dispatch(DispatchError),
    Stack(StackError),
    /// in_axes/out_axes length does not match the argument/output count.
    AxesCountMismatch { expected: usize, actual: usize },
    /// An axis spec does not resolve against the value's rank.
    AxisOutOfBounds { axis: i32, ndim: usize },
    /// A rank-0 value cannot carry a batch axis.
    CannotBatchRankZero,
    /// Batched arguments disagree on the mapped dimension.
    MismatchedBatchDimension { expected: usize, actual: usize },
    /// vmap needs at least one batched input to define the batch size.
    NoBatchedInput,
    /// An output still batched at the level was asked to come out unbatched.
    BatchedOutputWithNoneAxis,
    /// A top-level call produced a value still carrying a wrapper.
    WrappedOutput { level: Option<Level> },
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dispatch(err) => write!(f, "dispatch error: {err}"),
            Self::Stack(err) => write!(f, "interpreter stack error: {err}"),
            Self::AxesCountMismatch { expected, actual } => {
                write!(
                    f,
                    "in_axes/out_axes length mismatch: expected {expected}, got {actual}"
                )
            }
            Self::AxisOutOfBounds { axis, ndim } => {
                write!(f, "axis {axis} is out of bounds for a value with {ndim} dimensions")
            }
            Self::CannotBatchRankZero => {
                write!(f, "a rank-0 value cannot be mapped over a batch axis")
            }
            Self::MismatchedBatchDimension { expected, actual } => {
                write!(
                    f,
                    "vmap mapped-dimension mismatch: expected {expected}, got {actual}"
                )
            }
            Self::NoBatchedInput => {
                write!(f, "vmap requires at least one batched input")
            }
            Self::BatchedOutputWithNoneAxis => {
                write!(
                    f,
                    "an output that depends on the mapped axis cannot use out_axes=none"
                )
            }
            Self::WrappedOutput { level } => match level {
                Some(level) => write!(f, "top-level output still wrapped at {level}"),
                None => write!(f, "top-level output still wrapped"),
            },
        }
    }
}

impl std::error::Error for ApiError {}

impl From<DispatchError> for ApiError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<StackError> for ApiError {
    fn from(value: StackError) -> Self {
        Self::Stack(value)
    }
}

impl From<lm_batch::TraceError> for ApiError {
    fn from(value: lm_batch::TraceError) -> Self {
        Self::Dispatch(DispatchError::Trace(value))
    }
}

/// One execution context of the transform runtime.
#[derive(Debug)]
pub struct Interpreter {
    registry: BatchRuleRegistry,
    stack: SharedStack,
    grad_enabled: Cell<bool>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(BatchRuleRegistry::with_default_rules())
    }

    #[must_use]
    pub fn with_registry(registry: BatchRuleRegistry) -> Self {
        Self {
            registry,
            stack: shared_stack(),
            grad_enabled: Cell::new(true),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &BatchRuleRegistry {
        &self.registry
    }

    pub(crate) fn stack(&self) -> &SharedStack {
        &self.stack
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.borrow().depth()
    }

    #[must_use]
    pub fn current_level(&self) -> Option<Level> {
        self.stack.borrow().current().map(Layer::level)
    }

    #[must_use]
    pub fn grad_enabled(&self) -> bool {
        self.grad_enabled.get()
    }

    pub fn set_grad_enabled(&self, enabled: bool) {
        self.grad_enabled.set(enabled);
    }

    /// Snapshot consulted when computing specialization-cache keys.
    #[must_use]
    pub fn local_state(&self) -> LocalState {
        LocalState::new(self.grad_enabled.get())
    }

    /// Raw layer surface for bindings. Most callers use [`Self::vmap`] and
    /// [`Self::grad_nesting`], which scope the push/pop automatically.
    pub fn push_layer(&self, kind: TransformKind) -> Level {
        self.stack.borrow_mut().push(kind)
    }

    pub fn pop_layer(&self, expected: KindTag) -> Result<Layer, ApiError> {
        Ok(self.stack.borrow_mut().pop(expected)?)
    }

    /// The primitive interception point: every array operation a transformed
    /// function performs goes through here.
    pub fn call(
        &self,
        primitive: Primitive,
        args: &[TracedValue],
        opts: &OpParams,
    ) -> Result<TracedValue, ApiError> {
        let layers = self.stack.borrow().layers().to_vec();
        Ok(lm_dispatch::dispatch(
            &self.registry,
            &layers,
            primitive,
            args,
            opts,
        )?)
    }

    /// `call` without static parameters.
    pub fn call0(
        &self,
        primitive: Primitive,
        args: &[TracedValue],
    ) -> Result<TracedValue, ApiError> {
        self.call(primitive, args, &OpParams::new())
    }
}
