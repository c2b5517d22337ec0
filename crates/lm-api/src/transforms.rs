//! Transform entry points: `vmap` and grad nesting.

use crate::{ApiError, Interpreter};
use lm_batch::{TracedValue, unwrap_at, wrap_batched, wrap_tracked};
use lm_core::Value;
use lm_dispatch::DispatchCtx;
use lm_stack::{ScopedLayer, TransformKind};

/// Which axis of an input/output is the mapped (batch) axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisSpec {
    /// Mapped along the given axis; negative indices count from the back.
    Batched(i32),
    /// Not mapped: broadcast to every batch element.
    NotBatched,
}

impl AxisSpec {
    /// Resolve a possibly negative axis against `rank` positions.
    fn resolve(self, rank: usize) -> Option<usize> {
        match self {
            Self::NotBatched => None,
            Self::Batched(axis) => {
                if axis >= 0 {
                    Some(axis as usize)
                } else {
                    let resolved = rank as i32 + axis;
                    if resolved >= 0 { Some(resolved as usize) } else { None }
                }
            }
        }
    }
}

impl Interpreter {
    /// Vectorize `f` over a batch axis of its inputs. The returned builder
    /// carries in/out axis configuration; `call` runs the transform.
    pub fn vmap<F>(&self, f: F) -> Vmapped<'_, F>
    where
        F: Fn(&Interpreter, &[TracedValue]) -> Result<Vec<TracedValue>, ApiError>,
    {
        Vmapped {
            interp: self,
            f,
            in_axes: None,
            out_axes: None,
        }
    }

    /// Run `f` under a differentiation layer: inputs are wrapped for
    /// gradient bookkeeping at a fresh level, outputs unwrapped at it, and
    /// the layer (plus the previous grad mode) is restored on every exit
    /// path. The wrappers created here die with the layer.
    pub fn grad_nesting<F>(
        &self,
        f: F,
        args: &[TracedValue],
    ) -> Result<Vec<TracedValue>, ApiError>
    where
        F: Fn(&Interpreter, &[TracedValue]) -> Result<Vec<TracedValue>, ApiError>,
    {
        let prev = self.grad_enabled();
        let scope = ScopedLayer::enter(
            self.stack(),
            TransformKind::Differentiate {
                prev_grad_enabled: prev,
            },
        );
        self.set_grad_enabled(true);
        let layer = scope.layer();
        let wrapped: Vec<TracedValue> = args
            .iter()
            .map(|arg| wrap_tracked(arg.clone(), &layer))
            .collect();

        let run = (f)(self, &wrapped);
        self.set_grad_enabled(prev);
        let outputs = run?;

        let level = scope.level();
        let results = outputs
            .into_iter()
            .map(|out| unwrap_at(&out, level).0)
            .collect();
        drop(scope);
        Ok(results)
    }
}

/// A function vectorized over a batch axis.
pub struct Vmapped<'i, F> {
    interp: &'i Interpreter,
    f: F,
    in_axes: Option<Vec<AxisSpec>>,
    out_axes: Option<Vec<AxisSpec>>,
}

impl<F> Vmapped<'_, F>
where
    F: Fn(&Interpreter, &[TracedValue]) -> Result<Vec<TracedValue>, ApiError>,
{
    /// Per-input batch axis; defaults to axis 0 for every input.
    #[must_use]
    pub fn with_in_axes(mut self, in_axes: &[AxisSpec]) -> Self {
        self.in_axes = Some(in_axes.to_vec());
        self
    }

    /// Per-output placement of the batch axis; defaults to axis 0.
    #[must_use]
    pub fn with_out_axes(mut self, out_axes: &[AxisSpec]) -> Self {
        self.out_axes = Some(out_axes.to_vec());
        self
    }

    /// Top-level entry: plain values in, plain values out.
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, ApiError> {
        let traced: Vec<TracedValue> = args
            .iter()
            .cloned()
            .map(TracedValue::Plain)
            .collect();
        let outputs = self.call_traced(&traced)?;
        outputs
            .into_iter()
            .map(|out| match out {
                TracedValue::Plain(value) => Ok(value),
                other => Err(ApiError::WrappedOutput {
                    level: other.level_of(),
                }),
            })
            .collect()
    }

    /// Nested entry: used when composing transforms, where arguments may
    /// already carry outer-level wrappers.
    pub fn call_traced(&self, args: &[TracedValue]) -> Result<Vec<TracedValue>, ApiError> {
        let in_axes = match &self.in_axes {
            None => vec![AxisSpec::Batched(0); args.len()],
            Some(axes) => {
                if axes.len() != args.len() {
                    return Err(ApiError::AxesCountMismatch {
                        expected: args.len(),
                        actual: axes.len(),
                    });
                }
                axes.clone()
            }
        };

        // Resolve every mapped axis and agree on the batch size before any
        // layer state changes.
        let mut batch_size: Option<usize> = None;
        let mut resolved_axes: Vec<Option<usize>> = Vec::with_capacity(args.len());
        for (arg, spec) in args.iter().zip(in_axes.iter()) {
            match spec {
                AxisSpec::NotBatched => resolved_axes.push(None),
                AxisSpec::Batched(raw) => {
                    let dims = arg.logical_dims()?;
                    if dims.is_empty() {
                        return Err(ApiError::CannotBatchRankZero);
                    }
                    let resolved =
                        spec.resolve(dims.len())
                            .filter(|&axis| axis < dims.len())
                            .ok_or(ApiError::AxisOutOfBounds {
                                axis: *raw,
                                ndim: dims.len(),
                            })?;
                    let size = dims[resolved];
                    match batch_size {
                        None => batch_size = Some(size),
                        Some(expected) if expected != size => {
                            return Err(ApiError::MismatchedBatchDimension {
                                expected,
                                actual: size,
                            });
                        }
                        Some(_) => {}
                    }
                    resolved_axes.push(Some(resolved));
                }
            }
        }
        let batch_size = batch_size.ok_or(ApiError::NoBatchedInput)?;

        // Push the layer; the scope guarantees the pop on every exit path.
        let scope = ScopedLayer::enter(
            self.interp.stack(),
            TransformKind::Vectorize { batch_size },
        );
        let level = scope.level();

        let wrapped: Vec<TracedValue> = args
            .iter()
            .zip(resolved_axes.iter())
            .map(|(arg, axis)| match axis {
                None => arg.clone(),
                Some(axis) => wrap_batched(arg.clone(), Some(*axis), level),
            })
            .collect();

        let outputs = (self.f)(self.interp, &wrapped)?;

        let out_axes = match &self.out_axes {
            None => vec![AxisSpec::Batched(0); outputs.len()],
            Some(axes) => {
                if axes.len() != outputs.len() {
                    return Err(ApiError::AxesCountMismatch {
                        expected: outputs.len(),
                        actual: axes.len(),
                    });
                }
                axes.clone()
            }
        };

        // Remove the level's batch axis from every output while the layer is
        // still current: outputs that never interacted with the level are
        // broadcast to the batch instead.
        let all_layers = self.interp.stack().borrow().layers().to_vec();
        let outer = &all_layers[..all_layers.len() - 1];
        let ctx = DispatchCtx {
            registry: self.interp.registry(),
            layers: outer,
        };

        let mut results = Vec::with_capacity(outputs.len());
        for (out, spec) in outputs.into_iter().zip(out_axes.iter()) {
            let (base, bdim) = unwrap_at(&out, level);
            let value = match (bdim, spec) {
                (None, AxisSpec::NotBatched) => base,
                (None, AxisSpec::Batched(raw)) => {
                    // Never interacted with this level: insert and broadcast.
                    let dims = base.logical_dims()?;
                    let out_dim = spec
                        .resolve(dims.len() + 1)
                        .filter(|&axis| axis <= dims.len())
                        .ok_or(ApiError::AxisOutOfBounds {
                            axis: *raw,
                            ndim: dims.len() + 1,
                        })?;
                    let mut target = dims.clone();
                    target.insert(out_dim, batch_size);
                    let unsqueezed = ctx.unsqueeze(base, out_dim)?;
                    ctx.expand(unsqueezed, &target)?
                }
                (Some(_), AxisSpec::NotBatched) => {
                    return Err(ApiError::BatchedOutputWithNoneAxis);
                }
                (Some(axis), AxisSpec::Batched(raw)) => {
                    let rank = base.logical_rank()?;
                    let out_dim = spec
                        .resolve(rank)
                        .filter(|&dim| dim < rank)
                        .ok_or(ApiError::AxisOutOfBounds {
                            axis: *raw,
                            ndim: rank,
                        })?;
                    ctx.movedim(base, axis, out_dim)?
                }
            };
            results.push(value);
        }
        drop(scope);
        Ok(results)
    }
}
