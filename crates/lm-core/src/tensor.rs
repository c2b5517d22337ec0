//! Strided tensor views over shared element storage.
//!
//! A `TensorValue` is a logical view: shape plus per-dimension strides (in
//! elements) and a start offset into a shared buffer. Stride 0 encodes an
//! expanded (broadcast) axis, so views produced by `expand`/`select`/
//! `permute` never copy. Ops that need dense storage call `to_contiguous`.

use crate::{DType, Device, Literal};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<usize>,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: usize) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn of(dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1_usize, |acc, dim| acc.checked_mul(*dim))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    ShapeOverflow {
        dims: Vec<usize>,
    },
    ElementCountMismatch {
        dims: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    AxisOutOfBounds {
        axis: usize,
        rank: usize,
    },
    IndexOutOfBounds {
        index: usize,
        axis_size: usize,
    },
    InvalidPermutation {
        permutation: Vec<usize>,
        rank: usize,
    },
    ExpandMismatch {
        from: Vec<usize>,
        to: Vec<usize>,
    },
    NarrowOutOfBounds {
        axis: usize,
        start: usize,
        len: usize,
        axis_size: usize,
    },
    SqueezeNonUnitAxis {
        axis: usize,
        axis_size: usize,
    },
    ReshapeCountMismatch {
        from: Vec<usize>,
        to: Vec<usize>,
    },
    EmptyStack,
    StackShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    StackDTypeMismatch {
        expected: DType,
        actual: DType,
    },
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeOverflow { dims } => {
                write!(f, "shape element count overflowed: {dims:?}")
            }
            Self::ElementCountMismatch {
                dims,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "element count mismatch for shape {dims:?}: expected {expected}, got {actual}"
                )
            }
            Self::AxisOutOfBounds { axis, rank } => {
                write!(f, "axis {axis} out of bounds for rank {rank}")
            }
            Self::IndexOutOfBounds { index, axis_size } => {
                write!(f, "index {index} out of bounds for axis size {axis_size}")
            }
            Self::InvalidPermutation { permutation, rank } => {
                write!(f, "invalid permutation {permutation:?} for rank {rank}")
            }
            Self::ExpandMismatch { from, to } => {
                write!(f, "cannot expand shape {from:?} to {to:?}")
            }
            Self::NarrowOutOfBounds {
                axis,
                start,
                len,
                axis_size,
            } => {
                write!(
                    f,
                    "narrow [{start}, {start}+{len}) out of bounds on axis {axis} of size {axis_size}"
                )
            }
            Self::SqueezeNonUnitAxis { axis, axis_size } => {
                write!(f, "cannot squeeze axis {axis} of size {axis_size}")
            }
            Self::ReshapeCountMismatch { from, to } => {
                write!(f, "cannot reshape {from:?} into {to:?}")
            }
            Self::EmptyStack => write!(f, "cannot stack an empty value list"),
            Self::StackShapeMismatch { expected, actual } => {
                write!(f, "stack shape mismatch: expected {expected:?}, got {actual:?}")
            }
            Self::StackDTypeMismatch { expected, actual } => {
                write!(
                    f,
                    "stack dtype mismatch: expected {}, got {}",
                    expected.as_str(),
                    actual.as_str()
                )
            }
        }
    }
}

impl std::error::Error for ValueError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
    data: Arc<Vec<Literal>>,
    pub device: Device,
    pub requires_grad: bool,
}

/// Row-major strides, in elements, for a dense layout of `dims`.
#[must_use]
pub fn contiguous_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1_usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc = acc.saturating_mul(*dim);
    }
    strides
}

impl TensorValue {
    pub fn new(dtype: DType, shape: Shape, elements: Vec<Literal>) -> Result<Self, ValueError> {
        let expected = shape.element_count().ok_or(ValueError::ShapeOverflow {
            dims: shape.dims.clone(),
        })?;
        if expected != elements.len() {
            return Err(ValueError::ElementCountMismatch {
                dims: shape.dims,
                expected,
                actual: elements.len(),
            });
        }
        let strides = contiguous_strides(&shape.dims);
        Ok(Self {
            dtype,
            shape,
            strides,
            offset: 0,
            data: Arc::new(elements),
            device: Device::Cpu,
            requires_grad: false,
        })
    }

    #[must_use]
    pub fn from_literal(literal: Literal) -> Self {
        Self {
            dtype: literal.dtype(),
            shape: Shape::scalar(),
            strides: Vec::new(),
            offset: 0,
            data: Arc::new(vec![literal]),
            device: Device::Cpu,
            requires_grad: false,
        }
    }

    pub fn from_f64_slice(dims: &[usize], values: &[f64]) -> Result<Self, ValueError> {
        Self::new(
            DType::F64,
            Shape::of(dims),
            values.iter().copied().map(Literal::from_f64).collect(),
        )
    }

    pub fn from_i64_slice(dims: &[usize], values: &[i64]) -> Result<Self, ValueError> {
        Self::new(
            DType::I64,
            Shape::of(dims),
            values.iter().copied().map(Literal::I64).collect(),
        )
    }

    #[must_use]
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.shape.dims
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shape.element_count().unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at a full multi-index. The index must be in bounds.
    #[must_use]
    pub fn get(&self, index: &[usize]) -> Literal {
        debug_assert_eq!(index.len(), self.rank());
        let mut pos = self.offset;
        for (i, idx) in index.iter().enumerate() {
            debug_assert!(*idx < self.shape.dims[i]);
            pos += idx * self.strides[i];
        }
        self.data[pos]
    }

    /// Element at a row-major logical position.
    #[must_use]
    pub fn get_linear(&self, linear: usize) -> Literal {
        let mut pos = self.offset;
        let mut rem = linear;
        for i in (0..self.rank()).rev() {
            let dim = self.shape.dims[i];
            pos += (rem % dim) * self.strides[i];
            rem /= dim;
        }
        self.data[pos]
    }

    /// All elements in row-major logical order.
    #[must_use]
    pub fn elements(&self) -> Vec<Literal> {
        let n = self.len();
        let mut out = Vec::with_capacity(n);
        for linear in 0..n {
            out.push(self.get_linear(linear));
        }
        out
    }

    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        self.elements().into_iter().map(Literal::as_f64).collect()
    }

    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        self.elements().into_iter().map(Literal::as_i64).collect()
    }

    /// The single element of a rank-0 tensor.
    #[must_use]
    pub fn item(&self) -> Option<Literal> {
        if self.rank() == 0 {
            Some(self.data[self.offset])
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.strides == contiguous_strides(&self.shape.dims)
    }

    /// Densely materialized copy with row-major strides and offset 0.
    #[must_use]
    pub fn to_contiguous(&self) -> Self {
        Self {
            dtype: self.dtype,
            shape: self.shape.clone(),
            strides: contiguous_strides(&self.shape.dims),
            offset: 0,
            data: Arc::new(self.elements()),
            device: self.device,
            requires_grad: self.requires_grad,
        }
    }

    fn check_axis(&self, axis: usize) -> Result<(), ValueError> {
        if axis >= self.rank() {
            return Err(ValueError::AxisOutOfBounds {
                axis,
                rank: self.rank(),
            });
        }
        Ok(())
    }

    pub fn permute(&self, permutation: &[usize]) -> Result<Self, ValueError> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        if permutation.len() != rank
            || permutation.iter().any(|&p| {
                if p >= rank || seen[p] {
                    true
                } else {
                    seen[p] = true;
                    false
                }
            })
        {
            return Err(ValueError::InvalidPermutation {
                permutation: permutation.to_vec(),
                rank,
            });
        }
        let mut out = self.clone();
        out.shape.dims = permutation.iter().map(|&p| self.shape.dims[p]).collect();
        out.strides = permutation.iter().map(|&p| self.strides[p]).collect();
        Ok(out)
    }

    /// Move the axis at `src` to position `dst`, preserving the order of the
    /// other axes.
    pub fn movedim(&self, src: usize, dst: usize) -> Result<Self, ValueError> {
        self.check_axis(src)?;
        self.check_axis(dst)?;
        if src == dst {
            return Ok(self.clone());
        }
        let mut permutation: SmallVec<[usize; 5]> = (0..self.rank()).filter(|&d| d != src).collect();
        permutation.insert(dst, src);
        self.permute(&permutation)
    }

    /// Index one axis, removing it from the view.
    pub fn select(&self, axis: usize, index: usize) -> Result<Self, ValueError> {
        self.check_axis(axis)?;
        let axis_size = self.shape.dims[axis];
        if index >= axis_size {
            return Err(ValueError::IndexOutOfBounds { index, axis_size });
        }
        let mut out = self.clone();
        out.offset += index * self.strides[axis];
        out.shape.dims.remove(axis);
        out.strides.remove(axis);
        Ok(out)
    }

    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Self, ValueError> {
        self.check_axis(axis)?;
        let axis_size = self.shape.dims[axis];
        if start.checked_add(len).is_none_or(|end| end > axis_size) {
            return Err(ValueError::NarrowOutOfBounds {
                axis,
                start,
                len,
                axis_size,
            });
        }
        let mut out = self.clone();
        out.offset += start * self.strides[axis];
        out.shape.dims[axis] = len;
        Ok(out)
    }

    /// Broadcast to `target` without copying. `target` may have higher rank;
    /// shapes align from the trailing dimension, and size-1 axes (or newly
    /// prepended axes) become stride-0 axes.
    pub fn expand(&self, target: &[usize]) -> Result<Self, ValueError> {
        let rank = self.rank();
        if target.len() < rank {
            return Err(ValueError::ExpandMismatch {
                from: self.shape.dims.clone(),
                to: target.to_vec(),
            });
        }
        let lead = target.len() - rank;
        let mut strides = vec![0_usize; target.len()];
        for (i, &size) in target.iter().enumerate().skip(lead) {
            let j = i - lead;
            if self.shape.dims[j] == size {
                strides[i] = self.strides[j];
            } else if self.shape.dims[j] == 1 {
                strides[i] = 0;
            } else {
                return Err(ValueError::ExpandMismatch {
                    from: self.shape.dims.clone(),
                    to: target.to_vec(),
                });
            }
        }
        let mut out = self.clone();
        out.shape.dims = target.to_vec();
        out.strides = strides;
        Ok(out)
    }

    /// Insert a size-1 axis at `axis` (which may equal the current rank).
    pub fn unsqueeze(&self, axis: usize) -> Result<Self, ValueError> {
        let rank = self.rank();
        if axis > rank {
            return Err(ValueError::AxisOutOfBounds { axis, rank });
        }
        let stride = if axis == rank {
            1
        } else {
            self.strides[axis] * self.shape.dims[axis]
        };
        let mut out = self.clone();
        out.shape.dims.insert(axis, 1);
        out.strides.insert(axis, stride);
        Ok(out)
    }

    pub fn squeeze(&self, axis: usize) -> Result<Self, ValueError> {
        self.check_axis(axis)?;
        let axis_size = self.shape.dims[axis];
        if axis_size != 1 {
            return Err(ValueError::SqueezeNonUnitAxis { axis, axis_size });
        }
        let mut out = self.clone();
        out.shape.dims.remove(axis);
        out.strides.remove(axis);
        Ok(out)
    }

    /// Reinterpret as `new_dims`. Materializes the view, so the result is
    /// always contiguous.
    pub fn reshape(&self, new_dims: &[usize]) -> Result<Self, ValueError> {
        let target = Shape::of(new_dims);
        let target_count = target.element_count().ok_or(ValueError::ShapeOverflow {
            dims: new_dims.to_vec(),
        })?;
        if target_count != self.len() {
            return Err(ValueError::ReshapeCountMismatch {
                from: self.shape.dims.clone(),
                to: new_dims.to_vec(),
            });
        }
        let mut out = self.to_contiguous();
        out.shape = target;
        out.strides = contiguous_strides(new_dims);
        Ok(out)
    }

    /// Stack equally shaped tensors along a new leading axis.
    pub fn stack_axis0(parts: &[Self]) -> Result<Self, ValueError> {
        let first = parts.first().ok_or(ValueError::EmptyStack)?;
        let mut elements = Vec::with_capacity(first.len() * parts.len());
        let mut requires_grad = false;
        for part in parts {
            if part.dtype != first.dtype {
                return Err(ValueError::StackDTypeMismatch {
                    expected: first.dtype,
                    actual: part.dtype,
                });
            }
            if part.shape != first.shape {
                return Err(ValueError::StackShapeMismatch {
                    expected: first.shape.dims.clone(),
                    actual: part.shape.dims.clone(),
                });
            }
            requires_grad |= part.requires_grad;
            elements.extend(part.elements());
        }
        let mut dims = Vec::with_capacity(first.rank() + 1);
        dims.push(parts.len());
        dims.extend_from_slice(first.dims());
        Ok(Self::new(first.dtype, Shape { dims }, elements)?.with_requires_grad(requires_grad))
    }
}

/// Equality is logical: dtype, shape, and the element sequence. Layout
/// (strides, offset, sharing) is representation, not identity.
impl PartialEq for TensorValue {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.shape == other.shape
            && self.elements() == other.elements()
    }
}

#[cfg(test)]
mod tests {
    use super::{Shape, TensorValue, ValueError, contiguous_strides};
    use crate::{DType, Literal};

    fn iota(dims: &[usize]) -> TensorValue {
        let n = dims.iter().product::<usize>();
        TensorValue::from_i64_slice(dims, &(0..n as i64).collect::<Vec<_>>())
            .expect("tensor should build")
    }

    #[test]
    fn contiguous_strides_row_major() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(contiguous_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn new_rejects_element_count_mismatch() {
        let err = TensorValue::new(DType::I64, Shape::of(&[2, 2]), vec![Literal::I64(1)])
            .expect_err("should reject short element vector");
        assert!(matches!(err, ValueError::ElementCountMismatch { .. }));
    }

    #[test]
    fn select_removes_axis_and_offsets() {
        let t = iota(&[2, 3]);
        let row = t.select(0, 1).expect("select should succeed");
        assert_eq!(row.dims(), &[3]);
        assert_eq!(row.to_i64_vec(), Some(vec![3, 4, 5]));
        let col = t.select(1, 2).expect("select should succeed");
        assert_eq!(col.to_i64_vec(), Some(vec![2, 5]));
    }

    #[test]
    fn permute_transposes_logically() {
        let t = iota(&[2, 3]);
        let tt = t.permute(&[1, 0]).expect("permute should succeed");
        assert_eq!(tt.dims(), &[3, 2]);
        assert_eq!(tt.to_i64_vec(), Some(vec![0, 3, 1, 4, 2, 5]));
        assert!(!tt.is_contiguous());
    }

    #[test]
    fn movedim_matches_manual_permutation() {
        let t = iota(&[2, 3, 4]);
        let moved = t.movedim(2, 0).expect("movedim should succeed");
        let permuted = t.permute(&[2, 0, 1]).expect("permute should succeed");
        assert_eq!(moved, permuted);
    }

    #[test]
    fn expand_broadcasts_without_copy() {
        let t = iota(&[1, 3]);
        let e = t.expand(&[4, 3]).expect("expand should succeed");
        assert_eq!(e.dims(), &[4, 3]);
        assert_eq!(e.strides()[0], 0);
        assert_eq!(
            e.to_i64_vec(),
            Some(vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0, 1, 2])
        );

        let lead = iota(&[3]).expand(&[2, 3]).expect("rank-raising expand");
        assert_eq!(lead.to_i64_vec(), Some(vec![0, 1, 2, 0, 1, 2]));
    }

    #[test]
    fn expand_rejects_incompatible_sizes() {
        let t = iota(&[2, 3]);
        let err = t.expand(&[4, 3]).expect_err("size 2 cannot expand to 4");
        assert!(matches!(err, ValueError::ExpandMismatch { .. }));
    }

    #[test]
    fn unsqueeze_squeeze_round_trip() {
        let t = iota(&[2, 3]);
        let u = t.unsqueeze(1).expect("unsqueeze should succeed");
        assert_eq!(u.dims(), &[2, 1, 3]);
        let back = u.squeeze(1).expect("squeeze should succeed");
        assert_eq!(back, t);
        assert!(matches!(
            t.squeeze(0),
            Err(ValueError::SqueezeNonUnitAxis { .. })
        ));
    }

    #[test]
    fn narrow_limits_one_axis() {
        let t = iota(&[4, 2]);
        let mid = t.narrow(0, 1, 2).expect("narrow should succeed");
        assert_eq!(mid.dims(), &[2, 2]);
        assert_eq!(mid.to_i64_vec(), Some(vec![2, 3, 4, 5]));
    }

    #[test]
    fn reshape_materializes_any_view() {
        let t = iota(&[2, 3]).permute(&[1, 0]).expect("permute");
        let r = t.reshape(&[6]).expect("reshape should succeed");
        assert!(r.is_contiguous());
        assert_eq!(r.to_i64_vec(), Some(vec![0, 3, 1, 4, 2, 5]));
    }

    #[test]
    fn stack_axis0_prepends_axis() {
        let a = iota(&[2]);
        let b = TensorValue::from_i64_slice(&[2], &[10, 11]).expect("tensor");
        let s = TensorValue::stack_axis0(&[a, b]).expect("stack should succeed");
        assert_eq!(s.dims(), &[2, 2]);
        assert_eq!(s.to_i64_vec(), Some(vec![0, 1, 10, 11]));
    }

    #[test]
    fn stack_axis0_rejects_mismatches() {
        let a = iota(&[2]);
        let b = iota(&[3]);
        assert!(matches!(
            TensorValue::stack_axis0(&[a.clone(), b]),
            Err(ValueError::StackShapeMismatch { .. })
        ));
        let f = TensorValue::from_f64_slice(&[2], &[0.0, 1.0]).expect("tensor");
        assert!(matches!(
            TensorValue::stack_axis0(&[a, f]),
            Err(ValueError::StackDTypeMismatch { .. })
        ));
    }

    #[test]
    fn equality_is_logical_not_representational() {
        let dense = iota(&[2, 3]);
        let via_view = iota(&[3, 2]).permute(&[1, 0]).expect("permute");
        assert_ne!(dense, via_view);
        let same = dense.permute(&[0, 1]).expect("identity permute");
        assert_eq!(dense, same);
    }
}
