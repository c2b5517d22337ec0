#![forbid(unsafe_code)]

pub mod tensor;

#[cfg(test)]
pub mod proptest_strategies;

pub use tensor::{Shape, TensorValue, ValueError, contiguous_strides};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Static (non-tensor) parameters of a primitive call: axes, permutations,
/// flags, all carried as strings and parsed at the point of use.
pub type OpParams = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DType {
    F64,
    I64,
    Bool,
}

impl DType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F64 => "f64",
            Self::I64 => "i64",
            Self::Bool => "bool",
        }
    }

    /// Stable small integer used when packing dtype into a cache-key byte.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::F64 => 0,
            Self::I64 => 1,
            Self::Bool => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Device {
    #[default]
    Cpu,
}

impl Device {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
        }
    }
}

/// A single element. Floats are stored bit-exact so literals stay `Eq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    I64(i64),
    Bool(bool),
    F64Bits(u64),
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::F64Bits(bits) => Some(f64::from_bits(bits)),
            Self::I64(value) => Some(value as f64),
            Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::F64Bits(_) | Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(value),
            Self::I64(_) | Self::F64Bits(_) => None,
        }
    }

    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
            Self::F64Bits(_) => DType::F64,
        }
    }

    /// Additive identity for the literal's dtype family.
    #[must_use]
    pub fn zero(dtype: DType) -> Self {
        match dtype {
            DType::F64 => Self::from_f64(0.0),
            DType::I64 => Self::I64(0),
            DType::Bool => Self::Bool(false),
        }
    }
}

/// Identifier of one primitive array operation. Overloads of the same
/// operation family are distinguished by operand arity at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Primitive {
    // Unary elementwise
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Sin,
    Cos,
    Tanh,
    Sign,
    Square,
    // Binary elementwise
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Max,
    Min,
    // Comparison
    Eq,
    Lt,
    // Reduction
    ReduceSum,
    ReduceMax,
    // Contraction
    Dot,
    // Movement
    Reshape,
    Transpose,
    Expand,
    Squeeze,
    Unsqueeze,
    MoveDim,
    Select,
    Narrow,
    Stack,
    Concatenate,
    // Index generation
    Arange,
    // Index family
    Index,
    IndexPut,
    Gather,
    Scatter,
    ScatterAdd,
    IndexSelect,
    IndexAdd,
    // Normalization family
    BatchNorm,
    GroupNorm,
    // Catalogue entries deliberately served by the fallback loop
    Sort,
    Cumsum,
}

impl Primitive {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sqrt => "sqrt",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tanh => "tanh",
            Self::Sign => "sign",
            Self::Square => "square",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Pow => "pow",
            Self::Max => "max",
            Self::Min => "min",
            Self::Eq => "eq",
            Self::Lt => "lt",
            Self::ReduceSum => "reduce_sum",
            Self::ReduceMax => "reduce_max",
            Self::Dot => "dot",
            Self::Reshape => "reshape",
            Self::Transpose => "transpose",
            Self::Expand => "expand",
            Self::Squeeze => "squeeze",
            Self::Unsqueeze => "unsqueeze",
            Self::MoveDim => "movedim",
            Self::Select => "select",
            Self::Narrow => "narrow",
            Self::Stack => "stack",
            Self::Concatenate => "concatenate",
            Self::Arange => "arange",
            Self::Index => "index",
            Self::IndexPut => "index_put",
            Self::Gather => "gather",
            Self::Scatter => "scatter",
            Self::ScatterAdd => "scatter_add",
            Self::IndexSelect => "index_select",
            Self::IndexAdd => "index_add",
            Self::BatchNorm => "batch_norm",
            Self::GroupNorm => "group_norm",
            Self::Sort => "sort",
            Self::Cumsum => "cumsum",
        }
    }

    /// Stable operation code appended to specialization-cache keys.
    #[must_use]
    pub fn code(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Scalar(Literal),
    Tensor(TensorValue),
}

impl Value {
    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self::Scalar(Literal::I64(value))
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self::Scalar(Literal::from_f64(value))
    }

    #[must_use]
    pub fn scalar_bool(value: bool) -> Self {
        Self::Scalar(Literal::Bool(value))
    }

    pub fn vector_f64(values: &[f64]) -> Result<Self, ValueError> {
        let elements = values
            .iter()
            .copied()
            .map(Literal::from_f64)
            .collect::<Vec<_>>();
        Ok(Self::Tensor(TensorValue::new(
            DType::F64,
            Shape::vector(values.len()),
            elements,
        )?))
    }

    pub fn vector_i64(values: &[i64]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::I64).collect::<Vec<_>>();
        Ok(Self::Tensor(TensorValue::new(
            DType::I64,
            Shape::vector(values.len()),
            elements,
        )?))
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Scalar(lit) => lit.dtype(),
            Self::Tensor(t) => t.dtype,
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        match self {
            Self::Scalar(_) => 0,
            Self::Tensor(t) => t.rank(),
        }
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        match self {
            Self::Scalar(_) => &[],
            Self::Tensor(t) => t.dims(),
        }
    }

    #[must_use]
    pub fn requires_grad(&self) -> bool {
        match self {
            Self::Scalar(_) => false,
            Self::Tensor(t) => t.requires_grad,
        }
    }

    #[must_use]
    pub fn as_scalar_literal(&self) -> Option<Literal> {
        match self {
            Self::Scalar(lit) => Some(*lit),
            Self::Tensor(_) => None,
        }
    }

    #[must_use]
    pub fn as_f64_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(lit) => lit.as_f64(),
            Self::Tensor(t) => t.item().and_then(Literal::as_f64),
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Scalar(_) => None,
            Self::Tensor(tensor) => Some(tensor),
        }
    }

    /// View the value uniformly as a tensor (scalars become rank-0 tensors).
    #[must_use]
    pub fn to_tensor(&self) -> TensorValue {
        match self {
            Self::Scalar(lit) => TensorValue::from_literal(*lit),
            Self::Tensor(t) => t.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DType, Literal, Primitive, Value};

    #[test]
    fn literal_f64_round_trips_bit_exact() {
        for raw in [0.0, -0.0, 1.5, f64::NAN, f64::INFINITY] {
            let lit = Literal::from_f64(raw);
            let back = lit.as_f64().expect("f64 literal should read back");
            assert_eq!(raw.to_bits(), back.to_bits());
        }
    }

    #[test]
    fn literal_dtype_classification() {
        assert_eq!(Literal::I64(3).dtype(), DType::I64);
        assert_eq!(Literal::Bool(true).dtype(), DType::Bool);
        assert_eq!(Literal::from_f64(0.5).dtype(), DType::F64);
    }

    #[test]
    fn primitive_codes_are_distinct() {
        let all = [
            Primitive::Neg,
            Primitive::Add,
            Primitive::ReduceSum,
            Primitive::Index,
            Primitive::IndexPut,
            Primitive::BatchNorm,
            Primitive::Cumsum,
        ];
        let mut seen = std::collections::BTreeSet::new();
        for op in all {
            assert!(seen.insert(op.code()), "duplicate code for {}", op.as_str());
        }
    }

    #[test]
    fn scalar_value_accessors() {
        let v = Value::scalar_f64(2.5);
        assert_eq!(v.rank(), 0);
        assert_eq!(v.as_f64_scalar(), Some(2.5));
        assert!(v.as_tensor().is_none());
        assert!(!v.requires_grad());
    }

    #[test]
    fn vector_value_builds_rank_one_tensor() {
        let v = Value::vector_f64(&[1.0, 2.0, 3.0]).expect("vector should build");
        assert_eq!(v.rank(), 1);
        assert_eq!(v.dims(), &[3]);
        assert_eq!(v.dtype(), DType::F64);
    }

    #[test]
    fn scalar_to_tensor_is_rank_zero() {
        let t = Value::scalar_i64(7).to_tensor();
        assert_eq!(t.rank(), 0);
        assert_eq!(t.item(), Some(Literal::I64(7)));
    }
}
