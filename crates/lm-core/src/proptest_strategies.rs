//! Proptest strategies shared by lm-core's property tests.

use crate::{DType, Literal, Shape, TensorValue};
use proptest::prelude::*;

pub fn arb_dtype() -> impl Strategy<Value = DType> {
    prop_oneof![Just(DType::F64), Just(DType::I64), Just(DType::Bool)]
}

pub fn arb_literal(dtype: DType) -> BoxedStrategy<Literal> {
    match dtype {
        DType::F64 => (-1.0e6_f64..1.0e6).prop_map(Literal::from_f64).boxed(),
        DType::I64 => (-1_000_000_i64..1_000_000).prop_map(Literal::I64).boxed(),
        DType::Bool => any::<bool>().prop_map(Literal::Bool).boxed(),
    }
}

/// Small shapes: rank 0..=3, every dimension 1..=4.
pub fn arb_shape() -> impl Strategy<Value = Shape> {
    prop::collection::vec(1_usize..=4, 0..=3).prop_map(|dims| Shape { dims })
}

pub fn arb_tensor() -> impl Strategy<Value = TensorValue> {
    (arb_dtype(), arb_shape()).prop_flat_map(|(dtype, shape)| {
        let count = shape.element_count().unwrap_or(0);
        prop::collection::vec(arb_literal(dtype), count).prop_map(move |elements| {
            TensorValue::new(dtype, shape.clone(), elements).expect("generated tensor is valid")
        })
    })
}

#[cfg(test)]
mod tests {
    use super::arb_tensor;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn select_then_stack_rebuilds_leading_axis(t in arb_tensor()) {
            prop_assume!(t.rank() >= 1 && !t.is_empty());
            let lead = t.dims()[0];
            let slices = (0..lead)
                .map(|i| t.select(0, i).expect("select in bounds"))
                .collect::<Vec<_>>();
            let rebuilt = crate::TensorValue::stack_axis0(&slices).expect("stack slices");
            prop_assert_eq!(rebuilt, t);
        }

        #[test]
        fn reshape_preserves_element_sequence(t in arb_tensor()) {
            let flat = t.reshape(&[t.len()]).expect("flatten");
            prop_assert_eq!(flat.elements(), t.elements());
        }
    }
}
