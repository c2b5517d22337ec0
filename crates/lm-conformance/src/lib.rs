#![forbid(unsafe_code)]

//! Shared fixtures and comparators for the conformance suites.

use lm_core::{TensorValue, Value};
use serde::Serialize;

/// Identifying payload logged with each conformance case.
#[derive(Debug, Clone, Serialize)]
pub struct ConformanceFixture {
    pub case_id: String,
    pub operation: String,
    pub dims: Vec<usize>,
}

impl ConformanceFixture {
    #[must_use]
    pub fn new(case_id: &str, operation: &str, dims: &[usize]) -> Self {
        Self {
            case_id: case_id.to_owned(),
            operation: operation.to_owned(),
            dims: dims.to_vec(),
        }
    }

    /// Emit a pass log for this case, verifying the schema on the way.
    pub fn log_pass(&self, module_path: &str, test_name: &str) {
        let fixture_id = lm_test_utils::fixture_id_from_json(self).expect("fixture digest");
        let log = lm_test_utils::TestLogV1::unit(
            lm_test_utils::test_id(module_path, test_name),
            fixture_id,
            lm_test_utils::TestResult::Pass,
        );
        assert_eq!(log.schema_version, lm_test_utils::TEST_LOG_SCHEMA_VERSION);
    }
}

pub fn tensor_f64(dims: &[usize], values: &[f64]) -> Value {
    Value::Tensor(TensorValue::from_f64_slice(dims, values).expect("fixture tensor should build"))
}

pub fn tensor_i64(dims: &[usize], values: &[i64]) -> Value {
    Value::Tensor(TensorValue::from_i64_slice(dims, values).expect("fixture tensor should build"))
}

pub fn values_of(value: &Value) -> Vec<f64> {
    value
        .as_tensor()
        .expect("tensor value")
        .to_f64_vec()
        .expect("numeric tensor")
}

/// Elementwise comparison within a floating tolerance.
pub fn assert_allclose(actual: &Value, expected: &Value, tolerance: f64) {
    let actual_t = actual.as_tensor().expect("tensor value");
    let expected_t = expected.as_tensor().expect("tensor value");
    assert_eq!(actual_t.dims(), expected_t.dims(), "shape mismatch");
    let a = actual_t.to_f64_vec().expect("numeric tensor");
    let e = expected_t.to_f64_vec().expect("numeric tensor");
    for (i, (x, y)) in a.iter().zip(e.iter()).enumerate() {
        assert!(
            (x - y).abs() <= tolerance,
            "element {i}: expected {y}, got {x}"
        );
    }
}

/// Exact (bit-level) comparison of two tensor values.
pub fn assert_bit_identical(actual: &Value, expected: &Value) {
    let actual_t = actual.as_tensor().expect("tensor value");
    let expected_t = expected.as_tensor().expect("tensor value");
    assert_eq!(actual_t.dims(), expected_t.dims(), "shape mismatch");
    assert_eq!(
        actual_t.elements(),
        expected_t.elements(),
        "element sequences must be bit-identical"
    );
}
