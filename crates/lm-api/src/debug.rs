//! Introspection helpers over the wrapper stack.

use lm_batch::TracedValue;
use lm_core::Value;
use std::fmt::Write;

pub use lm_batch::dtype_of;

/// Human-readable description of a value's wrapper stack, outermost first.
#[must_use]
pub fn describe(value: &TracedValue) -> String {
    let mut out = String::new();
    let mut cursor = value;
    loop {
        match cursor {
            TracedValue::Plain(Value::Scalar(lit)) => {
                let _ = write!(out, "scalar {}", lit.dtype().as_str());
                return out;
            }
            TracedValue::Plain(Value::Tensor(t)) => {
                let _ = write!(out, "tensor {} {:?}", t.dtype.as_str(), t.dims());
                return out;
            }
            TracedValue::Batched(b) => {
                match b.bdim {
                    Some(axis) => {
                        let _ = write!(out, "batched[{}, bdim={}] -> ", b.level, axis);
                    }
                    None => {
                        let _ = write!(out, "batched[{}, broadcast] -> ", b.level);
                    }
                }
                cursor = &b.base;
            }
            TracedValue::Tracked(t) => {
                let state = if t.is_alive() { "alive" } else { "dead" };
                let _ = write!(out, "tracked[{}, {}] -> ", t.level, state);
                cursor = &t.base;
            }
        }
    }
}
