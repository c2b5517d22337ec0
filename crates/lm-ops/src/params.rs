//! Helpers for the stringly-typed static parameters of primitive calls.

use crate::EvalError;
use lm_core::{OpParams, Primitive};

pub fn format_csv<T: std::fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[must_use]
pub fn usize_list(params: &OpParams, key: &str) -> Vec<usize> {
    params
        .get(key)
        .map(|raw| {
            raw.split(',')
                .filter_map(|part| part.trim().parse::<usize>().ok())
                .collect()
        })
        .unwrap_or_default()
}

pub fn require_usize(
    primitive: Primitive,
    params: &OpParams,
    key: &'static str,
) -> Result<usize, EvalError> {
    let raw = params
        .get(key)
        .ok_or(EvalError::MissingParam { primitive, key })?;
    raw.trim().parse().map_err(|_| EvalError::InvalidParam {
        primitive,
        key,
        value: raw.clone(),
    })
}

pub fn usize_or(
    primitive: Primitive,
    params: &OpParams,
    key: &'static str,
    default: usize,
) -> Result<usize, EvalError> {
    match params.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| EvalError::InvalidParam {
            primitive,
            key,
            value: raw.clone(),
        }),
    }
}

pub fn i64_or(
    primitive: Primitive,
    params: &OpParams,
    key: &'static str,
    default: i64,
) -> Result<i64, EvalError> {
    match params.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| EvalError::InvalidParam {
            primitive,
            key,
            value: raw.clone(),
        }),
    }
}

pub fn require_i64(
    primitive: Primitive,
    params: &OpParams,
    key: &'static str,
) -> Result<i64, EvalError> {
    let raw = params
        .get(key)
        .ok_or(EvalError::MissingParam { primitive, key })?;
    raw.trim().parse().map_err(|_| EvalError::InvalidParam {
        primitive,
        key,
        value: raw.clone(),
    })
}

pub fn f64_or(
    primitive: Primitive,
    params: &OpParams,
    key: &'static str,
    default: f64,
) -> Result<f64, EvalError> {
    match params.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| EvalError::InvalidParam {
            primitive,
            key,
            value: raw.clone(),
        }),
    }
}

#[must_use]
pub fn bool_or(params: &OpParams, key: &str, default: bool) -> bool {
    match params.get(key).map(|raw| raw.trim()) {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}
