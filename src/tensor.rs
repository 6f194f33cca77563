//! Dynamically shaped, dtype-tagged tensors exchanged with graph runners.
//!
//! Tensors are immutable after construction and every accessor returns a
//! fresh copy of the underlying buffer, so no two tensors (and no caller)
//! ever alias the same storage. Operations that look like mutation
//! ([`concat_axis1`], frame appends) always allocate a new tensor.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Supported tensor element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    I64,
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F32 => write!(f, "float32"),
            DType::I64 => write!(f, "int64"),
        }
    }
}

/// Flat, dtype-homogeneous tensor storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I64(_) => DType::I64,
        }
    }
}

/// One dimension of a declared tensor shape: either a concrete size or a
/// symbolic name for a dynamic axis (e.g. `"sequence_steps"`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DimSpec {
    Size(i64),
    Symbol(String),
}

/// An n-dimensional numeric buffer with a validated shape. The dtype tag is
/// carried by the storage itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<i64>,
    data: TensorData,
}

impl Tensor {
    /// Build a float32 tensor, validating `data.len()` against the shape.
    pub fn from_f32(data: Vec<f32>, shape: &[i64]) -> Result<Self> {
        validate_shape_against_data(shape, data.len())?;
        Ok(Self {
            shape: shape.to_vec(),
            data: TensorData::F32(data),
        })
    }

    /// Build an int64 tensor, validating `data.len()` against the shape.
    pub fn from_i64(data: Vec<i64>, shape: &[i64]) -> Result<Self> {
        validate_shape_against_data(shape, data.len())?;
        Ok(Self {
            shape: shape.to_vec(),
            data: TensorData::I64(data),
        })
    }

    /// Build a zero-filled tensor from a declared dtype string and shape spec.
    ///
    /// The dtype string accepts the common synonyms seen in graph manifests
    /// (`"float"`, `"float32"`, `"int64"`, `"long"`), case- and
    /// whitespace-insensitively, with or without a `tensor(...)` wrapper.
    /// Symbolic dimensions resolve to size 1; this is only used to scaffold
    /// placeholder tensors from declarations, never to validate real data.
    pub fn zeros(dtype: &str, shape: &[DimSpec]) -> Result<Self> {
        let canonical = canonical_dtype(dtype)?;
        let resolved = resolve_shape(shape)?;
        let count = element_count(&resolved)?;
        match canonical {
            DType::F32 => Tensor::from_f32(vec![0.0; count], &resolved),
            DType::I64 => Tensor::from_i64(vec![0; count], &resolved),
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// The tensor's shape. Returned as a fresh vector so the caller can never
    /// observe internal storage.
    pub fn shape(&self) -> Vec<i64> {
        self.shape.clone()
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// Copy out the float32 contents. Fails on dtype mismatch.
    pub fn f32_data(&self) -> Result<Vec<f32>> {
        match &self.data {
            TensorData::F32(v) => Ok(v.clone()),
            TensorData::I64(_) => Err(Error::Extract(format!(
                "expected float32 tensor, got {}",
                self.dtype()
            ))),
        }
    }

    /// Copy out the int64 contents. Fails on dtype mismatch.
    pub fn i64_data(&self) -> Result<Vec<i64>> {
        match &self.data {
            TensorData::I64(v) => Ok(v.clone()),
            TensorData::F32(_) => Err(Error::Extract(format!(
                "expected int64 tensor, got {}",
                self.dtype()
            ))),
        }
    }
}

/// A runner output that may not be a plain [`Tensor`]: foreign execution
/// environments (e.g. a wasm bridge) hand back raw buffers or values nested
/// inside wrapper layers. [`extract_f32`] and [`extract_i64`] unwrap these.
#[derive(Debug, Clone)]
pub enum Value {
    Tensor(Tensor),
    F32(Vec<f32>),
    I64(Vec<i64>),
    /// A wrapper deferring to an inner value. Unwrapped up to a fixed depth.
    Wrapped(Box<Value>),
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Tensor(t)
    }
}

/// Wrapper layers deeper than this are rejected rather than followed; the
/// bound exists to fail clearly on malformed or cyclic indirection chains.
const MAX_WRAP_DEPTH: usize = 16;

/// Extract a float32 buffer from a runner output value.
pub fn extract_f32(value: &Value) -> Result<Vec<f32>> {
    match unwrap_value(value)? {
        Value::Tensor(t) => t.f32_data(),
        Value::F32(v) => Ok(v.clone()),
        Value::I64(_) => Err(Error::Extract(
            "expected float32 output, got int64 buffer".to_string(),
        )),
        Value::Wrapped(_) => unreachable!("unwrap_value returns an unwrapped value"),
    }
}

/// Extract an int64 buffer from a runner output value.
pub fn extract_i64(value: &Value) -> Result<Vec<i64>> {
    match unwrap_value(value)? {
        Value::Tensor(t) => t.i64_data(),
        Value::I64(v) => Ok(v.clone()),
        Value::F32(_) => Err(Error::Extract(
            "expected int64 output, got float32 buffer".to_string(),
        )),
        Value::Wrapped(_) => unreachable!("unwrap_value returns an unwrapped value"),
    }
}

fn unwrap_value(value: &Value) -> Result<&Value> {
    let mut v = value;
    for _ in 0..MAX_WRAP_DEPTH {
        match v {
            Value::Wrapped(inner) => v = inner,
            _ => return Ok(v),
        }
    }
    Err(Error::Extract(format!(
        "nested value wrappers exceed max depth {MAX_WRAP_DEPTH}"
    )))
}

/// Concatenate two 3-D float32 tensors along axis 1.
///
/// Both operands must be `[B, T_x, D]` with matching `B` and `D`; the result
/// is `[B, T_a + T_b, D]` with `a`'s rows preceding `b`'s.
pub fn concat_axis1(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let a_shape = a.shape();
    let b_shape = b.shape();
    if a_shape.len() != 3 || b_shape.len() != 3 {
        return Err(Error::Shape(format!(
            "concat_axis1: both tensors must be 3D, got {}D and {}D",
            a_shape.len(),
            b_shape.len()
        )));
    }
    if a_shape[0] != b_shape[0] {
        return Err(Error::Shape(format!(
            "concat_axis1: batch dim mismatch: {} vs {}",
            a_shape[0], b_shape[0]
        )));
    }
    if a_shape[2] != b_shape[2] {
        return Err(Error::Shape(format!(
            "concat_axis1: last dim mismatch: {} vs {}",
            a_shape[2], b_shape[2]
        )));
    }

    let a_data = a.f32_data()?;
    let b_data = b.f32_data()?;
    let mut combined = Vec::with_capacity(a_data.len() + b_data.len());
    combined.extend_from_slice(&a_data);
    combined.extend_from_slice(&b_data);

    Tensor::from_f32(
        combined,
        &[a_shape[0], a_shape[1] + b_shape[1], a_shape[2]],
    )
}

/// Canonicalize a human-readable dtype string.
pub fn canonical_dtype(raw: &str) -> Result<DType> {
    let normalized = raw.trim().to_ascii_lowercase();
    let normalized = normalized
        .strip_prefix("tensor(")
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(&normalized);
    match normalized {
        "float" | "float32" => Ok(DType::F32),
        "int64" | "long" => Ok(DType::I64),
        _ => Err(Error::UnsupportedDtype(raw.to_string())),
    }
}

/// Resolve a declared shape to concrete sizes; symbolic dims become 1.
pub fn resolve_shape(shape: &[DimSpec]) -> Result<Vec<i64>> {
    let mut out = Vec::with_capacity(shape.len());
    for (i, dim) in shape.iter().enumerate() {
        match dim {
            DimSpec::Size(v) => {
                if *v < 1 {
                    return Err(Error::Shape(format!("shape[{i}]={v} is not positive")));
                }
                out.push(*v);
            }
            DimSpec::Symbol(name) => {
                if name.trim().is_empty() {
                    return Err(Error::Shape(format!(
                        "shape[{i}] has empty symbolic dimension"
                    )));
                }
                out.push(1);
            }
        }
    }
    Ok(out)
}

fn validate_shape_against_data(shape: &[i64], data_len: usize) -> Result<()> {
    let count = element_count(shape)?;
    if count != data_len {
        return Err(Error::Shape(format!(
            "shape {shape:?} expects {count} elements, got {data_len}"
        )));
    }
    Ok(())
}

/// Number of elements implied by a shape. A rank-0 shape holds one scalar.
fn element_count(shape: &[i64]) -> Result<usize> {
    let mut count: i64 = 1;
    for (i, &dim) in shape.iter().enumerate() {
        if dim < 1 {
            return Err(Error::Shape(format!("shape[{i}]={dim} is not positive")));
        }
        count = count
            .checked_mul(dim)
            .ok_or_else(|| Error::Shape(format!("shape {shape:?} overflows element count")))?;
    }
    usize::try_from(count)
        .map_err(|_| Error::Shape(format!("shape {shape:?} exceeds platform capacity")))
}
