//! Type and shape registry.
//!
//! This module is the single place where the three type worlds of the writer
//! meet: the logical types named in schema markup (`NX_FLOAT64`, `NX_INT32`,
//! …), the wire values fetched from data sources, and the storage classes
//! the container backend understands. It also owns rank/shape inference for
//! literal field content and for JSON payloads pushed by callers.
//!
//! # Data Flow
//!
//! ```text
//! schema "NX_FLOAT64" ──► NxType::Float64 ──► StorageClass::Float
//!                              ▲
//! source value ──► DataRecord ─┘ (cast during type/shape reconciliation)
//! ```

use crate::error::{WriterError, WriterResult};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// =============================================================================
// Logical types
// =============================================================================

/// Logical field type as named in schema markup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NxType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Boolean,
    /// Variable-length text.
    Char,
    /// ISO-8601 timestamp, stored as text.
    DateTime,
}

/// Storage class a backend allocates for a logical type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageClass {
    Integer,
    Unsigned,
    Float,
    Boolean,
    Text,
}

static TYPE_NAMES: Lazy<HashMap<&'static str, NxType>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("NX_INT", NxType::Int64);
    m.insert("NX_INT8", NxType::Int8);
    m.insert("NX_INT16", NxType::Int16);
    m.insert("NX_INT32", NxType::Int32);
    m.insert("NX_INT64", NxType::Int64);
    m.insert("NX_UINT", NxType::UInt64);
    m.insert("NX_UINT8", NxType::UInt8);
    m.insert("NX_UINT16", NxType::UInt16);
    m.insert("NX_UINT32", NxType::UInt32);
    m.insert("NX_UINT64", NxType::UInt64);
    m.insert("NX_FLOAT", NxType::Float64);
    m.insert("NX_FLOAT32", NxType::Float32);
    m.insert("NX_FLOAT64", NxType::Float64);
    m.insert("NX_NUMBER", NxType::Float64);
    m.insert("NX_BOOLEAN", NxType::Boolean);
    m.insert("NX_CHAR", NxType::Char);
    m.insert("NX_DATE_TIME", NxType::DateTime);
    m.insert("ISO8601", NxType::DateTime);
    m
});

impl NxType {
    /// Look up a schema type name. `None` for unrecognized names.
    pub fn from_schema_name(name: &str) -> Option<NxType> {
        TYPE_NAMES.get(name).copied()
    }

    /// The canonical schema name for this type.
    pub fn schema_name(&self) -> &'static str {
        match self {
            NxType::Int8 => "NX_INT8",
            NxType::Int16 => "NX_INT16",
            NxType::Int32 => "NX_INT32",
            NxType::Int64 => "NX_INT64",
            NxType::UInt8 => "NX_UINT8",
            NxType::UInt16 => "NX_UINT16",
            NxType::UInt32 => "NX_UINT32",
            NxType::UInt64 => "NX_UINT64",
            NxType::Float32 => "NX_FLOAT32",
            NxType::Float64 => "NX_FLOAT64",
            NxType::Boolean => "NX_BOOLEAN",
            NxType::Char => "NX_CHAR",
            NxType::DateTime => "NX_DATE_TIME",
        }
    }

    /// Storage class the container allocates for this type.
    pub fn storage_class(&self) -> StorageClass {
        match self {
            NxType::Int8 | NxType::Int16 | NxType::Int32 | NxType::Int64 => StorageClass::Integer,
            NxType::UInt8 | NxType::UInt16 | NxType::UInt32 | NxType::UInt64 => {
                StorageClass::Unsigned
            }
            NxType::Float32 | NxType::Float64 => StorageClass::Float,
            NxType::Boolean => StorageClass::Boolean,
            NxType::Char | NxType::DateTime => StorageClass::Text,
        }
    }

    /// True for integer and floating types.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self.storage_class(),
            StorageClass::Integer | StorageClass::Unsigned | StorageClass::Float
        )
    }

    /// The can-fail fill value: the type's maximum for numeric types, `true`
    /// for booleans, empty text otherwise.
    pub fn sentinel(&self) -> ScalarValue {
        match self {
            NxType::Int8 => ScalarValue::Int(i64::from(i8::MAX)),
            NxType::Int16 => ScalarValue::Int(i64::from(i16::MAX)),
            NxType::Int32 => ScalarValue::Int(i64::from(i32::MAX)),
            NxType::Int64 => ScalarValue::Int(i64::MAX),
            NxType::UInt8 => ScalarValue::UInt(u64::from(u8::MAX)),
            NxType::UInt16 => ScalarValue::UInt(u64::from(u16::MAX)),
            NxType::UInt32 => ScalarValue::UInt(u64::from(u32::MAX)),
            NxType::UInt64 => ScalarValue::UInt(u64::MAX),
            NxType::Float32 => ScalarValue::Float(f64::from(f32::MAX)),
            NxType::Float64 => ScalarValue::Float(f64::MAX),
            NxType::Boolean => ScalarValue::Bool(true),
            NxType::Char | NxType::DateTime => ScalarValue::Text(String::new()),
        }
    }

    /// Parse a literal token into a scalar of this type.
    pub fn parse_text(&self, token: &str) -> WriterResult<ScalarValue> {
        ScalarValue::Text(token.to_string()).cast(*self)
    }
}

// =============================================================================
// Wire values
// =============================================================================

/// A single wire value fetched from a source or parsed from markup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(b) => write!(f, "{}", b),
            ScalarValue::Int(i) => write!(f, "{}", i),
            ScalarValue::UInt(u) => write!(f, "{}", u),
            ScalarValue::Float(v) => write!(f, "{}", v),
            ScalarValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl ScalarValue {
    /// Extract value as f64, parsing from text where possible.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Float(v) => Some(*v),
            ScalarValue::Int(i) => Some(*i as f64),
            ScalarValue::UInt(u) => Some(*u as f64),
            ScalarValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ScalarValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Extract value as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::Int(i) => Some(*i),
            ScalarValue::UInt(u) => i64::try_from(*u).ok(),
            ScalarValue::Float(v) => Some(*v as i64),
            ScalarValue::Bool(b) => Some(i64::from(*b)),
            ScalarValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Extract value as u64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ScalarValue::UInt(u) => Some(*u),
            ScalarValue::Int(i) => u64::try_from(*i).ok(),
            ScalarValue::Float(v) if *v >= 0.0 => Some(*v as u64),
            ScalarValue::Bool(b) => Some(u64::from(*b)),
            ScalarValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Extract value as bool. Numeric values are truthy when non-zero; text
    /// accepts `true`/`false`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScalarValue::Bool(b) => Some(*b),
            ScalarValue::Int(i) => Some(*i != 0),
            ScalarValue::UInt(u) => Some(*u != 0),
            ScalarValue::Float(v) => Some(*v != 0.0),
            ScalarValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Convert to the wire representation of the given logical type.
    pub fn cast(&self, dtype: NxType) -> WriterResult<ScalarValue> {
        let fail = || {
            WriterError::Data(format!(
                "cannot convert {:?} to {}",
                self,
                dtype.schema_name()
            ))
        };
        Ok(match dtype.storage_class() {
            StorageClass::Integer => ScalarValue::Int(self.as_i64().ok_or_else(fail)?),
            StorageClass::Unsigned => ScalarValue::UInt(self.as_u64().ok_or_else(fail)?),
            StorageClass::Float => ScalarValue::Float(self.as_f64().ok_or_else(fail)?),
            StorageClass::Boolean => ScalarValue::Bool(self.as_bool().ok_or_else(fail)?),
            StorageClass::Text => ScalarValue::Text(self.to_string()),
        })
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Bool(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Int(value)
    }
}

impl From<u64> for ScalarValue {
    fn from(value: u64) -> Self {
        ScalarValue::UInt(value)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Float(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Text(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::Text(value)
    }
}

// =============================================================================
// Records
// =============================================================================

/// Scalar / 1-D / 2-D classification of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rank {
    Scalar,
    OneD,
    TwoD,
}

impl Rank {
    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        match self {
            Rank::Scalar => 0,
            Rank::OneD => 1,
            Rank::TwoD => 2,
        }
    }

    /// Rank for a dimension count, if supported.
    pub fn from_ndim(ndim: usize) -> Option<Rank> {
        match ndim {
            0 => Some(Rank::Scalar),
            1 => Some(Rank::OneD),
            2 => Some(Rank::TwoD),
            _ => None,
        }
    }
}

/// Payload of a record.
#[derive(Clone, Debug, PartialEq)]
pub enum WireData {
    Scalar(ScalarValue),
    List(Vec<ScalarValue>),
    Table(Vec<Vec<ScalarValue>>),
    /// Undecoded binary payload; the `encoding` tag on the owning record
    /// names the decoder that resolves it.
    Encoded(Vec<u8>),
}

/// One fetched or parsed measurement, with its wire type and shape.
///
/// Invariants: `shape.len() == rank.ndim()`; scalar records have an empty
/// shape; `Encoded` payloads carry an encoding tag.
#[derive(Clone, Debug, PartialEq)]
pub struct DataRecord {
    pub rank: Rank,
    pub value: WireData,
    pub dtype: NxType,
    pub shape: Vec<usize>,
    pub encoding: Option<String>,
}

impl DataRecord {
    /// A scalar record.
    pub fn scalar(value: ScalarValue, dtype: NxType) -> Self {
        DataRecord {
            rank: Rank::Scalar,
            value: WireData::Scalar(value),
            dtype,
            shape: Vec::new(),
            encoding: None,
        }
    }

    /// A 1-D record; shape is inferred from the element count.
    pub fn list(values: Vec<ScalarValue>, dtype: NxType) -> Self {
        let shape = vec![values.len()];
        DataRecord {
            rank: Rank::OneD,
            value: WireData::List(values),
            dtype,
            shape,
            encoding: None,
        }
    }

    /// A 2-D record from rectangular rows.
    pub fn table(rows: Vec<Vec<ScalarValue>>, dtype: NxType) -> WriterResult<Self> {
        let ncols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != ncols) {
            return Err(WriterError::Data("ragged table record".to_string()));
        }
        let shape = vec![rows.len(), ncols];
        Ok(DataRecord {
            rank: Rank::TwoD,
            value: WireData::Table(rows),
            dtype,
            shape,
            encoding: None,
        })
    }

    /// An undecoded binary payload tagged with its encoding.
    pub fn encoded(payload: Vec<u8>, encoding: &str) -> Self {
        DataRecord {
            rank: Rank::Scalar,
            value: WireData::Encoded(payload),
            dtype: NxType::UInt8,
            shape: Vec::new(),
            encoding: Some(encoding.to_string()),
        }
    }

    /// The can-fail fill record for a field of the given type and shape.
    pub fn sentinel(dtype: NxType, rank: Rank, shape: &[usize]) -> Self {
        let fill = dtype.sentinel();
        match rank {
            Rank::Scalar => DataRecord::scalar(fill, dtype),
            Rank::OneD => DataRecord::list(vec![fill; shape.first().copied().unwrap_or(0)], dtype),
            Rank::TwoD => {
                let rows = shape.first().copied().unwrap_or(0);
                let cols = shape.get(1).copied().unwrap_or(0);
                DataRecord {
                    rank: Rank::TwoD,
                    value: WireData::Table(vec![vec![fill; cols]; rows]),
                    dtype,
                    shape: vec![rows, cols],
                    encoding: None,
                }
            }
        }
    }

    /// Infer a record from a JSON value (push payloads, computed results).
    pub fn from_json(value: &serde_json::Value) -> WriterResult<Self> {
        use serde_json::Value;
        match value {
            Value::Null => Err(WriterError::Data("null payload value".to_string())),
            Value::Bool(b) => Ok(DataRecord::scalar(ScalarValue::Bool(*b), NxType::Boolean)),
            Value::Number(n) => Ok(scalar_record_from_number(n)),
            Value::String(s) => Ok(DataRecord::scalar(
                ScalarValue::Text(s.clone()),
                NxType::Char,
            )),
            Value::Array(items) => {
                if items.iter().any(Value::is_array) {
                    let mut rows = Vec::with_capacity(items.len());
                    let mut dtype = NxType::Int64;
                    for item in items {
                        let Value::Array(cells) = item else {
                            return Err(WriterError::Data(
                                "mixed nesting in payload array".to_string(),
                            ));
                        };
                        let (row, row_dtype) = scalar_row_from_json(cells)?;
                        dtype = promote(dtype, row_dtype)?;
                        rows.push(row);
                    }
                    let mut rec = DataRecord::table(rows, dtype)?;
                    rec = rec.cast_to(dtype)?;
                    Ok(rec)
                } else {
                    let (row, dtype) = scalar_row_from_json(items)?;
                    DataRecord::list(row, dtype).cast_to(dtype)
                }
            }
            Value::Object(_) => Err(WriterError::Data(
                "object payload values are not supported".to_string(),
            )),
        }
    }

    /// Infer a record from literal field content.
    ///
    /// Text types take the whole trimmed content as one scalar; numeric
    /// types split on whitespace, one line per row.
    pub fn from_literal(text: &str, dtype: NxType) -> WriterResult<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(WriterError::Data("empty literal content".to_string()));
        }
        if dtype.storage_class() == StorageClass::Text {
            return Ok(DataRecord::scalar(
                ScalarValue::Text(trimmed.to_string()),
                dtype,
            ));
        }
        let lines: Vec<Vec<&str>> = trimmed
            .lines()
            .map(|l| l.split_whitespace().collect::<Vec<_>>())
            .filter(|l| !l.is_empty())
            .collect();
        match lines.as_slice() {
            [single] if single.len() == 1 => {
                Ok(DataRecord::scalar(dtype.parse_text(single[0])?, dtype))
            }
            [single] => {
                let values = single
                    .iter()
                    .map(|t| dtype.parse_text(t))
                    .collect::<WriterResult<Vec<_>>>()?;
                Ok(DataRecord::list(values, dtype))
            }
            rows => {
                let parsed = rows
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|t| dtype.parse_text(t))
                            .collect::<WriterResult<Vec<_>>>()
                    })
                    .collect::<WriterResult<Vec<_>>>()?;
                DataRecord::table(parsed, dtype)
            }
        }
    }

    /// Convert every element to the wire representation of `dtype`.
    pub fn cast_to(&self, dtype: NxType) -> WriterResult<Self> {
        let value = match &self.value {
            WireData::Scalar(v) => WireData::Scalar(v.cast(dtype)?),
            WireData::List(vs) => WireData::List(
                vs.iter()
                    .map(|v| v.cast(dtype))
                    .collect::<WriterResult<Vec<_>>>()?,
            ),
            WireData::Table(rows) => WireData::Table(
                rows.iter()
                    .map(|row| {
                        row.iter()
                            .map(|v| v.cast(dtype))
                            .collect::<WriterResult<Vec<_>>>()
                    })
                    .collect::<WriterResult<Vec<_>>>()?,
            ),
            WireData::Encoded(_) => {
                return Err(WriterError::Data(
                    "encoded payload reached type reconciliation undecoded".to_string(),
                ))
            }
        };
        Ok(DataRecord {
            rank: self.rank,
            value,
            dtype,
            shape: self.shape.clone(),
            encoding: None,
        })
    }

    /// All elements in row-major order.
    pub fn flat_values(&self) -> WriterResult<Vec<ScalarValue>> {
        match &self.value {
            WireData::Scalar(v) => Ok(vec![v.clone()]),
            WireData::List(vs) => Ok(vs.clone()),
            WireData::Table(rows) => Ok(rows.iter().flatten().cloned().collect()),
            WireData::Encoded(_) => Err(WriterError::Data(
                "encoded payload has no element view".to_string(),
            )),
        }
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.shape.iter().product::<usize>().max(
            // Scalars have an empty shape but one element.
            usize::from(self.rank == Rank::Scalar),
        )
    }

    /// True when the record holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn scalar_record_from_number(n: &serde_json::Number) -> DataRecord {
    if let Some(i) = n.as_i64() {
        DataRecord::scalar(ScalarValue::Int(i), NxType::Int64)
    } else if let Some(u) = n.as_u64() {
        DataRecord::scalar(ScalarValue::UInt(u), NxType::UInt64)
    } else {
        DataRecord::scalar(ScalarValue::Float(n.as_f64().unwrap_or(f64::NAN)), NxType::Float64)
    }
}

fn scalar_from_json(value: &serde_json::Value) -> WriterResult<(ScalarValue, NxType)> {
    use serde_json::Value;
    match value {
        Value::Bool(b) => Ok((ScalarValue::Bool(*b), NxType::Boolean)),
        Value::Number(n) => {
            let rec = scalar_record_from_number(n);
            match rec.value {
                WireData::Scalar(v) => Ok((v, rec.dtype)),
                _ => Err(WriterError::Data("non-scalar number".to_string())),
            }
        }
        Value::String(s) => Ok((ScalarValue::Text(s.clone()), NxType::Char)),
        _ => Err(WriterError::Data(
            "unsupported element in payload array".to_string(),
        )),
    }
}

fn scalar_row_from_json(items: &[serde_json::Value]) -> WriterResult<(Vec<ScalarValue>, NxType)> {
    let mut dtype = NxType::Int64;
    let mut row = Vec::with_capacity(items.len());
    let mut first = true;
    for item in items {
        let (v, d) = scalar_from_json(item)?;
        dtype = if first { d } else { promote(dtype, d)? };
        first = false;
        row.push(v);
    }
    Ok((row, dtype))
}

/// Widest common type for mixed payload elements.
pub(crate) fn promote(a: NxType, b: NxType) -> WriterResult<NxType> {
    use StorageClass::*;
    if a == b {
        return Ok(a);
    }
    match (a.storage_class(), b.storage_class()) {
        (Float, _) | (_, Float) if a.is_numeric() && b.is_numeric() => Ok(NxType::Float64),
        (Integer, Unsigned) | (Unsigned, Integer) | (Integer, Integer) | (Unsigned, Unsigned) => {
            Ok(NxType::Int64)
        }
        _ => Err(WriterError::Data(format!(
            "mixed element types {} and {} in payload",
            a.schema_name(),
            b.schema_name()
        ))),
    }
}
