//! # Records and the Type System
//!
//! A record is a bag of named, typed values. The table layer reorders the
//! values into schema order before encoding, so records can be built with
//! columns in any order.
//!
//! ## Types
//!
//! | Type | Id | Key encoding |
//! |------|----|--------------|
//! | `INT64` | 1 | 8 bytes big-endian, sign bit flipped |
//! | `BYTES` | 2 | escaped, NUL-terminated |
//! | `FLOAT64` | 3 | IEEE 754 bits, order-corrected, big-endian |
//! | `BOOLEAN` | 4 | 8 bytes big-endian 0/1 |
//! | `DATETIME` | 5 | Unix seconds as sign-flipped big-endian INT64 |
//!
//! The numeric ids are persisted inside the catalog, so they are part of
//! the file format.

mod encode;

pub use encode::{
    decode_row, decode_values, encode_key, encode_key_partial, encode_row, encode_values,
};

use serde::{Deserialize, Serialize};

/// Column types. The discriminants are persisted in table schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum DataType {
    Int64 = 1,
    Bytes = 2,
    Float64 = 3,
    Bool = 4,
    DateTime = 5,
}

impl DataType {
    pub fn name(self) -> &'static str {
        match self {
            DataType::Int64 => "INT64",
            DataType::Bytes => "BYTES",
            DataType::Float64 => "FLOAT64",
            DataType::Bool => "BOOLEAN",
            DataType::DateTime => "DATETIME",
        }
    }
}

impl From<DataType> for u32 {
    fn from(t: DataType) -> u32 {
        t as u32
    }
}

impl TryFrom<u32> for DataType {
    type Error = String;

    fn try_from(raw: u32) -> Result<Self, String> {
        match raw {
            1 => Ok(DataType::Int64),
            2 => Ok(DataType::Bytes),
            3 => Ok(DataType::Float64),
            4 => Ok(DataType::Bool),
            5 => Ok(DataType::DateTime),
            other => Err(format!("unknown column type id {}", other)),
        }
    }
}

/// One typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int64(i64),
    Bytes(Vec<u8>),
    Float64(f64),
    Bool(bool),
    /// Unix seconds.
    DateTime(i64),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int64(_) => DataType::Int64,
            Value::Bytes(_) => DataType::Bytes,
            Value::Float64(_) => DataType::Float64,
            Value::Bool(_) => DataType::Bool,
            Value::DateTime(_) => DataType::DateTime,
        }
    }

    pub fn as_int64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<i64> {
        match self {
            Value::DateTime(v) => Some(*v),
            _ => None,
        }
    }
}

/// A row under construction or a query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    cols: Vec<String>,
    vals: Vec<Value>,
}

impl Record {
    pub fn new() -> Self {
        Record::default()
    }

    pub fn push(&mut self, col: impl Into<String>, val: Value) {
        self.cols.push(col.into());
        self.vals.push(val);
    }

    pub fn with(mut self, col: impl Into<String>, val: Value) -> Self {
        self.push(col, val);
        self
    }

    pub fn with_int64(self, col: impl Into<String>, val: i64) -> Self {
        self.with(col, Value::Int64(val))
    }

    pub fn with_bytes(self, col: impl Into<String>, val: impl Into<Vec<u8>>) -> Self {
        self.with(col, Value::Bytes(val.into()))
    }

    pub fn with_str(self, col: impl Into<String>, val: &str) -> Self {
        self.with(col, Value::Bytes(val.as_bytes().to_vec()))
    }

    pub fn with_float64(self, col: impl Into<String>, val: f64) -> Self {
        self.with(col, Value::Float64(val))
    }

    pub fn with_bool(self, col: impl Into<String>, val: bool) -> Self {
        self.with(col, Value::Bool(val))
    }

    pub fn with_datetime(self, col: impl Into<String>, unix_secs: i64) -> Self {
        self.with(col, Value::DateTime(unix_secs))
    }

    pub fn get(&self, col: &str) -> Option<&Value> {
        self.cols
            .iter()
            .position(|c| c == col)
            .map(|i| &self.vals[i])
    }

    pub fn cols(&self) -> &[String] {
        &self.cols
    }

    pub fn vals(&self) -> &[Value] {
        &self.vals
    }

    pub fn len(&self) -> usize {
        self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }
}
