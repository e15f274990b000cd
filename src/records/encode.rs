//! # Order-Preserving Value Encoding
//!
//! Encoded keys compare correctly with plain byte comparison, so the tree
//! never needs type information. Every user key starts with a 4-byte
//! big-endian prefix naming the table or index keyspace; within a prefix,
//! byte order equals value order.
//!
//! Fixed-width types are 8 bytes each. Integers and timestamps flip the
//! sign bit so negatives sort before positives. Floats invert all bits
//! when negative and flip the sign bit otherwise, which linearizes the
//! IEEE 754 order. Booleans widen 0/1 to 8 bytes.
//!
//! `BYTES` values are NUL-terminated with a byte-level escape:
//!
//! ```text
//! 0x00 -> 0x01 0x01
//! 0x01 -> 0x01 0x02
//! ```
//!
//! The terminator then sorts before every real byte and no encoded string
//! is a prefix of another, so lexicographic order is preserved.
//!
//! Row payloads reuse the same encodings in schema order; lengths are
//! recovered positionally, and a trailing `BYTES` column drops its
//! terminator (its extent is the rest of the buffer).

use eyre::{ensure, Result};

use super::{DataType, Value};
use crate::btree::Cmp;

const SIGN_BIT: u64 = 1 << 63;

fn push_escaped(out: &mut Vec<u8>, raw: &[u8]) {
    for &b in raw {
        if b <= 0x01 {
            out.push(0x01);
            out.push(b + 1);
        } else {
            out.push(b);
        }
    }
}

fn unescape(raw: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == 0x01 {
            ensure!(i + 1 < raw.len(), "dangling escape byte");
            let next = raw[i + 1];
            ensure!(next == 0x01 || next == 0x02, "bad escape pair 0x01 {:#04x}", next);
            out.push(next - 1);
            i += 2;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn push_value(out: &mut Vec<u8>, val: &Value, terminate_bytes: bool) {
    match val {
        Value::Int64(v) | Value::DateTime(v) => {
            out.extend_from_slice(&((*v as u64) ^ SIGN_BIT).to_be_bytes());
        }
        Value::Float64(v) => {
            let bits = v.to_bits();
            let enc = if bits & SIGN_BIT != 0 { !bits } else { bits ^ SIGN_BIT };
            out.extend_from_slice(&enc.to_be_bytes());
        }
        Value::Bool(v) => {
            out.extend_from_slice(&(*v as u64).to_be_bytes());
        }
        Value::Bytes(v) => {
            push_escaped(out, v);
            if terminate_bytes {
                out.push(0x00);
            }
        }
    }
}

/// Appends the key encoding of `vals` (every `BYTES` terminated).
pub fn encode_values(out: &mut Vec<u8>, vals: &[Value]) {
    for val in vals {
        push_value(out, val, true);
    }
}

/// `prefix || key encoding of vals`.
pub fn encode_key(prefix: u32, vals: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 16 * vals.len());
    out.extend_from_slice(&prefix.to_be_bytes());
    encode_values(&mut out, vals);
    out
}

/// Row-payload encoding: like `encode_values`, but a trailing `BYTES`
/// column omits its terminator.
pub fn encode_row(out: &mut Vec<u8>, vals: &[Value]) {
    for (i, val) in vals.iter().enumerate() {
        push_value(out, val, i + 1 != vals.len());
    }
}

/// A range bound from a column prefix of a compound key. Upper bounds
/// (`Gt`, `Le`) pad the missing columns with their order-extreme sentinel:
/// a lone `0xFF` dominates every `BYTES` completion, and eight `0xFF`
/// bytes dominate any fixed-width value.
pub fn encode_key_partial(
    prefix: u32,
    vals: &[Value],
    missing: &[DataType],
    cmp: Cmp,
) -> Vec<u8> {
    let mut out = encode_key(prefix, vals);
    if cmp.pads_to_max() {
        for t in missing {
            match t {
                DataType::Bytes => {
                    out.push(0xFF);
                    break;
                }
                _ => out.extend_from_slice(&[0xFF; 8]),
            }
        }
    }
    out
}

fn take_fixed8<'a>(input: &'a [u8], what: &str) -> Result<(u64, &'a [u8])> {
    ensure!(input.len() >= 8, "truncated {} field", what);
    let raw = u64::from_be_bytes(input[..8].try_into().unwrap());
    Ok((raw, &input[8..]))
}

fn decode_one<'a>(input: &'a [u8], dtype: DataType, last: bool) -> Result<(Value, &'a [u8])> {
    match dtype {
        DataType::Int64 => {
            let (raw, rest) = take_fixed8(input, "INT64")?;
            Ok((Value::Int64((raw ^ SIGN_BIT) as i64), rest))
        }
        DataType::DateTime => {
            let (raw, rest) = take_fixed8(input, "DATETIME")?;
            Ok((Value::DateTime((raw ^ SIGN_BIT) as i64), rest))
        }
        DataType::Float64 => {
            let (raw, rest) = take_fixed8(input, "FLOAT64")?;
            let bits = if raw & SIGN_BIT != 0 { raw ^ SIGN_BIT } else { !raw };
            Ok((Value::Float64(f64::from_bits(bits)), rest))
        }
        DataType::Bool => {
            let (raw, rest) = take_fixed8(input, "BOOLEAN")?;
            Ok((Value::Bool(raw != 0), rest))
        }
        DataType::Bytes => {
            if last {
                // unterminated: the field runs to the end of the buffer
                return Ok((Value::Bytes(unescape(input)?), &input[input.len()..]));
            }
            let end = input
                .iter()
                .position(|&b| b == 0x00)
                .ok_or_else(|| eyre::eyre!("unterminated BYTES field"))?;
            Ok((Value::Bytes(unescape(&input[..end])?), &input[end + 1..]))
        }
    }
}

/// Decodes a key-encoded value sequence (every `BYTES` terminated).
pub fn decode_values(mut input: &[u8], types: &[DataType]) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(types.len());
    for &t in types {
        let (val, rest) = decode_one(input, t, false)?;
        out.push(val);
        input = rest;
    }
    Ok(out)
}

/// Decodes a row payload (trailing `BYTES` unterminated).
pub fn decode_row(mut input: &[u8], types: &[DataType]) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(types.len());
    for (i, &t) in types.iter().enumerate() {
        let (val, rest) = decode_one(input, t, i + 1 == types.len())?;
        out.push(val);
        input = rest;
    }
    Ok(out)
}
