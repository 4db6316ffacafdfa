//! `ColumnValue`: the tagged union raw replication values are lifted into
//! (spec.md design notes, "dynamically-typed column values"), plus the
//! column-typing rules of spec.md §4.3.
//!
//! The ENUM/SET decode rules follow `akkw-mini-canal::command::event`'s
//! `TableMapLogEvent`, which carries a per-column `set_enum_values` list
//! and a `bit_set::BitSet` for SET member bitmasks; BIT and DATETIME/
//! TIMESTAMP handling follow the rules spec.md §4.3 states directly.

use bigdecimal::BigDecimal;
use bit_set::BitSet;
use chrono::{NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};

use crate::metadata::{ColumnKind, ColumnMetadata};

/// A single column's decoded value. Lossless for the domain spec.md §4.3
/// names (spec.md §8 round-trip law).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum ColumnValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl ColumnValue {
    pub fn decimal(value: BigDecimal) -> Self {
        ColumnValue::Decimal(value.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }
}

/// The raw wire representation a replication-client library delivers for
/// one column before the Normalizer applies a column's typing rule.
#[derive(Debug, Clone)]
pub enum RawColumnValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Raw bytes for a textual/enum/set/bit/json column.
    Bytes(Vec<u8>),
    /// A small integer index, used for ENUM (1-indexed).
    EnumIndex(i64),
    /// A bitmask, used for SET.
    SetBits(u64),
    /// A DECIMAL/NUMERIC column's literal text representation.
    Decimal(Vec<u8>),
}

/// Apply a column's typing rule to a raw value (spec.md §4.3).
pub fn decode_column_value(raw: RawColumnValue, meta: &ColumnMetadata) -> ColumnValue {
    match (raw, &meta.kind) {
        (RawColumnValue::Null, _) => ColumnValue::Null,

        (RawColumnValue::EnumIndex(idx), ColumnKind::Enum(values)) => {
            // 1-indexed; out-of-range yields empty string (spec.md §4.3).
            if idx < 1 || idx as usize > values.len() {
                ColumnValue::String(String::new())
            } else {
                ColumnValue::String(values[(idx - 1) as usize].clone())
            }
        }

        (RawColumnValue::SetBits(bits), ColumnKind::Set(members)) => {
            ColumnValue::String(resolve_set_members(bits, members))
        }

        (RawColumnValue::Bytes(bytes), ColumnKind::Bit) => ColumnValue::Int(decode_bit(&bytes)),

        (RawColumnValue::Bytes(bytes), ColumnKind::DateTime)
        | (RawColumnValue::Bytes(bytes), ColumnKind::Timestamp) => {
            match decode_datetime(&bytes) {
                Some(rfc3339) => ColumnValue::String(rfc3339),
                None => ColumnValue::Null,
            }
        }

        (RawColumnValue::Bytes(bytes), ColumnKind::Json) => decode_json(&bytes),

        (RawColumnValue::Bytes(bytes), ColumnKind::Other) => {
            decode_textual(&bytes)
        }

        (RawColumnValue::Decimal(bytes), _) => decode_decimal(&bytes),

        (RawColumnValue::Int(i), _) => ColumnValue::Int(i),
        (RawColumnValue::UInt(u), _) => ColumnValue::UInt(u),
        (RawColumnValue::Float(f), _) => ColumnValue::Float(f),
        (RawColumnValue::EnumIndex(idx), _) => ColumnValue::Int(idx),
        (RawColumnValue::SetBits(bits), _) => ColumnValue::UInt(bits),
    }
}

/// SET values arrive as a bitmask; resolve to the comma-joined list of
/// members with the corresponding bit set (spec.md §4.3).
fn resolve_set_members(bits: u64, members: &[String]) -> String {
    let mut set = BitSet::with_capacity(members.len());
    for i in 0..members.len() {
        if bits & (1 << i) != 0 {
            set.insert(i);
        }
    }
    let resolved: Vec<&str> = set.iter().filter_map(|i| members.get(i)).map(String::as_str).collect();
    resolved.join(",")
}

/// BIT values arrive as single-byte strings; normalized to 0/1 (spec.md
/// §4.3).
fn decode_bit(bytes: &[u8]) -> i64 {
    match bytes.first() {
        Some(&b) if b != 0 => 1,
        _ => 0,
    }
}

/// DATETIME/TIMESTAMP strings are reformatted to RFC-3339 in the
/// process's local time; the MySQL zero-date maps to null (spec.md §4.3).
fn decode_datetime(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.is_empty() || text.starts_with("0000-00-00") {
        return None;
    }
    let formats = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
    for format in formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            let local = chrono::Local.from_local_datetime(&naive).single()?;
            return Some(local.to_rfc3339());
        }
    }
    None
}

/// JSON byte sequences are parsed into nested structured values;
/// unparseable JSON falls back to the raw string (spec.md §4.3).
fn decode_json(bytes: &[u8]) -> ColumnValue {
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(value) => ColumnValue::Json(value),
        Err(_) => ColumnValue::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Textual column bytes decoded to a string (spec.md §4.3: "when a value
/// arrives as a raw byte sequence for a textual column type, it is
/// decoded to a string").
fn decode_textual(bytes: &[u8]) -> ColumnValue {
    match String::from_utf8(bytes.to_vec()) {
        Ok(s) => ColumnValue::String(s),
        Err(_) => ColumnValue::Bytes(bytes.to_vec()),
    }
}

/// DECIMAL/NUMERIC columns arrive as their literal text representation;
/// reparsed through `BigDecimal` to normalize formatting (spec.md §4.3).
fn decode_decimal(bytes: &[u8]) -> ColumnValue {
    let text = String::from_utf8_lossy(bytes);
    match text.trim().parse::<BigDecimal>() {
        Ok(value) => ColumnValue::decimal(value),
        Err(_) => ColumnValue::String(text.into_owned()),
    }
}
