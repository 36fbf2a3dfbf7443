//! Canonical types and datum conversion.
//!
//! Every column on either side is mapped to a canonical [`TypeId`]; raw text
//! cells read off the wire are converted to [`Datum`] values for ordering
//! and equality during verification.

pub mod mysql;
pub mod oracle;

use std::cmp::Ordering;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{MoltError, Result};

/// Canonical column type, named after the Postgres type it maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeId {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Char,
    Varchar,
    Text,
    Json,
    Jsonb,
    Timestamp,
    Timestamptz,
    Date,
    Bytea,
    Bit,
    Varbit,
    Enum,
    Oid,
}

/// Broad comparison category of a canonical type. Columns align between the
/// two sides when their kinds match, even if the exact type ids differ
/// (e.g. `varchar` vs `text`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatumKind {
    Bool,
    Int,
    Float,
    Decimal,
    String,
    Json,
    Timestamp,
    TimestampTz,
    Date,
    Bytes,
    Bits,
}

impl TypeId {
    pub fn name(&self) -> &'static str {
        match self {
            TypeId::Bool => "bool",
            TypeId::Int2 => "int2",
            TypeId::Int4 => "int4",
            TypeId::Int8 => "int8",
            TypeId::Float4 => "float4",
            TypeId::Float8 => "float8",
            TypeId::Numeric => "numeric",
            TypeId::Char => "char",
            TypeId::Varchar => "varchar",
            TypeId::Text => "text",
            TypeId::Json => "json",
            TypeId::Jsonb => "jsonb",
            TypeId::Timestamp => "timestamp",
            TypeId::Timestamptz => "timestamptz",
            TypeId::Date => "date",
            TypeId::Bytea => "bytea",
            TypeId::Bit => "bit",
            TypeId::Varbit => "varbit",
            TypeId::Enum => "enum",
            TypeId::Oid => "oid",
        }
    }

    pub fn kind(&self) -> DatumKind {
        match self {
            TypeId::Bool => DatumKind::Bool,
            TypeId::Int2 | TypeId::Int4 | TypeId::Int8 | TypeId::Oid => DatumKind::Int,
            TypeId::Float4 | TypeId::Float8 => DatumKind::Float,
            TypeId::Numeric => DatumKind::Decimal,
            TypeId::Char | TypeId::Varchar | TypeId::Text | TypeId::Enum => DatumKind::String,
            TypeId::Json | TypeId::Jsonb => DatumKind::Json,
            TypeId::Timestamp => DatumKind::Timestamp,
            TypeId::Timestamptz => DatumKind::TimestampTz,
            TypeId::Date => DatumKind::Date,
            TypeId::Bytea => DatumKind::Bytes,
            TypeId::Bit | TypeId::Varbit => DatumKind::Bits,
        }
    }

    /// Whether SQL literals of this type must be single-quoted.
    pub fn literal_needs_quotes(&self) -> bool {
        !matches!(
            self.kind(),
            DatumKind::Int | DatumKind::Float | DatumKind::Decimal | DatumKind::Bool
        )
    }

    /// Map a builtin Postgres type OID to its canonical type.
    pub fn from_pg_oid(oid: u32) -> Option<TypeId> {
        Some(match oid {
            16 => TypeId::Bool,
            17 => TypeId::Bytea,
            20 => TypeId::Int8,
            21 => TypeId::Int2,
            23 => TypeId::Int4,
            25 => TypeId::Text,
            26 => TypeId::Oid,
            114 => TypeId::Json,
            700 => TypeId::Float4,
            701 => TypeId::Float8,
            1042 => TypeId::Char,
            1043 => TypeId::Varchar,
            1082 => TypeId::Date,
            1114 => TypeId::Timestamp,
            1184 => TypeId::Timestamptz,
            1560 => TypeId::Bit,
            1562 => TypeId::Varbit,
            1700 => TypeId::Numeric,
            3802 => TypeId::Jsonb,
            _ => return None,
        })
    }
}

/// A converted cell value with canonical-type semantics.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    String(String),
    Json(serde_json::Value),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Bytes(Vec<u8>),
    Bits(String),
}

fn conversion_error(value: &str, type_name: &'static str, message: impl Into<String>) -> MoltError {
    MoltError::Conversion {
        value: value.to_string(),
        type_name,
        message: message.into(),
    }
}

fn parse_timestamp(v: &str) -> Option<NaiveDateTime> {
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(v, fmt) {
            return Some(ts);
        }
    }
    None
}

fn parse_timestamptz(v: &str) -> Option<DateTime<Utc>> {
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f%#z",
        "%Y-%m-%d %H:%M:%S%.f%:z",
        "%Y-%m-%dT%H:%M:%S%.f%:z",
    ] {
        if let Ok(ts) = DateTime::parse_from_str(v, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    // Timestamps without an offset are taken as UTC.
    parse_timestamp(v).map(|naive| naive.and_utc())
}

/// Convert one raw text cell to a canonical datum.
///
/// A null cell yields [`Datum::Null`] regardless of type. Timestamp values
/// with the MySQL zero-date sentinel (`0000-...`) also yield null.
pub fn convert_row_value(val: Option<&str>, type_id: TypeId) -> Result<Datum> {
    let v = match val {
        None => return Ok(Datum::Null),
        Some(v) => v,
    };
    Ok(match type_id {
        TypeId::Char | TypeId::Varchar | TypeId::Text | TypeId::Enum => {
            Datum::String(v.to_string())
        }
        TypeId::Bool => match v {
            "t" | "true" | "TRUE" | "1" => Datum::Bool(true),
            "f" | "false" | "FALSE" | "0" => Datum::Bool(false),
            _ => return Err(conversion_error(v, "bool", "unrecognized boolean")),
        },
        TypeId::Int2 | TypeId::Int4 | TypeId::Int8 | TypeId::Oid => Datum::Int(
            v.parse::<i64>()
                .map_err(|e| conversion_error(v, "int", e.to_string()))?,
        ),
        TypeId::Float4 | TypeId::Float8 => Datum::Float(
            v.parse::<f64>()
                .map_err(|e| conversion_error(v, "float", e.to_string()))?,
        ),
        TypeId::Numeric => Datum::Decimal(
            Decimal::from_str(v)
                .or_else(|_| Decimal::from_scientific(v))
                .map_err(|e| conversion_error(v, "numeric", e.to_string()))?,
        ),
        TypeId::Json | TypeId::Jsonb => Datum::Json(
            serde_json::from_str(v).map_err(|e| conversion_error(v, "json", e.to_string()))?,
        ),
        TypeId::Timestamp => {
            if v.starts_with("0000-") {
                return Ok(Datum::Null);
            }
            Datum::Timestamp(
                parse_timestamp(v)
                    .ok_or_else(|| conversion_error(v, "timestamp", "unrecognized format"))?,
            )
        }
        TypeId::Timestamptz => Datum::TimestampTz(
            parse_timestamptz(v)
                .ok_or_else(|| conversion_error(v, "timestamptz", "unrecognized format"))?,
        ),
        TypeId::Date => {
            if v.starts_with("0000-") {
                return Ok(Datum::Null);
            }
            Datum::Date(
                NaiveDate::parse_from_str(v, "%Y-%m-%d")
                    .map_err(|e| conversion_error(v, "date", e.to_string()))?,
            )
        }
        TypeId::Bytea => {
            if let Some(hex_str) = v.strip_prefix("\\x") {
                Datum::Bytes(
                    hex::decode(hex_str)
                        .map_err(|e| conversion_error(v, "bytea", e.to_string()))?,
                )
            } else {
                Datum::Bytes(v.as_bytes().to_vec())
            }
        }
        TypeId::Bit | TypeId::Varbit => {
            if v.bytes().any(|b| b != b'0' && b != b'1') {
                return Err(conversion_error(v, "bit", "bit string must be 0s and 1s"));
            }
            Datum::Bits(v.to_string())
        }
    })
}

/// Convert a full row of raw cells. A length mismatch between values and
/// types is an assertion failure, never a silent truncation.
pub fn convert_row_values(vals: &[Option<String>], type_ids: &[TypeId]) -> Result<Vec<Datum>> {
    if vals.len() != type_ids.len() {
        return Err(MoltError::assertion(format!(
            "value length != type length: {} vs {}",
            vals.len(),
            type_ids.len()
        )));
    }
    vals.iter()
        .zip(type_ids)
        .map(|(v, t)| convert_row_value(v.as_deref(), *t))
        .collect()
}

impl Datum {
    /// Total order between two datums of the same canonical kind.
    ///
    /// Nulls sort first. Comparing datums of different kinds is an
    /// assertion failure; schema verification guarantees aligned kinds.
    pub fn cmp_same_kind(&self, other: &Datum) -> Result<Ordering> {
        use Datum::*;
        Ok(match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Decimal(a), Decimal(b)) => a.cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Json(a), Json(b)) => a.to_string().cmp(&b.to_string()),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (TimestampTz(a), TimestampTz(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Bits(a), Bits(b)) => a.cmp(b),
            (a, b) => {
                return Err(MoltError::assertion(format!(
                    "cannot compare {:?} with {:?}",
                    a, b
                )))
            }
        })
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Bool(v) => write!(f, "{}", v),
            Datum::Int(v) => write!(f, "{}", v),
            Datum::Float(v) => write!(f, "{}", v),
            Datum::Decimal(v) => write!(f, "{}", v),
            Datum::String(v) => write!(f, "{}", v),
            Datum::Json(v) => write!(f, "{}", v),
            Datum::Timestamp(v) => write!(f, "{}", v),
            Datum::TimestampTz(v) => write!(f, "{}", v),
            Datum::Date(v) => write!(f, "{}", v),
            Datum::Bytes(v) => write!(f, "\\x{}", hex::encode(v)),
            Datum::Bits(v) => write!(f, "{}", v),
        }
    }
}

/// Lexicographic order over composite key tuples.
pub fn cmp_key(a: &[Datum], b: &[Datum]) -> Result<Ordering> {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.cmp_same_kind(y)? {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }
    Ok(a.len().cmp(&b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_input_yields_null_for_every_type() {
        for t in [
            TypeId::Bool,
            TypeId::Int8,
            TypeId::Float8,
            TypeId::Numeric,
            TypeId::Text,
            TypeId::Jsonb,
            TypeId::Timestamp,
            TypeId::Bytea,
        ] {
            assert_eq!(convert_row_value(None, t).unwrap(), Datum::Null);
        }
    }

    #[test]
    fn test_integer_and_float_parsing() {
        assert_eq!(
            convert_row_value(Some("42"), TypeId::Int4).unwrap(),
            Datum::Int(42)
        );
        assert_eq!(
            convert_row_value(Some("-1.5"), TypeId::Float8).unwrap(),
            Datum::Float(-1.5)
        );
        assert!(convert_row_value(Some("abc"), TypeId::Int8).is_err());
    }

    #[test]
    fn test_numeric_parses_arbitrary_precision() {
        let d = convert_row_value(Some("12345678901234567890.12345"), TypeId::Numeric).unwrap();
        assert_eq!(
            d,
            Datum::Decimal(Decimal::from_str("12345678901234567890.12345").unwrap())
        );
    }

    #[test]
    fn test_zero_timestamp_sentinel_is_null() {
        assert_eq!(
            convert_row_value(Some("0000-00-00 00:00:00"), TypeId::Timestamp).unwrap(),
            Datum::Null
        );
    }

    #[test]
    fn test_timestamp_microsecond_precision() {
        let d = convert_row_value(Some("2023-05-01 10:20:30.123456"), TypeId::Timestamp).unwrap();
        match d {
            Datum::Timestamp(ts) => {
                assert_eq!(ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
                    "2023-05-01 10:20:30.123456");
            }
            other => panic!("expected timestamp, got {:?}", other),
        }
    }

    #[test]
    fn test_timestamptz_respects_offset() {
        let a = convert_row_value(Some("2023-05-01 12:00:00+02"), TypeId::Timestamptz).unwrap();
        let b = convert_row_value(Some("2023-05-01 10:00:00+00"), TypeId::Timestamptz).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_bytea_hex_decoding() {
        assert_eq!(
            convert_row_value(Some("\\xdeadbeef"), TypeId::Bytea).unwrap(),
            Datum::Bytes(vec![0xde, 0xad, 0xbe, 0xef])
        );
    }

    #[test]
    fn test_bit_array_validation() {
        assert_eq!(
            convert_row_value(Some("1010"), TypeId::Varbit).unwrap(),
            Datum::Bits("1010".into())
        );
        assert!(convert_row_value(Some("10a0"), TypeId::Bit).is_err());
    }

    #[test]
    fn test_enum_converts_to_string() {
        assert_eq!(
            convert_row_value(Some("admin"), TypeId::Enum).unwrap(),
            Datum::String("admin".into())
        );
    }

    #[test]
    fn test_length_mismatch_is_assertion() {
        let err = convert_row_values(&[Some("1".into())], &[TypeId::Int4, TypeId::Int4])
            .unwrap_err();
        assert!(matches!(err, MoltError::Assertion(_)));
    }

    #[test]
    fn test_composite_key_ordering_is_lexicographic() {
        let a = vec![Datum::Int(1), Datum::String("b".into())];
        let b = vec![Datum::Int(1), Datum::String("c".into())];
        let c = vec![Datum::Int(2), Datum::String("a".into())];
        assert_eq!(cmp_key(&a, &b).unwrap(), Ordering::Less);
        assert_eq!(cmp_key(&b, &c).unwrap(), Ordering::Less);
        assert_eq!(cmp_key(&a, &a).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_mismatched_kinds_cannot_compare() {
        assert!(Datum::Int(1)
            .cmp_same_kind(&Datum::String("1".into()))
            .is_err());
    }
}
