//! Oracle native type mapping.

use super::TypeId;

/// Map an Oracle type name plus precision/scale to a canonical type.
///
/// `NUMBER(p, s)` with a nonzero scale is numeric; with zero scale it is
/// `int8` while `p` fits (`len('9223372036854776000') == 19`), numeric
/// beyond that. Returns `None` for types the engine cannot yet compare;
/// callers fall back to text with a warning.
pub fn data_type_to_canonical(
    type_name: &str,
    precision: Option<i64>,
    scale: Option<i64>,
) -> Option<TypeId> {
    let name = type_name.to_ascii_uppercase();

    if name.starts_with("TIMESTAMP") {
        if name.contains("TIME ZONE") || name.contains("_TZ_") || name.contains("_LTZ_") {
            return Some(TypeId::Timestamptz);
        }
        return Some(TypeId::Timestamp);
    }

    Some(match name.as_str() {
        "INTEGER" | "INT" | "SIMPLE_INTEGER" => TypeId::Int8,
        "SMALLINT" => TypeId::Int2,
        "DEC" | "NUMBER" | "DECIMAL" | "NUMERIC" => {
            if let Some(prec) = precision {
                if scale.map(|s| s != 0).unwrap_or(false) {
                    return Some(TypeId::Numeric);
                }
                // Precision can be up to 38; beyond 18 digits the value may
                // not fit an int8.
                if prec >= 19 {
                    return Some(TypeId::Numeric);
                }
                return Some(TypeId::Int8);
            }
            TypeId::Numeric
        }
        "DOUBLE" | "BINARY_DOUBLE" => TypeId::Float8,
        "FLOAT" | "BINARY_FLOAT" | "REAL" => TypeId::Float4,
        "LONG" => TypeId::Int8,
        "BOOLEAN" => TypeId::Bool,
        "DATE" => TypeId::Date,
        "BLOB" | "RAW" => TypeId::Bytea,
        "CLOB" | "STRING" => TypeId::Text,
        "VARCHAR" | "VARCHAR2" | "NVARCHAR2" => TypeId::Varchar,
        "NCHAR" | "CHAR" | "CHARACTER" => TypeId::Char,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_scale_zero_small_precision_is_int8() {
        assert_eq!(
            data_type_to_canonical("NUMBER", Some(10), Some(0)),
            Some(TypeId::Int8)
        );
        assert_eq!(
            data_type_to_canonical("NUMBER", Some(18), None),
            Some(TypeId::Int8)
        );
    }

    #[test]
    fn test_number_large_precision_is_numeric() {
        assert_eq!(
            data_type_to_canonical("NUMBER", Some(19), Some(0)),
            Some(TypeId::Numeric)
        );
        assert_eq!(
            data_type_to_canonical("NUMBER", Some(38), None),
            Some(TypeId::Numeric)
        );
    }

    #[test]
    fn test_number_nonzero_scale_is_numeric() {
        assert_eq!(
            data_type_to_canonical("NUMBER", Some(10), Some(2)),
            Some(TypeId::Numeric)
        );
    }

    #[test]
    fn test_number_without_precision_is_numeric() {
        assert_eq!(
            data_type_to_canonical("NUMBER", None, None),
            Some(TypeId::Numeric)
        );
    }

    #[test]
    fn test_timestamp_variants() {
        assert_eq!(
            data_type_to_canonical("TIMESTAMP(6)", None, None),
            Some(TypeId::Timestamp)
        );
        assert_eq!(
            data_type_to_canonical("TIMESTAMP(6) WITH TIME ZONE", None, None),
            Some(TypeId::Timestamptz)
        );
        assert_eq!(
            data_type_to_canonical("TIMESTAMP_TZ_UNCONSTRAINED", None, None),
            Some(TypeId::Timestamptz)
        );
    }

    #[test]
    fn test_character_types() {
        assert_eq!(
            data_type_to_canonical("VARCHAR2", None, None),
            Some(TypeId::Varchar)
        );
        assert_eq!(
            data_type_to_canonical("NCHAR", None, None),
            Some(TypeId::Char)
        );
        assert_eq!(
            data_type_to_canonical("CLOB", None, None),
            Some(TypeId::Text)
        );
    }

    #[test]
    fn test_unknown_type_is_none() {
        assert_eq!(data_type_to_canonical("SDO_GEOMETRY", None, None), None);
    }
}
