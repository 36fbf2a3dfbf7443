//! MySQL native type mapping.

use super::TypeId;

/// Map a MySQL `data_type` plus full `column_type` string to a canonical
/// type. Returns `None` for types the engine cannot yet compare; callers
/// fall back to text with a warning.
pub fn data_type_to_canonical(data_type: &str, column_type: &str) -> Option<TypeId> {
    let dt = data_type.to_ascii_lowercase();
    let ct = column_type.to_ascii_lowercase();
    let unsigned = ct.contains("unsigned");
    Some(match dt.as_str() {
        "tinyint" | "smallint" => {
            if unsigned {
                TypeId::Int4
            } else {
                TypeId::Int2
            }
        }
        "mediumint" | "int" | "integer" => {
            if unsigned {
                TypeId::Int8
            } else {
                TypeId::Int4
            }
        }
        // Unsigned bigint can exceed int8; compare as numeric.
        "bigint" => {
            if unsigned {
                TypeId::Numeric
            } else {
                TypeId::Int8
            }
        }
        "year" => TypeId::Int2,
        "float" => TypeId::Float4,
        "double" | "real" => TypeId::Float8,
        "decimal" | "numeric" => TypeId::Numeric,
        "char" => TypeId::Char,
        "varchar" => TypeId::Varchar,
        "text" | "tinytext" | "mediumtext" | "longtext" => TypeId::Text,
        "json" => TypeId::Jsonb,
        "datetime" | "timestamp" => TypeId::Timestamp,
        "date" => TypeId::Date,
        "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" => TypeId::Bytea,
        "bit" => TypeId::Varbit,
        "enum" | "set" => TypeId::Enum,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widths() {
        assert_eq!(
            data_type_to_canonical("tinyint", "tinyint(4)"),
            Some(TypeId::Int2)
        );
        assert_eq!(
            data_type_to_canonical("int", "int(11)"),
            Some(TypeId::Int4)
        );
        assert_eq!(
            data_type_to_canonical("bigint", "bigint(20)"),
            Some(TypeId::Int8)
        );
    }

    #[test]
    fn test_unsigned_widening() {
        assert_eq!(
            data_type_to_canonical("int", "int(10) unsigned"),
            Some(TypeId::Int8)
        );
        assert_eq!(
            data_type_to_canonical("bigint", "bigint(20) unsigned"),
            Some(TypeId::Numeric)
        );
    }

    #[test]
    fn test_strings_json_and_binary() {
        assert_eq!(
            data_type_to_canonical("varchar", "varchar(255)"),
            Some(TypeId::Varchar)
        );
        assert_eq!(data_type_to_canonical("json", "json"), Some(TypeId::Jsonb));
        assert_eq!(
            data_type_to_canonical("varbinary", "varbinary(16)"),
            Some(TypeId::Bytea)
        );
        assert_eq!(
            data_type_to_canonical("enum", "enum('a','b')"),
            Some(TypeId::Enum)
        );
    }

    #[test]
    fn test_unknown_type_is_none() {
        assert_eq!(data_type_to_canonical("geometry", "geometry"), None);
    }
}
