use crate::types::SqlColumnType;

use super::SpecError;

/// Map an event input type signature to a generic SQL column type and
/// length. `bytes_to_string` selects the printable projection for `bytesN`
/// inputs. Unknown signatures are a spec-load error, never defaulted.
///
/// The int/uint width thresholds are chosen so the native integer column is
/// only used when the value range fits a signed 64-bit integer.
pub fn map_type(signature: &str, bytes_to_string: bool) -> Result<(SqlColumnType, usize), SpecError> {
    let width: u32 = signature
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .parse()
        .unwrap_or(0);

    match signature {
        "address" => Ok((SqlColumnType::Varchar, 40)),
        "bool" => Ok((SqlColumnType::Bool, 0)),
        "string" => Ok((SqlColumnType::Text, 0)),
        s if s.starts_with("bytes") => {
            if bytes_to_string {
                Ok((SqlColumnType::Varchar, 40))
            } else {
                Ok((SqlColumnType::ByteA, 0))
            }
        }
        s if s.starts_with("int") => {
            if width <= 32 {
                Ok((SqlColumnType::Int, 0))
            } else {
                Ok((SqlColumnType::Numeric, 0))
            }
        }
        s if s.starts_with("uint") => {
            if width <= 16 {
                Ok((SqlColumnType::Int, 0))
            } else {
                Ok((SqlColumnType::Numeric, 0))
            }
        }
        other => Err(SpecError::UnknownType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_types() {
        assert_eq!(map_type("address", false).unwrap(), (SqlColumnType::Varchar, 40));
        assert_eq!(map_type("bool", false).unwrap(), (SqlColumnType::Bool, 0));
        assert_eq!(map_type("string", false).unwrap(), (SqlColumnType::Text, 0));
    }

    #[test]
    fn test_bytes_projection() {
        assert_eq!(map_type("bytes32", false).unwrap(), (SqlColumnType::ByteA, 0));
        assert_eq!(map_type("bytes", false).unwrap(), (SqlColumnType::ByteA, 0));
        assert_eq!(map_type("bytes32", true).unwrap(), (SqlColumnType::Varchar, 40));
    }

    #[test]
    fn test_int_width_thresholds() {
        assert_eq!(map_type("int8", false).unwrap().0, SqlColumnType::Int);
        assert_eq!(map_type("int32", false).unwrap().0, SqlColumnType::Int);
        assert_eq!(map_type("int64", false).unwrap().0, SqlColumnType::Numeric);
        assert_eq!(map_type("int256", false).unwrap().0, SqlColumnType::Numeric);
        // bare "int" has no width digits and maps to the native type
        assert_eq!(map_type("int", false).unwrap().0, SqlColumnType::Int);
    }

    #[test]
    fn test_uint_width_thresholds() {
        assert_eq!(map_type("uint8", false).unwrap().0, SqlColumnType::Int);
        assert_eq!(map_type("uint16", false).unwrap().0, SqlColumnType::Int);
        assert_eq!(map_type("uint32", false).unwrap().0, SqlColumnType::Numeric);
        assert_eq!(map_type("uint256", false).unwrap().0, SqlColumnType::Numeric);
        assert_eq!(map_type("uint", false).unwrap().0, SqlColumnType::Int);
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        match map_type("typeunknown", false) {
            Err(SpecError::UnknownType(t)) => assert_eq!(t, "typeunknown"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }
}
