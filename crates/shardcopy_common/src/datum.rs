use std::fmt;

use crate::types::DataType;

/// A single decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
}

impl Datum {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Boolean(_) => Some(DataType::Boolean),
            Datum::Int32(_) => Some(DataType::Int32),
            Datum::Int64(_) => Some(DataType::Int64),
            Datum::Float64(_) => Some(DataType::Float64),
            Datum::Text(_) => Some(DataType::Text),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Decode a text field as `data_type`.
    pub fn parse(field: &str, data_type: DataType) -> Result<Datum, String> {
        match data_type {
            DataType::Int32 => field
                .parse::<i32>()
                .map(Datum::Int32)
                .map_err(|e| format!("Cannot parse '{}' as INT: {}", field, e)),
            DataType::Int64 => field
                .parse::<i64>()
                .map(Datum::Int64)
                .map_err(|e| format!("Cannot parse '{}' as BIGINT: {}", field, e)),
            DataType::Float64 => field
                .parse::<f64>()
                .map(Datum::Float64)
                .map_err(|e| format!("Cannot parse '{}' as FLOAT: {}", field, e)),
            DataType::Boolean => match field.to_lowercase().as_str() {
                "t" | "true" | "1" | "yes" | "on" => Ok(Datum::Boolean(true)),
                "f" | "false" | "0" | "no" | "off" => Ok(Datum::Boolean(false)),
                _ => Err(format!("Cannot parse '{}' as BOOLEAN", field)),
            },
            DataType::Text => Ok(Datum::Text(field.to_string())),
        }
    }

    /// Type-tagged byte encoding used as hash input. Equal values of the
    /// same integer width always encode identically.
    pub fn encode_for_hash(&self, buf: &mut Vec<u8>) {
        match self {
            Datum::Null => buf.push(0x00),
            Datum::Boolean(b) => {
                buf.push(0x01);
                buf.push(u8::from(*b));
            }
            Datum::Int32(v) => {
                buf.push(0x02);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Datum::Int64(v) => {
                buf.push(0x03);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Datum::Float64(v) => {
                buf.push(0x04);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Datum::Text(s) => {
                buf.push(0x05);
                buf.extend_from_slice(s.as_bytes());
                buf.push(0x00);
            }
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => f.write_str("NULL"),
            Datum::Boolean(b) => f.write_str(if *b { "t" } else { "f" }),
            Datum::Int32(v) => write!(f, "{}", v),
            Datum::Int64(v) => write!(f, "{}", v),
            Datum::Float64(v) => write!(f, "{}", v),
            Datum::Text(s) => f.write_str(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typed_fields() {
        assert_eq!(Datum::parse("42", DataType::Int64), Ok(Datum::Int64(42)));
        assert_eq!(Datum::parse("-7", DataType::Int32), Ok(Datum::Int32(-7)));
        assert_eq!(Datum::parse("on", DataType::Boolean), Ok(Datum::Boolean(true)));
        assert_eq!(
            Datum::parse("abc", DataType::Text),
            Ok(Datum::Text("abc".into()))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Datum::parse("x1", DataType::Int64).is_err());
        assert!(Datum::parse("maybe", DataType::Boolean).is_err());
    }

    #[test]
    fn test_hash_encoding_distinguishes_types() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        Datum::Int64(1).encode_for_hash(&mut a);
        Datum::Text("1".into()).encode_for_hash(&mut b);
        assert_ne!(a, b);
    }
}
