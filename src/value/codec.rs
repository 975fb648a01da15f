//! Byte encoding for [`Value`]
//!
//! Values travel as UTF-8 JSON text. Numeric fidelity policy:
//!
//! - integers that fit in `i64` stay [`Value::Int`]
//! - floats stay [`Value::Float`]; `3.0` is written as `3.0`, never `3`
//! - finite floats decode to the exact bits they were encoded from
//! - integers above `i64::MAX` widen to [`Value::Float`] on decode
//! - NaN and infinities cannot be encoded
//!
//! Nesting is capped at [`MAX_DEPTH`] levels in both directions.

use super::Value;
use crate::error::CodecError;
use bytes::Bytes;
use serde_json::{Map, Number};

/// Deepest container nesting accepted by the codec.
pub const MAX_DEPTH: usize = 128;

pub fn encode(value: &Value) -> Result<Bytes, CodecError> {
    let json = to_json(value, 0)?;
    serde_json::to_vec(&json)
        .map(Bytes::from)
        .map_err(|e| CodecError::UnsupportedValue(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    let json: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedPayload(e.to_string()))?;
    from_json(json, 0)
}

/// Encode a call's argument list as one sequence value.
pub fn encode_args(args: &[Value]) -> Result<Bytes, CodecError> {
    let items = args
        .iter()
        .map(|arg| to_json(arg, 1))
        .collect::<Result<Vec<_>, _>>()?;
    serde_json::to_vec(&serde_json::Value::Array(items))
        .map(Bytes::from)
        .map_err(|e| CodecError::UnsupportedValue(e.to_string()))
}

pub fn decode_args(bytes: &[u8]) -> Result<Vec<Value>, CodecError> {
    match decode(bytes)? {
        Value::Seq(items) => Ok(items),
        other => Err(CodecError::MalformedPayload(format!(
            "argument list must be a sequence, got {}",
            other.kind()
        ))),
    }
}

fn to_json(value: &Value, depth: usize) -> Result<serde_json::Value, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::UnsupportedValue(format!(
            "nesting deeper than {MAX_DEPTH} levels"
        )));
    }

    let json = match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number(Number::from(*i)),
        Value::Float(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| CodecError::UnsupportedValue(format!("non-finite float {f}")))?,
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Seq(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|item| to_json(item, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, item) in entries {
                map.insert(key.clone(), to_json(item, depth + 1)?);
            }
            serde_json::Value::Object(map)
        }
    };

    Ok(json)
}

fn from_json(json: serde_json::Value, depth: usize) -> Result<Value, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::MalformedPayload(format!(
            "nesting deeper than {MAX_DEPTH} levels"
        )));
    }

    let value = match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(CodecError::MalformedPayload(format!("unreadable number {n}")));
            }
        }
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::Seq(
            items
                .into_iter()
                .map(|item| from_json(item, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        serde_json::Value::Object(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| from_json(v, depth + 1).map(|v| (k, v)))
                .collect::<Result<_, _>>()?,
        ),
    };

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use std::collections::BTreeMap;

    #[test]
    fn test_nested_value_survives() {
        let mut inner = BTreeMap::new();
        inner.insert("pi".to_string(), Value::Float(3.14));
        inner.insert("tags".to_string(), Value::from(vec!["a", "b"]));
        inner.insert("none".to_string(), Value::Null);
        let value = Value::Seq(vec![
            Value::Int(-4),
            Value::Bool(false),
            Value::Map(inner),
            Value::String("héllo".into()),
        ]);

        let bytes = encode(&value).unwrap();
        assert_eq!(decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_integer_and_float_stay_distinct() {
        let bytes = encode_args(&args![3, 3.0]).unwrap();
        assert_eq!(&bytes[..], b"[3,3.0]");

        let decoded = decode_args(&bytes).unwrap();
        assert_eq!(decoded, vec![Value::Int(3), Value::Float(3.0)]);
    }

    #[test]
    fn test_finite_floats_survive_exactly() {
        // xorshift64 over raw bit patterns, so subnormals and extreme
        // exponents are covered along with ordinary values
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut checked = 0;
        while checked < 20_000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let f = f64::from_bits(state);
            if !f.is_finite() {
                continue;
            }
            let decoded = decode(&encode(&Value::Float(f)).unwrap()).unwrap();
            match decoded {
                Value::Float(back) => assert_eq!(back.to_bits(), f.to_bits(), "{f:e}"),
                other => panic!("{f:e} decoded as {other:?}"),
            }
            checked += 1;
        }
    }

    #[test]
    fn test_known_hard_floats_survive() {
        for f in [1.0715660391465826e-75, -1.81996730402717e-179, -1.603964615428183e143] {
            assert_eq!(decode(&encode(&Value::Float(f)).unwrap()).unwrap(), Value::Float(f));
        }
    }

    #[test]
    fn test_large_unsigned_widens_to_float() {
        let decoded = decode(b"18446744073709551615").unwrap();
        assert!(matches!(decoded, Value::Float(_)));
    }

    #[test]
    fn test_non_finite_float_is_unsupported() {
        let err = encode(&Value::Float(f64::NAN)).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedValue(_)));

        let err = encode_args(&[Value::Float(f64::INFINITY)]).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedValue(_)));
    }

    #[test]
    fn test_too_deep_nesting_is_unsupported() {
        let mut value = Value::Null;
        for _ in 0..(MAX_DEPTH + 2) {
            value = Value::Seq(vec![value]);
        }
        assert!(matches!(
            encode(&value),
            Err(CodecError::UnsupportedValue(_))
        ));
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            decode(b"{\"a\": "),
            Err(CodecError::MalformedPayload(_))
        ));
        assert!(matches!(
            decode(b"\xff\xfe"),
            Err(CodecError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_args_must_be_a_sequence() {
        let err = decode_args(b"{\"a\":1}").unwrap_err();
        assert_eq!(
            err,
            CodecError::MalformedPayload("argument list must be a sequence, got map".into())
        );
    }
}
