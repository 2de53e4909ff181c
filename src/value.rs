//! Conversion between host values and the native dynamic value model.
//!
//! The host side is a JavaScript-like value universe ([`HostValue`]); the
//! native side is the Fleece-style dict/array model ([`NativeValue`]).
//! Conversion is pure and always copies.
//!
//! The conversion is deliberately lossy in two places: host kinds the native
//! model cannot hold (functions, symbols, externals, `undefined`) are dropped
//! from the containing object or array, and binary data nested inside a
//! native structure comes back to the host as `null`.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{BindingError, BindingResult, ErrorDomain, NativeError};
use crate::handle::HandleId;

/// A native dictionary. Key order carries no meaning.
pub type Dict = BTreeMap<String, NativeValue>;

/// Property marking a dictionary as a blob reference.
pub const BLOB_TYPE_PROPERTY: &str = "@type";
pub const BLOB_TYPE: &str = "blob";

/// A value as seen by the host runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    String(String),
    Buffer(Vec<u8>),
    Array(Vec<HostValue>),
    /// Properties in enumeration order.
    Object(Vec<(String, HostValue)>),
    Function,
    Symbol,
    External(HandleId),
}

impl HostValue {
    /// Build an object from `(key, value)` pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, HostValue)>,
    {
        HostValue::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Look up a property of an object.
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        match self {
            HostValue::Object(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, HostValue::Null | HostValue::Undefined)
    }

    /// Name of the value's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::BigInt(_) => "bigint",
            HostValue::String(_) => "string",
            HostValue::Buffer(_) => "buffer",
            HostValue::Array(_) => "array",
            HostValue::Object(_) => "object",
            HostValue::Function => "function",
            HostValue::Symbol => "symbol",
            HostValue::External(_) => "external",
        }
    }
}

impl From<serde_json::Value> for HostValue {
    /// JSON numbers become host numbers unless they are integers that a
    /// double cannot hold exactly, which become big integers.
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(b) => HostValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if (i as f64) as i64 == i && i.unsigned_abs() <= MAX_SAFE_INTEGER {
                        HostValue::Number(i as f64)
                    } else {
                        HostValue::BigInt(i as i128)
                    }
                } else if let Some(u) = n.as_u64() {
                    HostValue::BigInt(u as i128)
                } else {
                    HostValue::Number(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => HostValue::String(s),
            serde_json::Value::Array(arr) => {
                HostValue::Array(arr.into_iter().map(HostValue::from).collect())
            }
            serde_json::Value::Object(map) => {
                HostValue::Object(map.into_iter().map(|(k, v)| (k, HostValue::from(v))).collect())
            }
        }
    }
}

const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// A value in the native dynamic value model.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
    Data(Vec<u8>),
    Array(Vec<NativeValue>),
    Dict(Dict),
}

impl NativeValue {
    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            NativeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NativeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            NativeValue::Int(i) => Some(*i),
            NativeValue::UInt(u) => i64::try_from(*u).ok(),
            NativeValue::Double(d) if d.fract() == 0.0 => Some(*d as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NativeValue::Int(i) => Some(*i as f64),
            NativeValue::UInt(u) => Some(*u as f64),
            NativeValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Convert from a JSON value. Integers keep their integer type.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => NativeValue::Null,
            serde_json::Value::Bool(b) => NativeValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    NativeValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    NativeValue::UInt(u)
                } else {
                    NativeValue::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => NativeValue::String(s),
            serde_json::Value::Array(arr) => {
                NativeValue::Array(arr.into_iter().map(NativeValue::from_json).collect())
            }
            serde_json::Value::Object(map) => NativeValue::Dict(
                map.into_iter()
                    .map(|(k, v)| (k, NativeValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to JSON. Binary data is base64-encoded; non-finite doubles
    /// become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            NativeValue::Null => serde_json::Value::Null,
            NativeValue::Bool(b) => serde_json::Value::Bool(*b),
            NativeValue::Int(i) => serde_json::Value::Number((*i).into()),
            NativeValue::UInt(u) => serde_json::Value::Number((*u).into()),
            NativeValue::Double(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            NativeValue::String(s) => serde_json::Value::String(s.clone()),
            NativeValue::Data(bytes) => serde_json::Value::String(BASE64.encode(bytes)),
            NativeValue::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(NativeValue::to_json).collect())
            }
            NativeValue::Dict(dict) => dict_to_json(dict),
        }
    }
}

impl From<Dict> for NativeValue {
    fn from(dict: Dict) -> Self {
        NativeValue::Dict(dict)
    }
}

pub fn dict_to_json(dict: &Dict) -> serde_json::Value {
    serde_json::Value::Object(dict.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

pub fn dict_to_json_string(dict: &Dict) -> String {
    dict_to_json(dict).to_string()
}

/// Parse a JSON object into a dictionary.
pub fn dict_from_json_str(json: &str) -> Result<Dict, NativeError> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| {
        NativeError::new(ErrorDomain::Fleece, fleece_codes::JSON_ERROR, e.to_string())
    })?;
    match NativeValue::from_json(value) {
        NativeValue::Dict(d) => Ok(d),
        _ => Err(NativeError::new(
            ErrorDomain::Fleece,
            fleece_codes::JSON_ERROR,
            "JSON is not an object",
        )),
    }
}

mod fleece_codes {
    pub const JSON_ERROR: i32 = 6;
}

/// Whether a native value is a blob reference.
pub fn is_blob(value: &NativeValue) -> bool {
    match value {
        NativeValue::Dict(d) => {
            d.get(BLOB_TYPE_PROPERTY).and_then(NativeValue::as_str) == Some(BLOB_TYPE)
                && matches!(d.get("digest"), Some(NativeValue::String(_)))
        }
        _ => false,
    }
}

/// Convert a host value to a native value.
///
/// Returns `None` for kinds the native model cannot represent. Such values
/// nested inside objects or arrays are skipped.
pub fn host_to_native(value: &HostValue) -> Option<NativeValue> {
    match value {
        HostValue::Null => Some(NativeValue::Null),
        HostValue::Bool(b) => Some(NativeValue::Bool(*b)),
        HostValue::Number(n) => Some(number_to_native(*n)),
        HostValue::BigInt(i) => {
            if let Ok(v) = i64::try_from(*i) {
                Some(NativeValue::Int(v))
            } else if let Ok(v) = u64::try_from(*i) {
                Some(NativeValue::UInt(v))
            } else {
                tracing::debug!(value = %i, "dropping bigint outside the 64-bit range");
                None
            }
        }
        HostValue::String(s) => Some(NativeValue::String(s.clone())),
        HostValue::Buffer(b) => Some(NativeValue::Data(b.clone())),
        HostValue::Array(items) => Some(NativeValue::Array(
            items.iter().filter_map(host_to_native).collect(),
        )),
        HostValue::Object(entries) => Some(NativeValue::Dict(
            entries
                .iter()
                .filter_map(|(k, v)| host_to_native(v).map(|nv| (k.clone(), nv)))
                .collect(),
        )),
        HostValue::Undefined | HostValue::Function | HostValue::Symbol | HostValue::External(_) => {
            None
        }
    }
}

/// A number is stored as an integer only when it survives a round trip
/// through a 32-bit integer bit for bit.
fn number_to_native(n: f64) -> NativeValue {
    let as_int = n as i32;
    if (as_int as f64).to_bits() == n.to_bits() {
        NativeValue::Int(as_int as i64)
    } else {
        NativeValue::Double(n)
    }
}

/// Convert a host object to a native dictionary.
pub fn host_to_dict(value: &HostValue) -> BindingResult<Dict> {
    match value {
        HostValue::Object(_) => match host_to_native(value) {
            Some(NativeValue::Dict(d)) => Ok(d),
            _ => Err(BindingError::invalid_argument("expected an object")),
        },
        other => Err(BindingError::invalid_argument(format!(
            "expected an object, got {}",
            other.type_name()
        ))),
    }
}

/// Convert a native value to a host value.
pub fn native_to_host(value: &NativeValue) -> HostValue {
    match value {
        NativeValue::Null => HostValue::Null,
        NativeValue::Bool(b) => HostValue::Bool(*b),
        NativeValue::Int(i) => match i32::try_from(*i) {
            Ok(small) => HostValue::Number(small as f64),
            Err(_) => HostValue::BigInt(*i as i128),
        },
        NativeValue::UInt(u) => match u32::try_from(*u) {
            Ok(small) => HostValue::Number(small as f64),
            Err(_) => HostValue::BigInt(*u as i128),
        },
        NativeValue::Double(d) => HostValue::Number(*d),
        NativeValue::String(s) => HostValue::String(s.clone()),
        NativeValue::Data(_) => HostValue::Null,
        NativeValue::Array(items) => HostValue::Array(items.iter().map(native_to_host).collect()),
        NativeValue::Dict(dict) => dict_to_host(dict),
    }
}

pub fn dict_to_host(dict: &Dict) -> HostValue {
    HostValue::Object(dict.iter().map(|(k, v)| (k.clone(), native_to_host(v))).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn numbers_classify_by_int32_round_trip() {
        assert_eq!(host_to_native(&HostValue::Number(3.0)), Some(NativeValue::Int(3)));
        assert_eq!(host_to_native(&HostValue::Number(-7.0)), Some(NativeValue::Int(-7)));
        assert_eq!(host_to_native(&HostValue::Number(3.5)), Some(NativeValue::Double(3.5)));
        // -0.0 is not bit-identical to 0
        assert_eq!(host_to_native(&HostValue::Number(-0.0)), Some(NativeValue::Double(-0.0)));
        // integral but outside the 32-bit range stays a double
        assert_eq!(host_to_native(&HostValue::Number(1e10)), Some(NativeValue::Double(1e10)));
    }

    #[test]
    fn wide_integers_travel_as_bigint() {
        let big = HostValue::BigInt(1 << 40);
        assert_eq!(host_to_native(&big), Some(NativeValue::Int(1 << 40)));
        assert_eq!(native_to_host(&NativeValue::Int(1 << 40)), big);

        let huge = HostValue::BigInt(u64::MAX as i128);
        assert_eq!(host_to_native(&huge), Some(NativeValue::UInt(u64::MAX)));
        assert_eq!(native_to_host(&NativeValue::UInt(u64::MAX)), huge);

        assert_eq!(host_to_native(&HostValue::BigInt(i128::MAX)), None);
    }

    #[test]
    fn unsupported_kinds_are_dropped() {
        let value = HostValue::object([
            ("keep", HostValue::Number(1.0)),
            ("fn", HostValue::Function),
            ("sym", HostValue::Symbol),
            ("undef", HostValue::Undefined),
            ("ext", HostValue::External(HandleId::from_raw(9))),
            (
                "list",
                HostValue::Array(vec![HostValue::Function, HostValue::Bool(true)]),
            ),
        ]);

        let native = host_to_native(&value).unwrap();
        let dict = native.as_dict().unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict["keep"], NativeValue::Int(1));
        assert_eq!(dict["list"], NativeValue::Array(vec![NativeValue::Bool(true)]));

        assert_eq!(host_to_native(&HostValue::Function), None);
    }

    #[test]
    fn nested_data_becomes_null() {
        let native = NativeValue::Array(vec![NativeValue::Data(vec![1, 2, 3])]);
        assert_eq!(native_to_host(&native), HostValue::Array(vec![HostValue::Null]));
    }

    #[test]
    fn host_to_dict_requires_object() {
        let err = host_to_dict(&HostValue::String("x".into())).unwrap_err();
        assert!(err.is_type_error());
    }

    #[test]
    fn blob_predicate() {
        let mut blob = Dict::new();
        blob.insert("@type".into(), NativeValue::String("blob".into()));
        blob.insert("digest".into(), NativeValue::String("sha1-abc".into()));
        assert!(is_blob(&NativeValue::Dict(blob.clone())));

        blob.remove("digest");
        assert!(!is_blob(&NativeValue::Dict(blob)));
        assert!(!is_blob(&NativeValue::String("blob".into())));
    }

    #[test]
    fn json_keeps_double_formatting() {
        let dict = dict_from_json_str(r#"{"version":3.0,"count":2}"#).unwrap();
        assert_eq!(dict["version"], NativeValue::Double(3.0));
        assert_eq!(dict["count"], NativeValue::Int(2));
        assert_eq!(dict_to_json_string(&dict), r#"{"count":2,"version":3.0}"#);

        assert!(dict_from_json_str("[1]").is_err());
        assert!(dict_from_json_str("{").is_err());
    }

    fn host_value() -> impl Strategy<Value = HostValue> {
        let leaf = prop_oneof![
            Just(HostValue::Null),
            any::<bool>().prop_map(HostValue::Bool),
            any::<i32>().prop_map(|i| HostValue::Number(i as f64)),
            (-1.0e12f64..1.0e12).prop_map(HostValue::Number),
            prop_oneof![
                (i32::MAX as i64 + 1..i64::MAX),
                (i64::MIN..i32::MIN as i64)
            ]
            .prop_map(|i| HostValue::BigInt(i as i128)),
            ((u32::MAX as u64 + 1)..u64::MAX).prop_map(|u| HostValue::BigInt(u as i128)),
            "[a-z0-9 ]{0,12}".prop_map(HostValue::String),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(HostValue::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..6)
                    .prop_map(|m| HostValue::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn representable_values_round_trip(value in host_value()) {
            let native = host_to_native(&value).unwrap();
            prop_assert_eq!(native_to_host(&native), value);
        }
    }
}
