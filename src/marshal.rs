//! Value marshaling across the QuickJS boundary.
//!
//! [`HostValue`] is the host-side tagged variant; [`to_vm`] and [`to_host`]
//! convert in both directions. Byte sequences travel as plain arrays of
//! 0-255 integers carrying an explicit `byteLength` property, so scripts can
//! treat them like buffers without the host relying on native typed arrays.
//!
//! Every `rquickjs::Value` created here is owned by Rust and released when
//! dropped, so early returns through `?` never leak VM handles.

use indexmap::IndexMap;
use rquickjs::{Array, Ctx, Object, Value};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

/// Maximum nesting depth decoded from the VM. Deeper (or cyclic) structures
/// decode to [`HostValue::Undefined`].
pub const MAX_DEPTH: usize = 64;

/// Longest array-like decoded as a byte sequence; longer ones are rejected
/// without allocating.
pub const MAX_BYTE_SEQUENCE_LEN: usize = 64 * 1024 * 1024;

/// A host-native value that can cross the VM boundary.
#[derive(Debug, Clone, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<HostValue>),
    Map(IndexMap<String, HostValue>),
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl HostValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, HostValue)>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub const fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Look up a property of a map value.
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        match self {
            Self::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Byte view of a value: `Bytes` directly, or a list of numbers coerced
    /// the way a `Uint8Array` constructor would.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Bytes(bytes) => Some(bytes.clone()),
            Self::List(items) => Some(
                items
                    .iter()
                    .map(|item| item.as_f64().map_or(0, to_uint8))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Structural equality used by deep assertions: like `==` but `NaN`
    /// equals `NaN`.
    pub fn deep_equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.deep_equals(y))
            }
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other| v.deep_equals(other)))
            }
            _ => self == other,
        }
    }

    /// `String(value)` as a script would see it.
    pub fn to_js_string(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::String(s) => s.clone(),
            Self::Bytes(bytes) => bytes
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(","),
            Self::List(items) => items
                .iter()
                .map(|item| {
                    if item.is_nullish() {
                        String::new()
                    } else {
                        item.to_js_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(","),
            Self::Map(_) => "[object Object]".to_string(),
        }
    }

    /// JS `typeof` of the VM value this decodes from.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Null | Self::Bytes(_) | Self::List(_) | Self::Map(_) => "object",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Undefined | Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => number_to_json(*n),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(bytes) => {
                serde_json::Value::Array(bytes.iter().map(|b| serde_json::json!(b)).collect())
            }
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            serde_json::Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Undefined, Into::into)
    }
}

impl Serialize for HostValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Undefined | Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => number_to_json(*n).serialize(serializer),
            Self::String(s) => serializer.serialize_str(s),
            Self::Bytes(bytes) => {
                let mut seq = serializer.serialize_seq(Some(bytes.len()))?;
                for byte in bytes {
                    seq.serialize_element(byte)?;
                }
                seq.end()
            }
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
        }
    }
}

/// Integral values serialize as JSON integers, everything else as floats;
/// non-finite numbers become `null` like `JSON.stringify`.
fn number_to_json(n: f64) -> serde_json::Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        #[allow(clippy::cast_possible_truncation)]
        let int = n as i64;
        serde_json::json!(int)
    } else {
        serde_json::Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number)
    }
}

/// Format a number the way `String(n)` does for the common cases.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e21 {
        return format!("{n:.0}");
    }
    n.to_string()
}

/// `ToUint8` coercion: truncate, then wrap modulo 256.
pub fn to_uint8(n: f64) -> u8 {
    if !n.is_finite() {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let wrapped = (n.trunc() as i64).rem_euclid(256) as u8;
    wrapped
}

/// Convert a host value into a VM value.
pub fn to_vm<'js>(ctx: &Ctx<'js>, value: &HostValue) -> rquickjs::Result<Value<'js>> {
    match value {
        HostValue::Undefined => Ok(Value::new_undefined(ctx.clone())),
        HostValue::Null => Ok(Value::new_null(ctx.clone())),
        HostValue::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        HostValue::Number(n) => Ok(Value::new_number(ctx.clone(), *n)),
        HostValue::String(s) => Ok(rquickjs::String::from_str(ctx.clone(), s)?.into_value()),
        HostValue::Bytes(bytes) => bytes_to_vm(ctx, bytes),
        HostValue::List(items) => {
            let array = Array::new(ctx.clone())?;
            for (idx, item) in items.iter().enumerate() {
                array.set(idx, to_vm(ctx, item)?)?;
            }
            Ok(array.into_value())
        }
        HostValue::Map(map) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in map {
                object.set(key.as_str(), to_vm(ctx, item)?)?;
            }
            Ok(object.into_value())
        }
    }
}

/// Encode bytes as a VM array of integers plus `byteLength`.
pub fn bytes_to_vm<'js>(ctx: &Ctx<'js>, bytes: &[u8]) -> rquickjs::Result<Value<'js>> {
    let array = Array::new(ctx.clone())?;
    for (idx, byte) in bytes.iter().enumerate() {
        array.set(idx, i32::from(*byte))?;
    }
    array.as_object().set("byteLength", bytes.len())?;
    Ok(array.into_value())
}

/// Convert a VM value into a host value. Total: unsupported values
/// (functions, symbols, exceptions, over-deep structures) become `Undefined`.
pub fn to_host(value: &Value<'_>) -> HostValue {
    to_host_at(value, 0)
}

/// Read a byte sequence from a VM value: a marshaled byte array, a plain
/// array of numbers, a `Uint8Array` or an `ArrayBuffer`.
pub fn vm_bytes(value: &Value<'_>) -> Option<Vec<u8>> {
    if let Some(bytes) = native_bytes(value) {
        return Some(bytes);
    }
    let object = value.as_object()?;
    let length = object
        .get::<_, Value>("length")
        .ok()
        .and_then(|len| len.as_number())
        .or_else(|| value.as_array().map(|array| array.len() as f64))?;
    #[allow(clippy::cast_precision_loss)]
    let max_len = MAX_BYTE_SEQUENCE_LEN as f64;
    if !length.is_finite() || length < 0.0 || length > max_len {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let length = length as usize;
    let mut bytes = Vec::with_capacity(length);
    for idx in (0u32..).take(length) {
        let item = object
            .get::<_, Value>(idx)
            .ok()
            .and_then(|item| item.as_number())
            .unwrap_or(0.0);
        bytes.push(to_uint8(item));
    }
    Some(bytes)
}

fn native_bytes(value: &Value<'_>) -> Option<Vec<u8>> {
    let object = value.as_object()?;
    if let Some(typed) = object.as_typed_array::<u8>() {
        return typed.as_bytes().map(<[u8]>::to_vec);
    }
    if let Some(buffer) = object.as_array_buffer() {
        return buffer.as_bytes().map(<[u8]>::to_vec);
    }
    None
}

fn to_host_at(value: &Value<'_>, depth: usize) -> HostValue {
    if depth > MAX_DEPTH {
        return HostValue::Undefined;
    }
    if value.is_undefined() {
        return HostValue::Undefined;
    }
    if value.is_null() {
        return HostValue::Null;
    }
    if let Some(b) = value.as_bool() {
        return HostValue::Bool(b);
    }
    if let Some(n) = value.as_number() {
        return HostValue::Number(n);
    }
    if let Some(s) = value.as_string() {
        return s.to_string().map_or(HostValue::Undefined, HostValue::String);
    }
    if value.is_function() || value.is_symbol() || value.is_exception() {
        return HostValue::Undefined;
    }
    if let Some(bytes) = native_bytes(value) {
        return HostValue::Bytes(bytes);
    }
    if let Some(array) = value.as_array() {
        let has_byte_length = array
            .as_object()
            .get::<_, Value>("byteLength")
            .is_ok_and(|len| len.as_number().is_some());
        if has_byte_length {
            return vm_bytes(value).map_or(HostValue::Undefined, HostValue::Bytes);
        }
        let items = (0..array.len())
            .map(|idx| {
                array
                    .get::<Value>(idx)
                    .map_or(HostValue::Undefined, |item| to_host_at(&item, depth + 1))
            })
            .collect();
        return HostValue::List(items);
    }
    if let Some(object) = value.as_object() {
        let mut map = IndexMap::new();
        for entry in object.props::<String, Value>() {
            let Ok((key, item)) = entry else {
                continue;
            };
            map.insert(key, to_host_at(&item, depth + 1));
        }
        return HostValue::Map(map);
    }
    HostValue::Undefined
}
