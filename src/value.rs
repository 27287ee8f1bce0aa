//! Dynamic value model for captured arguments and results
//!
//! Captured values are snapshotted into [`ArgValue`], a self-describing tree
//! that survives persistence independently of the original Rust type. Any
//! `Serialize` type can be captured; replay goes back through
//! `DeserializeOwned`.
//!
//! ```
//! use snapcall::value::ArgValue;
//!
//! let v = ArgValue::capture(&vec![1, 2, 3]);
//! assert_eq!(v, ArgValue::List(vec![1.into(), 2.into(), 3.into()]));
//! let back: Vec<i32> = v.decode().unwrap();
//! assert_eq!(back, vec![1, 2, 3]);
//! ```

use serde::de::DeserializeOwned;
use serde::ser;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error raised while converting to or from [`ArgValue`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct ValueError(String);

impl ValueError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl ser::Error for ValueError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

/// A snapshot of a runtime value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    /// Only used for unsigned values above `i64::MAX`
    UInt(u64),
    /// Non-finite values are stored as `"NaN"`, `"inf"` or `"-inf"`
    Float(#[serde(with = "float_repr")] f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<ArgValue>),
    Tuple(Vec<ArgValue>),
    Set(Vec<ArgValue>),
    /// String-keyed mapping in insertion order
    Map(Vec<(String, ArgValue)>),
    /// Named struct with its fields in declaration order
    Record {
        type_name: String,
        fields: Vec<(String, ArgValue)>,
    },
    /// Enum variant, with an optional payload
    Variant {
        type_name: String,
        variant: String,
        payload: Option<Box<ArgValue>>,
    },
    /// Value that could not be snapshotted
    Opaque { type_name: String },
}

impl ArgValue {
    /// Snapshot any serializable value.
    ///
    /// Serialization failures never escape: the value is replaced by
    /// [`ArgValue::Opaque`] naming its type.
    pub fn capture<T: Serialize + ?Sized>(value: &T) -> Self {
        match Self::try_capture(value) {
            Ok(v) => v,
            Err(err) => {
                tracing::debug!(
                    "Value of type {} is not capturable: {}",
                    std::any::type_name::<T>(),
                    err
                );
                ArgValue::Opaque {
                    type_name: short_type_name::<T>(),
                }
            }
        }
    }

    /// Snapshot a value, reporting serialization failures
    pub fn try_capture<T: Serialize + ?Sized>(value: &T) -> Result<Self, ValueError> {
        value.serialize(ValueSerializer)
    }

    /// Build a set value, dropping duplicate elements
    pub fn set(items: impl IntoIterator<Item = ArgValue>) -> Self {
        let mut out: Vec<ArgValue> = Vec::new();
        for item in items {
            if !out.contains(&item) {
                out.push(item);
            }
        }
        ArgValue::Set(out)
    }

    /// Build a string-keyed map
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, ArgValue)>) -> Self {
        ArgValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Rebuild a typed value from this snapshot
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ValueError> {
        serde_json::from_value(self.to_json()).map_err(|e| ValueError(e.to_string()))
    }

    /// JSON view used for typed replay
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            ArgValue::Null | ArgValue::Opaque { .. } => J::Null,
            ArgValue::Bool(b) => J::Bool(*b),
            ArgValue::Int(i) => J::from(*i),
            ArgValue::UInt(u) => J::from(*u),
            ArgValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(J::Number)
                .unwrap_or(J::Null),
            ArgValue::Str(s) => J::String(s.clone()),
            ArgValue::Bytes(b) => J::Array(b.iter().map(|x| J::from(*x)).collect()),
            ArgValue::List(items) | ArgValue::Tuple(items) | ArgValue::Set(items) => {
                J::Array(items.iter().map(ArgValue::to_json).collect())
            }
            ArgValue::Map(entries) | ArgValue::Record { fields: entries, .. } => J::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            ArgValue::Variant {
                variant, payload, ..
            } => match payload {
                None => J::String(variant.clone()),
                Some(inner) => {
                    let mut obj = serde_json::Map::new();
                    obj.insert(variant.clone(), inner.to_json());
                    J::Object(obj)
                }
            },
        }
    }

    /// Runtime kind name, used by minimal capture
    pub fn type_name(&self) -> &str {
        match self {
            ArgValue::Null => "none",
            ArgValue::Bool(_) => "bool",
            ArgValue::Int(_) | ArgValue::UInt(_) => "int",
            ArgValue::Float(_) => "float",
            ArgValue::Str(_) => "str",
            ArgValue::Bytes(_) => "bytes",
            ArgValue::List(_) => "list",
            ArgValue::Tuple(_) => "tuple",
            ArgValue::Set(_) => "set",
            ArgValue::Map(_) => "map",
            ArgValue::Record { type_name, .. }
            | ArgValue::Variant { type_name, .. }
            | ArgValue::Opaque { type_name } => type_name,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Int(i) => Some(*i),
            ArgValue::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ArgValue::Null)
    }

    /// Number of direct children for container kinds
    pub fn len(&self) -> Option<usize> {
        match self {
            ArgValue::List(v) | ArgValue::Tuple(v) | ArgValue::Set(v) => Some(v.len()),
            ArgValue::Map(m) => Some(m.len()),
            ArgValue::Bytes(b) => Some(b.len()),
            ArgValue::Str(s) => Some(s.chars().count()),
            _ => None,
        }
    }

    /// Render as a map key
    fn key_string(&self) -> String {
        match self {
            ArgValue::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Last path segment of a type name, generics included
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let (head, generics) = match full.find('<') {
        Some(idx) => full.split_at(idx),
        None => (full, ""),
    };
    let base = head.rsplit("::").next().unwrap_or(head);
    format!("{}{}", base, generics)
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[ArgValue]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Null => write!(f, "None"),
            ArgValue::Bool(b) => write!(f, "{}", b),
            ArgValue::Int(i) => write!(f, "{}", i),
            ArgValue::UInt(u) => write!(f, "{}", u),
            ArgValue::Float(x) => write!(f, "{:?}", x),
            ArgValue::Str(s) => write!(f, "'{}'", s),
            ArgValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            ArgValue::List(items) => {
                write!(f, "[")?;
                write_items(f, items)?;
                write!(f, "]")
            }
            ArgValue::Tuple(items) => {
                write!(f, "(")?;
                write_items(f, items)?;
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            ArgValue::Set(items) => {
                write!(f, "{{")?;
                write_items(f, items)?;
                write!(f, "}}")
            }
            ArgValue::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "'{}': {}", k, v)?;
                }
                write!(f, "}}")
            }
            ArgValue::Record { type_name, fields } => {
                write!(f, "{} {{ ", type_name)?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, " }}")
            }
            ArgValue::Variant {
                type_name,
                variant,
                payload,
            } => match payload {
                None => write!(f, "{}::{}", type_name, variant),
                Some(inner) => write!(f, "{}::{}({})", type_name, variant, inner),
            },
            ArgValue::Opaque { type_name } => write!(f, "<UNSERIALIZABLE:{}>", type_name),
        }
    }
}

macro_rules! impl_from_signed {
    ($($t:ty),*) => {
        $(impl From<$t> for ArgValue {
            fn from(v: $t) -> Self {
                ArgValue::Int(i64::from(v))
            }
        })*
    };
}

impl_from_signed!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for ArgValue {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => ArgValue::Int(i),
            Err(_) => ArgValue::UInt(v),
        }
    }
}

impl From<usize> for ArgValue {
    fn from(v: usize) -> Self {
        ArgValue::from(v as u64)
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}

impl From<f32> for ArgValue {
    fn from(v: f32) -> Self {
        ArgValue::Float(f64::from(v))
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

impl From<Vec<ArgValue>> for ArgValue {
    fn from(v: Vec<ArgValue>) -> Self {
        ArgValue::List(v)
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(ArgValue::Null, Into::into)
    }
}

/// Ordered mapping of parameter name to value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamedArgs(Vec<(String, ArgValue)>);

impl NamedArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; a replaced entry keeps its position
    pub fn insert(&mut self, name: impl Into<String>, value: ArgValue) {
        let name = name.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Decode one argument into a typed value
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.decode().ok())
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &ArgValue> {
        self.0.iter().map(|(_, v)| v)
    }

    pub fn into_inner(self) -> Vec<(String, ArgValue)> {
        self.0
    }
}

impl<K: Into<String>> FromIterator<(K, ArgValue)> for NamedArgs {
    fn from_iter<I: IntoIterator<Item = (K, ArgValue)>>(iter: I) -> Self {
        let mut out = NamedArgs::new();
        for (k, v) in iter {
            out.insert(k, v);
        }
        out
    }
}

impl IntoIterator for NamedArgs {
    type Item = (String, ArgValue);
    type IntoIter = std::vec::IntoIter<(String, ArgValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Raw positional and keyword arguments of one call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallArgs {
    pub positional: Vec<ArgValue>,
    pub keyword: Vec<(String, ArgValue)>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Serialize) -> Self {
        self.positional.push(ArgValue::capture(&value));
        self
    }

    /// Append a keyword argument
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        self.keyword.push((name.into(), ArgValue::capture(&value)));
        self
    }

    pub fn arg_value(mut self, value: ArgValue) -> Self {
        self.positional.push(value);
        self
    }

    pub fn kwarg_value(mut self, name: impl Into<String>, value: ArgValue) -> Self {
        self.keyword.push((name.into(), value));
        self
    }

    pub fn keyword(&self, name: &str) -> Option<&ArgValue> {
        self.keyword.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Positionals compare in order, keywords regardless of order
impl PartialEq for CallArgs {
    fn eq(&self, other: &Self) -> bool {
        self.positional == other.positional
            && self.keyword.len() == other.keyword.len()
            && self
                .keyword
                .iter()
                .all(|(k, v)| other.keyword(k) == Some(v))
    }
}

impl fmt::Display for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        write_items(f, &self.positional)?;
        for (i, (k, v)) in self.keyword.iter().enumerate() {
            if i > 0 || !self.positional.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        write!(f, ")")
    }
}

/// Float encoding that survives formats without NaN or infinity
mod float_repr {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() {
            serializer.serialize_str(if *value > 0.0 { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        deserializer.deserialize_any(FloatVisitor)
    }

    struct FloatVisitor;

    impl<'de> Visitor<'de> for FloatVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a number, \"NaN\", \"inf\" or \"-inf\"")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        fn visit_f32<E: de::Error>(self, v: f32) -> Result<f64, E> {
            Ok(f64::from(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            match v {
                "NaN" | "nan" => Ok(f64::NAN),
                "inf" | "Infinity" => Ok(f64::INFINITY),
                "-inf" | "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
            }
        }

        // Records written before non-finite floats were tagged hold `null`
        fn visit_unit<E: de::Error>(self) -> Result<f64, E> {
            Ok(f64::NAN)
        }
    }
}

// ---------------------------------------------------------------------------
// Serializer
// ---------------------------------------------------------------------------

struct ValueSerializer;

impl ser::Serializer for ValueSerializer {
    type Ok = ArgValue;
    type Error = ValueError;
    type SerializeSeq = SeqSerializer;
    type SerializeTuple = SeqSerializer;
    type SerializeTupleStruct = SeqSerializer;
    type SerializeTupleVariant = SeqSerializer;
    type SerializeMap = MapSerializer;
    type SerializeStruct = StructSerializer;
    type SerializeStructVariant = StructSerializer;

    fn serialize_bool(self, v: bool) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::from(v))
    }

    fn serialize_i16(self, v: i16) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::from(v))
    }

    fn serialize_i32(self, v: i32) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::from(v))
    }

    fn serialize_i64(self, v: i64) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::Int(v))
    }

    fn serialize_u8(self, v: u8) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::from(v))
    }

    fn serialize_u16(self, v: u16) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::from(v))
    }

    fn serialize_u32(self, v: u32) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::from(v))
    }

    fn serialize_u64(self, v: u64) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::from(v))
    }

    fn serialize_f32(self, v: f32) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::Float(v))
    }

    fn serialize_char(self, v: char) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::Str(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::Str(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::Bytes(v.to_vec()))
    }

    fn serialize_none(self) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::Null)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<ArgValue, ValueError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::Null)
    }

    fn serialize_unit_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::Variant {
            type_name: name.to_string(),
            variant: variant.to_string(),
            payload: None,
        })
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<ArgValue, ValueError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::Variant {
            type_name: name.to_string(),
            variant: variant.to_string(),
            payload: Some(Box::new(value.serialize(ValueSerializer)?)),
        })
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqSerializer, ValueError> {
        Ok(SeqSerializer::new(SeqShape::List, len.unwrap_or(0)))
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqSerializer, ValueError> {
        Ok(SeqSerializer::new(SeqShape::Tuple, len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqSerializer, ValueError> {
        Ok(SeqSerializer::new(SeqShape::Tuple, len))
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<SeqSerializer, ValueError> {
        Ok(SeqSerializer::new(SeqShape::Variant { name, variant }, len))
    }

    fn serialize_map(self, len: Option<usize>) -> Result<MapSerializer, ValueError> {
        Ok(MapSerializer {
            entries: Vec::with_capacity(len.unwrap_or(0)),
            pending_key: None,
        })
    }

    fn serialize_struct(self, name: &'static str, len: usize) -> Result<StructSerializer, ValueError> {
        Ok(StructSerializer {
            type_name: name,
            variant: None,
            fields: Vec::with_capacity(len),
        })
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<StructSerializer, ValueError> {
        Ok(StructSerializer {
            type_name: name,
            variant: Some(variant),
            fields: Vec::with_capacity(len),
        })
    }
}

enum SeqShape {
    List,
    Tuple,
    Variant {
        name: &'static str,
        variant: &'static str,
    },
}

struct SeqSerializer {
    shape: SeqShape,
    items: Vec<ArgValue>,
}

impl SeqSerializer {
    fn new(shape: SeqShape, capacity: usize) -> Self {
        Self {
            shape,
            items: Vec::with_capacity(capacity),
        }
    }

    fn push<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ValueError> {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn finish(self) -> ArgValue {
        match self.shape {
            SeqShape::List => ArgValue::List(self.items),
            SeqShape::Tuple => ArgValue::Tuple(self.items),
            SeqShape::Variant { name, variant } => ArgValue::Variant {
                type_name: name.to_string(),
                variant: variant.to_string(),
                payload: Some(Box::new(ArgValue::Tuple(self.items))),
            },
        }
    }
}

impl ser::SerializeSeq for SeqSerializer {
    type Ok = ArgValue;
    type Error = ValueError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ValueError> {
        self.push(value)
    }

    fn end(self) -> Result<ArgValue, ValueError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTuple for SeqSerializer {
    type Ok = ArgValue;
    type Error = ValueError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ValueError> {
        self.push(value)
    }

    fn end(self) -> Result<ArgValue, ValueError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleStruct for SeqSerializer {
    type Ok = ArgValue;
    type Error = ValueError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ValueError> {
        self.push(value)
    }

    fn end(self) -> Result<ArgValue, ValueError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleVariant for SeqSerializer {
    type Ok = ArgValue;
    type Error = ValueError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ValueError> {
        self.push(value)
    }

    fn end(self) -> Result<ArgValue, ValueError> {
        Ok(self.finish())
    }
}

struct MapSerializer {
    entries: Vec<(String, ArgValue)>,
    pending_key: Option<String>,
}

impl ser::SerializeMap for MapSerializer {
    type Ok = ArgValue;
    type Error = ValueError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), ValueError> {
        self.pending_key = Some(key.serialize(ValueSerializer)?.key_string());
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ValueError> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| ValueError::new("map value serialized before its key"))?;
        self.entries.push((key, value.serialize(ValueSerializer)?));
        Ok(())
    }

    fn end(self) -> Result<ArgValue, ValueError> {
        Ok(ArgValue::Map(self.entries))
    }
}

struct StructSerializer {
    type_name: &'static str,
    variant: Option<&'static str>,
    fields: Vec<(String, ArgValue)>,
}

impl StructSerializer {
    fn push<T: ?Sized + Serialize>(&mut self, key: &'static str, value: &T) -> Result<(), ValueError> {
        self.fields
            .push((key.to_string(), value.serialize(ValueSerializer)?));
        Ok(())
    }

    fn finish(self) -> ArgValue {
        match self.variant {
            None => ArgValue::Record {
                type_name: self.type_name.to_string(),
                fields: self.fields,
            },
            Some(variant) => ArgValue::Variant {
                type_name: self.type_name.to_string(),
                variant: variant.to_string(),
                payload: Some(Box::new(ArgValue::Record {
                    type_name: format!("{}::{}", self.type_name, variant),
                    fields: self.fields,
                })),
            },
        }
    }
}

impl ser::SerializeStruct for StructSerializer {
    type Ok = ArgValue;
    type Error = ValueError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), ValueError> {
        self.push(key, value)
    }

    fn end(self) -> Result<ArgValue, ValueError> {
        Ok(self.finish())
    }
}

impl ser::SerializeStructVariant for StructSerializer {
    type Ok = ArgValue;
    type Error = ValueError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), ValueError> {
        self.push(key, value)
    }

    fn end(self) -> Result<ArgValue, ValueError> {
        Ok(self.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Shape {
        Empty,
        Circle(f64),
        Rect { w: u32, h: u32 },
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _s: S) -> Result<S::Ok, S::Error> {
            Err(ser::Error::custom("handles cannot be serialized"))
        }
    }

    #[test]
    fn test_capture_primitives() {
        assert_eq!(ArgValue::capture(&5u8), ArgValue::Int(5));
        assert_eq!(ArgValue::capture(&-3i64), ArgValue::Int(-3));
        assert_eq!(ArgValue::capture(&u64::MAX), ArgValue::UInt(u64::MAX));
        assert_eq!(ArgValue::capture(&true), ArgValue::Bool(true));
        assert_eq!(ArgValue::capture("hi"), ArgValue::Str("hi".into()));
        assert_eq!(ArgValue::capture(&None::<i32>), ArgValue::Null);
        assert_eq!(ArgValue::capture(&Some(2)), ArgValue::Int(2));
    }

    #[test]
    fn test_capture_struct_keeps_type_name() {
        let v = ArgValue::capture(&Point { x: 1, y: 2 });
        assert_eq!(v.type_name(), "Point");
        match &v {
            ArgValue::Record { fields, .. } => {
                assert_eq!(fields[0], ("x".to_string(), ArgValue::Int(1)));
                assert_eq!(fields[1], ("y".to_string(), ArgValue::Int(2)));
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_capture_tuple_and_map() {
        assert_eq!(
            ArgValue::capture(&(1, "a")),
            ArgValue::Tuple(vec![ArgValue::Int(1), ArgValue::Str("a".into())])
        );
        let mut m = BTreeMap::new();
        m.insert(2, "two");
        m.insert(1, "one");
        assert_eq!(
            ArgValue::capture(&m),
            ArgValue::map([("1", "one".into()), ("2", "two".into())])
        );
    }

    #[test]
    fn test_enum_round_trip() {
        for shape in [Shape::Empty, Shape::Circle(1.5), Shape::Rect { w: 2, h: 3 }] {
            let v = ArgValue::capture(&shape);
            assert_eq!(v.type_name(), "Shape");
            let back: Shape = v.decode().unwrap();
            assert_eq!(back, shape);
        }
    }

    #[test]
    fn test_struct_round_trip() {
        let v = ArgValue::capture(&vec![Point { x: 1, y: 2 }, Point { x: 3, y: 4 }]);
        let back: Vec<Point> = v.decode().unwrap();
        assert_eq!(back, vec![Point { x: 1, y: 2 }, Point { x: 3, y: 4 }]);
    }

    #[test]
    fn test_unserializable_becomes_opaque() {
        let v = ArgValue::capture(&Unserializable);
        assert_eq!(
            v,
            ArgValue::Opaque {
                type_name: "Unserializable".to_string()
            }
        );
        assert_eq!(v.to_string(), "<UNSERIALIZABLE:Unserializable>");
        assert!(ArgValue::try_capture(&Unserializable).is_err());
    }

    #[test]
    fn test_short_type_name_strips_paths() {
        assert_eq!(short_type_name::<Point>(), "Point");
        assert_eq!(short_type_name::<Vec<i32>>(), "Vec<i32>");
    }

    #[test]
    fn test_display() {
        let v = ArgValue::capture(&(1, "x", vec![true]));
        assert_eq!(v.to_string(), "(1, 'x', [true])");
        assert_eq!(ArgValue::Tuple(vec![1.into()]).to_string(), "(1,)");
        assert_eq!(ArgValue::Float(3.0).to_string(), "3.0");
    }

    #[test]
    fn test_set_dedups() {
        let s = ArgValue::set([1.into(), 2.into(), 1.into()]);
        assert_eq!(s, ArgValue::Set(vec![1.into(), 2.into()]));
    }

    #[test]
    fn test_named_args_insert_preserves_position() {
        let mut args = NamedArgs::new();
        args.insert("a", 1.into());
        args.insert("b", 2.into());
        args.insert("a", 3.into());
        assert_eq!(args.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(args.get_as::<i32>("a"), Some(3));
    }

    #[test]
    fn test_call_args_keyword_order_insensitive() {
        let a = CallArgs::new().arg(1).kwarg("x", 2).kwarg("y", 3);
        let b = CallArgs::new().arg(1).kwarg("y", 3).kwarg("x", 2);
        let c = CallArgs::new().arg(1).kwarg("x", 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "(1, x=2, y=3)");
    }

    #[test]
    fn test_persisted_shape_round_trips() {
        let v = ArgValue::capture(&Shape::Rect { w: 1, h: 2 });
        let json = serde_json::to_string(&v).unwrap();
        let back: ArgValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_non_finite_floats_are_tagged() {
        let json = serde_json::to_string(&ArgValue::Float(f64::NEG_INFINITY)).unwrap();
        assert_eq!(json, r#"{"kind":"float","value":"-inf"}"#);
        let back: ArgValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ArgValue::Float(f64::NEG_INFINITY));

        let whole: ArgValue = serde_json::from_str(r#"{"kind":"float","value":2}"#).unwrap();
        assert_eq!(whole, ArgValue::Float(2.0));

        let legacy: ArgValue = serde_json::from_str(r#"{"kind":"float","value":null}"#).unwrap();
        assert!(matches!(legacy, ArgValue::Float(x) if x.is_nan()));
    }
}
