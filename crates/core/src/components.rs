//! Dynamic component payloads.
//!
//! The host engine stores free-form component tables. The sync layer carries
//! them as a tagged value tree keyed by component-type name, with an ordered
//! map so that serialization and hashing never depend on insertion order.

use glam::{Quat, Vec3};
use serde::de::{self, DeserializeSeed, EnumAccess, MapAccess, SeqAccess, VariantAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum nesting depth of a component value.
///
/// Deserialization fails past this depth, so a hostile payload cannot
/// exhaust the stack before limits are checked.
pub const MAX_VALUE_DEPTH: usize = 16;

/// Upper bound on capacity reserved from an untrusted length prefix.
const MAX_PREALLOC: usize = 256;

/// Ordered map of component-type name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentMap {
    components: BTreeMap<String, ComponentValue>,
}

impl ComponentMap {
    /// Create an empty component map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a component value.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: ComponentValue,
    ) -> Option<ComponentValue> {
        self.components.insert(name.into(), value)
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: ComponentValue) -> Self {
        self.insert(name, value);
        self
    }

    /// Get a component value.
    pub fn get(&self, name: &str) -> Option<&ComponentValue> {
        self.components.get(name)
    }

    /// Remove a component value.
    pub fn remove(&mut self, name: &str) -> Option<ComponentValue> {
        self.components.remove(name)
    }

    /// Returns true if a component with this name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    /// Iterate over components in deterministic key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ComponentValue)> {
        self.components.iter()
    }

    /// Component names in deterministic order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    /// Returns true if the map contains no components.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Number of stored components.
    pub fn len(&self) -> usize {
        self.components.len()
    }
}

impl IntoIterator for ComponentMap {
    type Item = (String, ComponentValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, ComponentValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.components.into_iter()
    }
}

impl FromIterator<(String, ComponentValue)> for ComponentMap {
    fn from_iter<I: IntoIterator<Item = (String, ComponentValue)>>(iter: I) -> Self {
        Self {
            components: iter.into_iter().collect(),
        }
    }
}

/// Tagged component value.
///
/// Vectors and rotations get dedicated variants so that transforms do not
/// round-trip through untyped lists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ComponentValue {
    /// Absent / nil value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// UTF-8 string value.
    Str(String),
    /// Three-component vector.
    Vec3([f32; 3]),
    /// Rotation quaternion stored as `[x, y, z, w]`.
    Quat([f32; 4]),
    /// Ordered list of values.
    List(Vec<ComponentValue>),
    /// Ordered map of values (string keys).
    Map(BTreeMap<String, ComponentValue>),
}

impl ComponentValue {
    /// Build a map value from `(key, value)` pairs.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, ComponentValue)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view; integers widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Vector view.
    pub fn as_vec3(&self) -> Option<Vec3> {
        match self {
            Self::Vec3(v) => Some(Vec3::from_array(*v)),
            _ => None,
        }
    }

    /// Quaternion view.
    pub fn as_quat(&self) -> Option<Quat> {
        match self {
            Self::Quat(v) => Some(Quat::from_array(*v)),
            _ => None,
        }
    }

    /// Map view.
    pub fn as_map(&self) -> Option<&BTreeMap<String, ComponentValue>> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Look up a field of a map value.
    pub fn field(&self, key: &str) -> Option<&ComponentValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Canonical hash of this value.
    ///
    /// Every variant is fed to the hasher with its own tag byte. Map keys are
    /// visited in sorted order, `-0.0` hashes as `0.0` and every NaN hashes
    /// the same, so two values that compare equal after a round trip through
    /// any codec hash identically.
    pub fn canonical_hash(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        self.feed(&mut hasher);
        let hash = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[0..8]);
        u64::from_le_bytes(bytes)
    }

    fn feed(&self, hasher: &mut blake3::Hasher) {
        match self {
            Self::Null => {
                hasher.update(&[0]);
            }
            Self::Bool(v) => {
                hasher.update(&[1, *v as u8]);
            }
            Self::Int(v) => {
                hasher.update(&[2]);
                hasher.update(&v.to_le_bytes());
            }
            Self::Float(v) => {
                hasher.update(&[3]);
                hasher.update(&canonical_f64(*v).to_le_bytes());
            }
            Self::Str(v) => {
                hasher.update(&[4]);
                hasher.update(&(v.len() as u64).to_le_bytes());
                hasher.update(v.as_bytes());
            }
            Self::Vec3(v) => {
                hasher.update(&[5]);
                for c in v {
                    hasher.update(&canonical_f32(*c).to_le_bytes());
                }
            }
            Self::Quat(v) => {
                hasher.update(&[6]);
                for c in v {
                    hasher.update(&canonical_f32(*c).to_le_bytes());
                }
            }
            Self::List(items) => {
                hasher.update(&[7]);
                hasher.update(&(items.len() as u64).to_le_bytes());
                for item in items {
                    item.feed(hasher);
                }
            }
            Self::Map(entries) => {
                hasher.update(&[8]);
                hasher.update(&(entries.len() as u64).to_le_bytes());
                for (key, value) in entries {
                    hasher.update(&(key.len() as u64).to_le_bytes());
                    hasher.update(key.as_bytes());
                    value.feed(hasher);
                }
            }
        }
    }
}

const VARIANTS: &[&str] = &[
    "Null", "Bool", "Int", "Float", "Str", "Vec3", "Quat", "List", "Map",
];

/// Variant tags, in declaration order of [`ComponentValue`].
#[derive(Deserialize)]
#[serde(variant_identifier)]
enum Tag {
    Null,
    Bool,
    Int,
    Float,
    Str,
    Vec3,
    Quat,
    List,
    Map,
}

impl<'de> Deserialize<'de> for ComponentValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        ValueSeed { depth: 0 }.deserialize(deserializer)
    }
}

/// Deserializes one value at a known nesting depth.
#[derive(Clone, Copy)]
struct ValueSeed {
    depth: usize,
}

impl ValueSeed {
    fn nested(self) -> Self {
        Self {
            depth: self.depth + 1,
        }
    }
}

impl<'de> DeserializeSeed<'de> for ValueSeed {
    type Value = ComponentValue;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        if self.depth > MAX_VALUE_DEPTH {
            return Err(de::Error::custom("component value nested too deeply"));
        }
        deserializer.deserialize_enum("ComponentValue", VARIANTS, self)
    }
}

impl<'de> Visitor<'de> for ValueSeed {
    type Value = ComponentValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a component value")
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<Self::Value, A::Error> {
        let (tag, variant) = data.variant::<Tag>()?;
        Ok(match tag {
            Tag::Null => {
                variant.unit_variant()?;
                ComponentValue::Null
            }
            Tag::Bool => ComponentValue::Bool(variant.newtype_variant()?),
            Tag::Int => ComponentValue::Int(variant.newtype_variant()?),
            Tag::Float => ComponentValue::Float(variant.newtype_variant()?),
            Tag::Str => ComponentValue::Str(variant.newtype_variant()?),
            Tag::Vec3 => ComponentValue::Vec3(variant.newtype_variant()?),
            Tag::Quat => ComponentValue::Quat(variant.newtype_variant()?),
            Tag::List => {
                ComponentValue::List(variant.newtype_variant_seed(ListSeed(self.nested()))?)
            }
            Tag::Map => {
                ComponentValue::Map(variant.newtype_variant_seed(MapSeed(self.nested()))?)
            }
        })
    }
}

struct ListSeed(ValueSeed);

impl<'de> DeserializeSeed<'de> for ListSeed {
    type Value = Vec<ComponentValue>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for ListSeed {
    type Value = Vec<ComponentValue>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a list of component values")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(MAX_PREALLOC));
        while let Some(item) = seq.next_element_seed(self.0)? {
            items.push(item);
        }
        Ok(items)
    }
}

struct MapSeed(ValueSeed);

impl<'de> DeserializeSeed<'de> for MapSeed {
    type Value = BTreeMap<String, ComponentValue>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for MapSeed {
    type Value = BTreeMap<String, ComponentValue>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of component values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some(key) = map.next_key::<String>()? {
            let value = map.next_value_seed(self.0)?;
            entries.insert(key, value);
        }
        Ok(entries)
    }
}

fn canonical_f64(v: f64) -> u64 {
    if v.is_nan() {
        f64::NAN.to_bits()
    } else if v == 0.0 {
        0
    } else {
        v.to_bits()
    }
}

fn canonical_f32(v: f32) -> u32 {
    if v.is_nan() {
        f32::NAN.to_bits()
    } else if v == 0.0 {
        0
    } else {
        v.to_bits()
    }
}

impl From<bool> for ComponentValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ComponentValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ComponentValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for ComponentValue {
    fn from(v: f32) -> Self {
        Self::Float(v as f64)
    }
}

impl From<&str> for ComponentValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ComponentValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec3> for ComponentValue {
    fn from(v: Vec3) -> Self {
        Self::Vec3(v.to_array())
    }
}

impl From<Quat> for ComponentValue {
    fn from(v: Quat) -> Self {
        Self::Quat(v.to_array())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_map_orders_keys() {
        let mut map = ComponentMap::new();
        map.insert("b", ComponentValue::Bool(true));
        map.insert("a", ComponentValue::Bool(false));

        let keys: Vec<_> = map.names().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn hash_ignores_map_insertion_order() {
        let mut first = BTreeMap::new();
        first.insert("hp".to_string(), ComponentValue::Int(10));
        first.insert("name".to_string(), ComponentValue::from("orc"));

        let mut second = BTreeMap::new();
        second.insert("name".to_string(), ComponentValue::from("orc"));
        second.insert("hp".to_string(), ComponentValue::Int(10));

        assert_eq!(
            ComponentValue::Map(first).canonical_hash(),
            ComponentValue::Map(second).canonical_hash()
        );
    }

    #[test]
    fn hash_distinguishes_variants_with_same_bits() {
        assert_ne!(
            ComponentValue::Int(1).canonical_hash(),
            ComponentValue::Bool(true).canonical_hash()
        );
        assert_ne!(
            ComponentValue::Float(1.0).canonical_hash(),
            ComponentValue::Int(1).canonical_hash()
        );
    }

    #[test]
    fn negative_zero_hashes_like_zero() {
        assert_eq!(
            ComponentValue::Float(-0.0).canonical_hash(),
            ComponentValue::Float(0.0).canonical_hash()
        );
        assert_eq!(
            ComponentValue::Vec3([-0.0, 1.0, 2.0]).canonical_hash(),
            ComponentValue::Vec3([0.0, 1.0, 2.0]).canonical_hash()
        );
    }

    #[test]
    fn hash_survives_json_round_trip() {
        let value = ComponentValue::map([
            ("position", ComponentValue::Vec3([1.5, 2.0, -3.25])),
            ("tags", ComponentValue::List(vec!["a".into(), "b".into()])),
            ("alive", ComponentValue::Bool(true)),
        ]);
        let json = serde_json::to_string(&value).expect("encode");
        let decoded: ComponentValue = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded, value);
        assert_eq!(decoded.canonical_hash(), value.canonical_hash());
    }

    fn nested_list(levels: usize) -> ComponentValue {
        let mut value = ComponentValue::Null;
        for _ in 0..levels {
            value = ComponentValue::List(vec![value]);
        }
        value
    }

    #[test]
    fn decoding_accepts_values_up_to_max_depth() {
        let value = ComponentValue::map([("deep", nested_list(MAX_VALUE_DEPTH - 1))]);
        let json = serde_json::to_string(&value).expect("encode");
        let decoded: ComponentValue = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn decoding_rejects_values_past_max_depth() {
        let json = serde_json::to_string(&nested_list(MAX_VALUE_DEPTH + 1)).expect("encode");
        let err = serde_json::from_str::<ComponentValue>(&json).expect_err("too deep");
        assert!(err.to_string().contains("nested too deeply"));
    }

    #[test]
    fn float_view_widens_integers() {
        assert_eq!(ComponentValue::Int(3).as_float(), Some(3.0));
        assert_eq!(ComponentValue::from("x").as_float(), None);
    }
}
