//! Entity values and the typed-property transform
//!
//! Entities arrive as plain key/value records (task options, JSON files,
//! query results). Before they reach the table service every field except the
//! two keys is tagged with an EDM type; `unwrap_entity` reverses the tagging.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use thiserror::Error;

pub const PARTITION_KEY: &str = "PartitionKey";
pub const ROW_KEY: &str = "RowKey";
pub const TIMESTAMP: &str = "Timestamp";

const INT32_MAX: f64 = 2147483647.0;
// 2^63, first float that no longer fits an i64
const INT64_LIMIT: f64 = 9223372036854775808.0;

lazy_static! {
    static ref GUID_PATTERN: Regex = Regex::new(
        r"^[A-Za-z0-9]{8}-[A-Za-z0-9]{4}-[A-Za-z0-9]{4}-[A-Za-z0-9]{4}-[A-Za-z0-9]{12}$"
    )
    .expect("valid guid pattern");
}

/// Errors raised while turning a plain record into a typed entity.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EntityError {
    #[error("entity is missing required key {0}")]
    MissingKey(&'static str),

    #[error("entity key {0} must be a scalar value")]
    InvalidKey(&'static str),

    #[error("property {name} must be an array of bytes (0-255)")]
    InvalidBinary { name: String },

    #[error("entity must be a JSON object, got: {0}")]
    NotAnObject(String),
}

/// A plain, untyped field value.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    DateTime(DateTime<Utc>),
    String(String),
    Array(Vec<EntityValue>),
    Object(BTreeMap<String, EntityValue>),
}

/// A plain record: field name to value, `PartitionKey` and `RowKey` included.
pub type Entity = BTreeMap<String, EntityValue>;

impl From<Value> for EntityValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => EntityValue::Null,
            Value::Bool(b) => EntityValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => EntityValue::Integer(i),
                None => n.as_f64().map(EntityValue::Float).unwrap_or(EntityValue::Null),
            },
            Value::String(s) => EntityValue::String(s),
            Value::Array(items) => EntityValue::Array(items.into_iter().map(EntityValue::from).collect()),
            Value::Object(map) => EntityValue::Object(
                map.into_iter().map(|(k, v)| (k, EntityValue::from(v))).collect(),
            ),
        }
    }
}

impl From<&str> for EntityValue {
    fn from(value: &str) -> Self {
        EntityValue::String(value.to_string())
    }
}

impl From<i64> for EntityValue {
    fn from(value: i64) -> Self {
        EntityValue::Integer(value)
    }
}

impl From<f64> for EntityValue {
    fn from(value: f64) -> Self {
        EntityValue::Float(value)
    }
}

impl From<bool> for EntityValue {
    fn from(value: bool) -> Self {
        EntityValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for EntityValue {
    fn from(value: DateTime<Utc>) -> Self {
        EntityValue::DateTime(value)
    }
}

impl EntityValue {
    /// JSON rendering; dates become RFC 3339 strings.
    pub fn to_json(&self) -> Value {
        match self {
            EntityValue::Null => Value::Null,
            EntityValue::Bool(b) => Value::Bool(*b),
            EntityValue::Integer(i) => Value::Number((*i).into()),
            EntityValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            EntityValue::DateTime(dt) => Value::String(format_datetime(dt)),
            EntityValue::String(s) => Value::String(s.clone()),
            EntityValue::Array(items) => Value::Array(items.iter().map(EntityValue::to_json).collect()),
            EntityValue::Object(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect::<Map<_, _>>(),
            ),
        }
    }
}

impl Serialize for EntityValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EntityValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(EntityValue::from)
    }
}

/// Builds an entity from a JSON object.
pub fn entity_from_json(value: Value) -> Result<Entity, EntityError> {
    match value {
        Value::Object(map) => Ok(map.into_iter().map(|(k, v)| (k, EntityValue::from(v))).collect()),
        other => Err(EntityError::NotAnObject(other.to_string())),
    }
}

pub fn entity_to_json(entity: &Entity) -> Value {
    Value::Object(entity.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

/// Storage type tag of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdmType {
    String,
    Int32,
    Int64,
    Double,
    Boolean,
    DateTime,
    Guid,
    Binary,
}

impl EdmType {
    pub fn edm_name(&self) -> &'static str {
        match self {
            EdmType::String => "Edm.String",
            EdmType::Int32 => "Edm.Int32",
            EdmType::Int64 => "Edm.Int64",
            EdmType::Double => "Edm.Double",
            EdmType::Boolean => "Edm.Boolean",
            EdmType::DateTime => "Edm.DateTime",
            EdmType::Guid => "Edm.Guid",
            EdmType::Binary => "Edm.Binary",
        }
    }

    pub fn from_edm_name(name: &str) -> Option<Self> {
        Some(match name {
            "Edm.String" => EdmType::String,
            "Edm.Int32" => EdmType::Int32,
            "Edm.Int64" => EdmType::Int64,
            "Edm.Double" => EdmType::Double,
            "Edm.Boolean" => EdmType::Boolean,
            "Edm.DateTime" => EdmType::DateTime,
            "Edm.Guid" => EdmType::Guid,
            "Edm.Binary" => EdmType::Binary,
            _ => return None,
        })
    }
}

/// A typed property value: the variant is the type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityProperty {
    String(String),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Guid(String),
    Binary(Vec<u8>),
}

impl EntityProperty {
    pub fn edm_type(&self) -> EdmType {
        match self {
            EntityProperty::String(_) => EdmType::String,
            EntityProperty::Int32(_) => EdmType::Int32,
            EntityProperty::Int64(_) => EdmType::Int64,
            EntityProperty::Double(_) => EdmType::Double,
            EntityProperty::Boolean(_) => EdmType::Boolean,
            EntityProperty::DateTime(_) => EdmType::DateTime,
            EntityProperty::Guid(_) => EdmType::Guid,
            EntityProperty::Binary(_) => EdmType::Binary,
        }
    }

    /// Drops the type tag.
    pub fn unwrap_value(&self) -> EntityValue {
        match self {
            EntityProperty::String(s) | EntityProperty::Guid(s) => EntityValue::String(s.clone()),
            EntityProperty::Int32(i) => EntityValue::Integer(*i as i64),
            EntityProperty::Int64(i) => EntityValue::Integer(*i),
            EntityProperty::Double(f) => EntityValue::Float(*f),
            EntityProperty::Boolean(b) => EntityValue::Bool(*b),
            EntityProperty::DateTime(dt) => EntityValue::DateTime(*dt),
            EntityProperty::Binary(bytes) => EntityValue::String(BASE64.encode(bytes)),
        }
    }

    /// Service-native `{"_": value, "$": "Edm.Type"}` form.
    ///
    /// Int64 values travel as strings, binary values as base64.
    pub fn to_raw_json(&self) -> Value {
        let value = match self {
            EntityProperty::Int64(i) => Value::String(i.to_string()),
            other => other.unwrap_value().to_json(),
        };
        let mut map = Map::new();
        map.insert("_".to_string(), value);
        map.insert("$".to_string(), Value::String(self.edm_type().edm_name().to_string()));
        Value::Object(map)
    }

    /// Parses the form produced by `to_raw_json`. Returns None on malformed input.
    pub fn from_raw_json(raw: &Value) -> Option<Self> {
        let edm = raw.get("$").and_then(Value::as_str).and_then(EdmType::from_edm_name)?;
        let value = raw.get("_")?;
        Some(match edm {
            EdmType::String => EntityProperty::String(value.as_str()?.to_string()),
            EdmType::Guid => EntityProperty::Guid(value.as_str()?.to_string()),
            EdmType::Int32 => EntityProperty::Int32(i32::try_from(value.as_i64()?).ok()?),
            EdmType::Int64 => match value {
                Value::String(s) => EntityProperty::Int64(s.parse().ok()?),
                other => EntityProperty::Int64(other.as_i64()?),
            },
            EdmType::Double => EntityProperty::Double(value.as_f64()?),
            EdmType::Boolean => EntityProperty::Boolean(value.as_bool()?),
            EdmType::DateTime => EntityProperty::DateTime(parse_datetime(value.as_str()?)?),
            EdmType::Binary => EntityProperty::Binary(BASE64.decode(value.as_str()?).ok()?),
        })
    }
}

/// An entity as the table service sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedEntity {
    pub partition_key: String,
    pub row_key: String,
    pub properties: BTreeMap<String, EntityProperty>,
    /// Maintained by the service on every write.
    pub timestamp: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

impl TypedEntity {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            properties: BTreeMap::new(),
            timestamp: None,
            etag: None,
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: EntityProperty) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Looks up a field, keys and `Timestamp` included.
    pub fn property(&self, name: &str) -> Option<EntityProperty> {
        match name {
            PARTITION_KEY => Some(EntityProperty::String(self.partition_key.clone())),
            ROW_KEY => Some(EntityProperty::String(self.row_key.clone())),
            TIMESTAMP if self.timestamp.is_some() => self.timestamp.map(EntityProperty::DateTime),
            _ => self.properties.get(name).cloned(),
        }
    }

    /// Service-native record, as returned by a raw query.
    pub fn to_raw_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(PARTITION_KEY.to_string(), key_json(&self.partition_key));
        map.insert(ROW_KEY.to_string(), key_json(&self.row_key));
        if let Some(ts) = &self.timestamp {
            map.insert(TIMESTAMP.to_string(), EntityProperty::DateTime(*ts).to_raw_json());
        }
        for (name, property) in &self.properties {
            map.insert(name.clone(), property.to_raw_json());
        }
        if let Some(etag) = &self.etag {
            let mut metadata = Map::new();
            metadata.insert("etag".to_string(), Value::String(etag.clone()));
            map.insert(".metadata".to_string(), Value::Object(metadata));
        }
        Value::Object(map)
    }
}

fn key_json(key: &str) -> Value {
    let mut map = Map::new();
    map.insert("_".to_string(), Value::String(key.to_string()));
    Value::Object(map)
}

pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

/// Reads a reserved key as an opaque string.
pub fn key_value(entity: &Entity, key: &'static str) -> Result<String, EntityError> {
    match entity.get(key) {
        None | Some(EntityValue::Null) => Err(EntityError::MissingKey(key)),
        Some(EntityValue::String(s)) => Ok(s.clone()),
        Some(EntityValue::Integer(i)) => Ok(i.to_string()),
        Some(EntityValue::Float(f)) => Ok(f.to_string()),
        Some(EntityValue::Bool(b)) => Ok(b.to_string()),
        Some(EntityValue::DateTime(dt)) => Ok(format_datetime(dt)),
        Some(EntityValue::Array(_)) | Some(EntityValue::Object(_)) => Err(EntityError::InvalidKey(key)),
    }
}

/// Tags every non-key field of `entity`.
pub fn transform_entity(entity: &Entity) -> Result<TypedEntity, EntityError> {
    let mut typed = TypedEntity::new(key_value(entity, PARTITION_KEY)?, key_value(entity, ROW_KEY)?);
    for (name, value) in entity {
        if name == PARTITION_KEY || name == ROW_KEY {
            continue;
        }
        typed.properties.insert(name.clone(), classify(name, value)?);
    }
    Ok(typed)
}

/// Picks the type tag of one value. Match arm order is the inference priority.
pub fn classify(name: &str, value: &EntityValue) -> Result<EntityProperty, EntityError> {
    Ok(match value {
        EntityValue::Integer(i) => integer_property(*i),
        EntityValue::Float(f) if f.is_finite() && f.fract() == 0.0 => {
            if f.abs() <= INT32_MAX {
                EntityProperty::Int32(*f as i32)
            } else if f.abs() < INT64_LIMIT {
                EntityProperty::Int64(*f as i64)
            } else {
                EntityProperty::Double(*f)
            }
        }
        EntityValue::Float(f) => EntityProperty::Double(*f),
        EntityValue::Bool(b) => EntityProperty::Boolean(*b),
        EntityValue::DateTime(dt) => EntityProperty::DateTime(*dt),
        EntityValue::String(s) if GUID_PATTERN.is_match(s) => EntityProperty::Guid(s.clone()),
        EntityValue::Array(items) => EntityProperty::Binary(to_bytes(name, items)?),
        EntityValue::String(s) => EntityProperty::String(s.clone()),
        other @ (EntityValue::Null | EntityValue::Object(_)) => {
            EntityProperty::String(other.to_json().to_string())
        }
    })
}

fn integer_property(i: i64) -> EntityProperty {
    if i.unsigned_abs() <= INT32_MAX as u64 {
        EntityProperty::Int32(i as i32)
    } else {
        EntityProperty::Int64(i)
    }
}

fn to_bytes(name: &str, items: &[EntityValue]) -> Result<Vec<u8>, EntityError> {
    items
        .iter()
        .map(|item| match item {
            EntityValue::Integer(i) => u8::try_from(*i).ok(),
            _ => None,
        })
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| EntityError::InvalidBinary { name: name.to_string() })
}

/// Inverse of `transform_entity`: every tag is dropped.
pub fn unwrap_entity(typed: &TypedEntity) -> Entity {
    let mut entity = Entity::new();
    entity.insert(PARTITION_KEY.to_string(), EntityValue::String(typed.partition_key.clone()));
    entity.insert(ROW_KEY.to_string(), EntityValue::String(typed.row_key.clone()));
    if let Some(ts) = typed.timestamp {
        entity.insert(TIMESTAMP.to_string(), EntityValue::DateTime(ts));
    }
    for (name, property) in &typed.properties {
        entity.insert(name.clone(), property.unwrap_value());
    }
    entity
}
