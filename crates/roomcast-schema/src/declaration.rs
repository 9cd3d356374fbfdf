//! Entity declarations: the pure-data description of a networked shape.
//!
//! Simulations describe the state they want synchronized with a small JSON
//! vocabulary. A bare literal is a primitive whose value is the default:
//!
//! ```text
//! 0                                   → number, default 0
//! ""                                  → string, default ""
//! false                               → boolean, default false
//! { "type": "vec3" }                  → { x, y, z } numbers
//! { "type": "object", "schema": { "name": "", "score": 0 } }
//! { "type": "map",    "schema": <item> }
//! { "type": "array",  "schema": <item> }
//! ```
//!
//! Declarations are values, so two structurally identical declarations
//! are the same declaration. The compiler memoizes on that identity.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::SchemaError;

/// Which kind of primitive a scalar holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Number,
    String,
    Boolean,
}

impl PrimitiveKind {
    /// Returns `true` if `value` is a JSON value of this kind.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::Number => value.is_number(),
            Self::String => value.is_string(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

/// A tagged declaration of a synchronized shape.
///
/// Object fields are kept in declaration order; that order is part of the
/// declaration's identity and of the synchronized JSON output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum EntityDeclaration {
    Number(f64),
    String(String),
    Boolean(bool),
    Vec2,
    Vec3,
    Object(Vec<(String, EntityDeclaration)>),
    Array(Box<EntityDeclaration>),
    Map(Box<EntityDeclaration>),
}

impl EntityDeclaration {
    /// Builds an object declaration from `(field, declaration)` pairs.
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, EntityDeclaration)>,
    {
        Self::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Builds a map declaration keyed by string.
    pub fn map(item: EntityDeclaration) -> Self {
        Self::Map(Box::new(item))
    }

    /// Builds a list declaration.
    pub fn array(item: EntityDeclaration) -> Self {
        Self::Array(Box::new(item))
    }

    /// Parses the JSON vocabulary described in the module docs.
    pub fn from_value(value: &Value) -> Result<Self, SchemaError> {
        match value {
            Value::Number(n) => Ok(Self::Number(n.as_f64().unwrap_or_default())),
            Value::String(s) => Ok(Self::String(s.clone())),
            Value::Bool(b) => Ok(Self::Boolean(*b)),
            Value::Object(obj) => {
                let tag = obj.get("type").and_then(Value::as_str).ok_or_else(|| {
                    SchemaError::InvalidDeclaration(format!(
                        "object declaration without a `type` tag: {value}"
                    ))
                })?;
                match tag {
                    "vec2" => Ok(Self::Vec2),
                    "vec3" => Ok(Self::Vec3),
                    "object" => {
                        let schema = schema_of(obj, tag)?.as_object().ok_or_else(|| {
                            SchemaError::InvalidDeclaration(
                                "`object` schema must be a map of fields".into(),
                            )
                        })?;
                        let fields = schema
                            .iter()
                            .map(|(name, decl)| Ok((name.clone(), Self::from_value(decl)?)))
                            .collect::<Result<Vec<_>, SchemaError>>()?;
                        Ok(Self::Object(fields))
                    }
                    "map" => Ok(Self::map(Self::from_value(schema_of(obj, tag)?)?)),
                    "array" => Ok(Self::array(Self::from_value(schema_of(obj, tag)?)?)),
                    other => Err(SchemaError::InvalidDeclaration(format!(
                        "unknown declaration type `{other}`"
                    ))),
                }
            }
            Value::Null | Value::Array(_) => Err(SchemaError::InvalidDeclaration(format!(
                "unsupported declaration literal: {value}"
            ))),
        }
    }

    /// Serializes back into the JSON vocabulary.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => json!(n),
            Self::String(s) => Value::String(s.clone()),
            Self::Boolean(b) => Value::Bool(*b),
            Self::Vec2 => json!({ "type": "vec2" }),
            Self::Vec3 => json!({ "type": "vec3" }),
            Self::Object(fields) => {
                let schema: Map<String, Value> = fields
                    .iter()
                    .map(|(name, decl)| (name.clone(), decl.to_value()))
                    .collect();
                json!({ "type": "object", "schema": schema })
            }
            Self::Array(item) => json!({ "type": "array", "schema": item.to_value() }),
            Self::Map(item) => json!({ "type": "map", "schema": item.to_value() }),
        }
    }

    /// The primitive kind, if this is a primitive declaration.
    pub fn primitive_kind(&self) -> Option<PrimitiveKind> {
        match self {
            Self::Number(_) => Some(PrimitiveKind::Number),
            Self::String(_) => Some(PrimitiveKind::String),
            Self::Boolean(_) => Some(PrimitiveKind::Boolean),
            _ => None,
        }
    }

    /// Leaves can be items of a map or array: primitives, vectors, objects.
    pub fn is_leaf(&self) -> bool {
        !matches!(self, Self::Array(_) | Self::Map(_))
    }

    /// Object records carry a network version assigned by the executor.
    pub fn is_versioned(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    /// Vectors are plain objects of numbers once compiled.
    pub(crate) fn expand_vector(&self) -> Option<EntityDeclaration> {
        let axes: &[&str] = match self {
            Self::Vec2 => &["x", "y"],
            Self::Vec3 => &["x", "y", "z"],
            _ => return None,
        };
        Some(Self::object(
            axes.iter().map(|axis| (*axis, EntityDeclaration::Number(0.0))),
        ))
    }
}

fn schema_of<'a>(obj: &'a Map<String, Value>, tag: &str) -> Result<&'a Value, SchemaError> {
    obj.get("schema").ok_or_else(|| {
        SchemaError::InvalidDeclaration(format!("`{tag}` declaration without a `schema`"))
    })
}

impl TryFrom<Value> for EntityDeclaration {
    type Error = SchemaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(&value)
    }
}

impl From<EntityDeclaration> for Value {
    fn from(decl: EntityDeclaration) -> Self {
        decl.to_value()
    }
}

// Declarations never hold NaN (JSON cannot express it), so bitwise number
// identity is consistent with `PartialEq`.
impl Eq for EntityDeclaration {}

impl Hash for EntityDeclaration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Number(n) => n.to_bits().hash(state),
            Self::String(s) => s.hash(state),
            Self::Boolean(b) => b.hash(state),
            Self::Vec2 | Self::Vec3 => {}
            Self::Object(fields) => {
                for (name, decl) in fields {
                    name.hash(state);
                    decl.hash(state);
                }
            }
            Self::Array(item) | Self::Map(item) => item.hash(state),
        }
    }
}
