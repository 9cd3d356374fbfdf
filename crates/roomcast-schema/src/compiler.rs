//! Compiles declarations into synchronized types.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::container::{SyncList, SyncMap, SyncObject, SyncScalar, SyncValue};
use crate::declaration::PrimitiveKind;
use crate::{EntityDeclaration, SchemaError};

/// How a compiled type is laid out.
#[derive(Debug)]
pub enum Shape {
    Primitive {
        kind: PrimitiveKind,
        default: Value,
    },
    Object {
        fields: Vec<(String, Arc<CompiledEntityType>)>,
    },
    Array {
        item: Arc<CompiledEntityType>,
    },
    Map {
        item: Arc<CompiledEntityType>,
    },
}

/// The result of compiling an [`EntityDeclaration`].
///
/// A compiled type is a constructor ([`create`](Self::create)) plus an
/// assignment rule ([`assign`](Self::assign)) that writes raw JSON into a
/// container it created. Assigning the same raw input twice never bumps a
/// version.
#[derive(Debug)]
pub struct CompiledEntityType {
    declaration: EntityDeclaration,
    shape: Shape,
}

impl CompiledEntityType {
    pub fn declaration(&self) -> &EntityDeclaration {
        &self.declaration
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Object records carry the executor's `_netVersion`.
    pub fn is_versioned(&self) -> bool {
        self.declaration.is_versioned()
    }

    /// Builds a fresh container holding the declared defaults.
    pub fn create(&self) -> SyncValue {
        match &self.shape {
            Shape::Primitive { default, .. } => SyncValue::Scalar(SyncScalar::new(default.clone())),
            Shape::Object { fields } => SyncValue::Object(SyncObject::new(
                fields
                    .iter()
                    .map(|(name, ty)| (name.clone(), ty.create()))
                    .collect(),
            )),
            Shape::Array { .. } => SyncValue::List(SyncList::default()),
            Shape::Map { .. } => SyncValue::Map(SyncMap::default()),
        }
    }

    /// Writes `raw` into `current`. Returns `true` if anything changed.
    ///
    /// `null` leaves primitives and objects untouched and empties
    /// collections. Input of the wrong JSON type is logged and ignored.
    pub fn assign(&self, current: &mut SyncValue, raw: &Value) -> bool {
        match (&self.shape, current) {
            (Shape::Primitive { kind, .. }, SyncValue::Scalar(scalar)) => {
                if raw.is_null() {
                    return false;
                }
                if !kind.matches(raw) {
                    tracing::warn!(expected = ?kind, %raw, "ignoring primitive of the wrong type");
                    return false;
                }
                scalar.replace(raw)
            }
            (Shape::Object { fields }, SyncValue::Object(object)) => {
                assign_object(fields, object, raw)
            }
            (Shape::Array { item }, SyncValue::List(list)) => assign_list(item, list, raw),
            (Shape::Map { item }, SyncValue::Map(map)) => assign_map(item, map, raw),
            (shape, current) => {
                tracing::warn!(?shape, version = current.version(), "container does not match its type");
                false
            }
        }
    }

    /// Assigns a single field of an object container.
    ///
    /// # Errors
    /// Returns [`SchemaError::UnknownField`] if this is not an object type
    /// or the field was never declared.
    pub fn assign_field(
        &self,
        current: &mut SyncValue,
        field: &str,
        raw: &Value,
    ) -> Result<bool, SchemaError> {
        let (Shape::Object { fields }, SyncValue::Object(object)) = (&self.shape, current) else {
            return Err(SchemaError::UnknownField(field.to_string()));
        };
        let ty = fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, ty)| ty)
            .ok_or_else(|| SchemaError::UnknownField(field.to_string()))?;

        let changed = set_field(object, field, ty, raw);
        if changed {
            object.last_raw = None;
            object.version += 1;
        }
        Ok(changed)
    }
}

fn set_field(object: &mut SyncObject, name: &str, ty: &CompiledEntityType, raw: &Value) -> bool {
    if object.raw_cache.get(name) == Some(raw) {
        return false;
    }
    object.raw_cache.insert(name.to_string(), raw.clone());
    match object.fields.get_mut(name) {
        Some(container) => ty.assign(container, raw),
        None => false,
    }
}

fn assign_object(
    fields: &[(String, Arc<CompiledEntityType>)],
    object: &mut SyncObject,
    raw: &Value,
) -> bool {
    if object.last_raw.as_ref() == Some(raw) {
        return false;
    }
    let Some(input) = raw.as_object() else {
        if !raw.is_null() {
            tracing::warn!(%raw, "ignoring non-object input for object type");
        }
        return false;
    };

    let mut changed = false;
    for (name, ty) in fields {
        // Absent fields keep their current value.
        if let Some(field_raw) = input.get(name) {
            changed |= set_field(object, name, ty, field_raw);
        }
    }
    if let Some(net_version) = input.get("_netVersion").and_then(Value::as_u64) {
        object.net_version = Some(net_version);
    }
    object.last_raw = Some(raw.clone());
    if changed {
        object.version += 1;
    }
    changed
}

fn assign_list(item: &CompiledEntityType, list: &mut SyncList, raw: &Value) -> bool {
    if list.last_raw.as_ref() == Some(raw) {
        return false;
    }
    let input: &[Value] = match raw {
        Value::Array(items) => items,
        Value::Null => &[],
        other => {
            tracing::warn!(raw = %other, "ignoring non-array input for array type");
            return false;
        }
    };

    let mut changed = input.len() != list.items.len();
    list.items.truncate(input.len());
    for (index, item_raw) in input.iter().enumerate() {
        if index == list.items.len() {
            list.items.push(item.create());
        }
        changed |= item.assign(&mut list.items[index], item_raw);
    }
    list.last_raw = Some(raw.clone());
    if changed {
        list.version += 1;
    }
    changed
}

fn assign_map(item: &CompiledEntityType, map: &mut SyncMap, raw: &Value) -> bool {
    if map.last_raw.as_ref() == Some(raw) {
        return false;
    }
    let empty = Map::new();
    let input = match raw {
        Value::Object(entries) => entries,
        Value::Null => &empty,
        other => {
            tracing::warn!(raw = %other, "ignoring non-object input for map type");
            return false;
        }
    };

    let before = map.entries.len();
    map.entries.retain(|key, _| input.contains_key(key));
    let mut changed = map.entries.len() != before;

    for (key, item_raw) in input {
        if !map.entries.contains_key(key) {
            map.entries.insert(key.clone(), item.create());
            changed = true;
        }
        if let Some(container) = map.entries.get_mut(key) {
            changed |= item.assign(container, item_raw);
        }
    }
    map.last_raw = Some(raw.clone());
    if changed {
        map.version += 1;
    }
    changed
}

/// Memoizing compiler from declarations to [`CompiledEntityType`]s.
///
/// Structurally equal declarations compile once and share the result.
#[derive(Debug, Default)]
pub struct SchemaCompiler {
    cache: HashMap<EntityDeclaration, Arc<CompiledEntityType>>,
}

impl SchemaCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles `decl`, reusing a cached result when one exists.
    ///
    /// # Errors
    /// Returns [`SchemaError::NestedCollection`] when a map or array holds
    /// another collection.
    pub fn compile(
        &mut self,
        decl: &EntityDeclaration,
    ) -> Result<Arc<CompiledEntityType>, SchemaError> {
        if let Some(hit) = self.cache.get(decl) {
            return Ok(Arc::clone(hit));
        }

        let shape = match decl {
            EntityDeclaration::Number(_)
            | EntityDeclaration::String(_)
            | EntityDeclaration::Boolean(_) => Shape::Primitive {
                kind: decl
                    .primitive_kind()
                    .ok_or_else(|| SchemaError::InvalidDeclaration(format!("{decl:?}")))?,
                default: decl.to_value(),
            },
            EntityDeclaration::Vec2 | EntityDeclaration::Vec3 => {
                let expanded = decl
                    .expand_vector()
                    .ok_or_else(|| SchemaError::InvalidDeclaration(format!("{decl:?}")))?;
                self.object_shape(&expanded)?
            }
            EntityDeclaration::Object(_) => self.object_shape(decl)?,
            EntityDeclaration::Array(item) => Shape::Array {
                item: self.compile_item(item, "array")?,
            },
            EntityDeclaration::Map(item) => Shape::Map {
                item: self.compile_item(item, "map")?,
            },
        };

        let compiled = Arc::new(CompiledEntityType {
            declaration: decl.clone(),
            shape,
        });
        self.cache.insert(decl.clone(), Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Number of distinct declarations compiled so far.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn object_shape(&mut self, decl: &EntityDeclaration) -> Result<Shape, SchemaError> {
        let EntityDeclaration::Object(fields) = decl else {
            return Err(SchemaError::InvalidDeclaration(format!("{decl:?}")));
        };
        let fields = fields
            .iter()
            .map(|(name, field)| Ok((name.clone(), self.compile(field)?)))
            .collect::<Result<Vec<_>, SchemaError>>()?;
        Ok(Shape::Object { fields })
    }

    fn compile_item(
        &mut self,
        item: &EntityDeclaration,
        container: &'static str,
    ) -> Result<Arc<CompiledEntityType>, SchemaError> {
        if !item.is_leaf() {
            return Err(SchemaError::NestedCollection { container });
        }
        self.compile(item)
    }
}
