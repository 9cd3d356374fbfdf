//! Integration tests for entity registration and record storage.

use std::sync::Arc;

use roomcast_schema::{EntityDeclaration, EntityRegistry, EntityStore, SchemaError};
use serde_json::{Value, json};

/// Registers a single `Entity` kind from its JSON declaration.
fn store_with(decl: Value) -> EntityStore {
    let decl = EntityDeclaration::from_value(&decl).unwrap();
    let mut registry = EntityRegistry::new();
    registry.register("Entity", &decl).unwrap();
    EntityStore::new(Arc::new(registry))
}

// ---------------------------------------------------------------------------
// Primitive kinds
// ---------------------------------------------------------------------------

#[test]
fn test_register_number_kind() {
    let mut store = store_with(json!(3));
    assert_eq!(store.kinds().collect::<Vec<_>>(), ["Entity"]);

    store.set("Entity", "e1", &json!(10)).unwrap();
    assert_eq!(store.entity("Entity", "e1"), Some(json!(10)));
}

#[test]
fn test_register_string_kind() {
    let mut store = store_with(json!(""));
    store.set("Entity", "e1", &json!("hello")).unwrap();
    assert_eq!(store.entity("Entity", "e1"), Some(json!("hello")));
}

#[test]
fn test_register_boolean_kind() {
    let mut store = store_with(json!(false));
    store.set("Entity", "e1", &json!(true)).unwrap();
    assert_eq!(store.entity("Entity", "e1"), Some(json!(true)));
}

// ---------------------------------------------------------------------------
// Composite kinds
// ---------------------------------------------------------------------------

#[test]
fn test_register_nested_object_kind() {
    let mut store = store_with(json!({
        "type": "object",
        "schema": { "name": "", "score": { "type": "object", "schema": { "val": 0 } } }
    }));

    let raw = json!({ "name": "sossou", "score": { "val": 10 } });
    store.set("Entity", "e1", &raw).unwrap();
    assert_eq!(store.entity("Entity", "e1"), Some(raw));
}

#[test]
fn test_register_map_kind() {
    let mut store = store_with(json!({ "type": "map", "schema": 0 }));
    store.set("Entity", "e1", &json!({ "k1": 10, "k2": 20 })).unwrap();
    assert_eq!(store.entity("Entity", "e1"), Some(json!({ "k1": 10, "k2": 20 })));
}

#[test]
fn test_register_array_kind_grows() {
    let mut store = store_with(json!({ "type": "array", "schema": 0 }));

    store.set("Entity", "e1", &json!([10, 20])).unwrap();
    assert_eq!(store.entity("Entity", "e1"), Some(json!([10, 20])));

    store.set("Entity", "e1", &json!([10, 20, 30, 40])).unwrap();
    assert_eq!(store.entity("Entity", "e1"), Some(json!([10, 20, 30, 40])));
}

#[test]
fn test_register_map_of_objects_kind() {
    let mut store = store_with(json!({
        "type": "object",
        "schema": {
            "num": 0,
            "scores": {
                "type": "map",
                "schema": { "type": "object", "schema": { "name": "", "val": 0 } }
            }
        }
    }));

    let raw = json!({
        "num": 10,
        "scores": {
            "p1": { "name": "luffy", "val": 100 },
            "p2": { "name": "kaidu", "val": 200 }
        }
    });
    store.set("Entity", "e1", &raw).unwrap();
    assert_eq!(store.entity("Entity", "e1"), Some(raw));
}

// ---------------------------------------------------------------------------
// Registration rules
// ---------------------------------------------------------------------------

#[test]
fn test_register_same_declaration_twice_is_idempotent() {
    let mut registry = EntityRegistry::new();
    let decl = EntityDeclaration::Number(0.0);

    let first = registry.register("Entity", &decl).unwrap();
    let second = registry.register("Entity", &decl).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_register_conflicting_declaration_fails() {
    let mut registry = EntityRegistry::new();
    registry
        .register("Entity", &EntityDeclaration::Number(0.0))
        .unwrap();

    let err = registry
        .register("Entity", &EntityDeclaration::String(String::new()))
        .unwrap_err();
    assert_eq!(err, SchemaError::Conflict("Entity".into()));
}

#[test]
fn test_register_nested_collection_fails() {
    let mut registry = EntityRegistry::new();
    let decl = EntityDeclaration::from_value(&json!({
        "type": "map",
        "schema": { "type": "array", "schema": 0 }
    }))
    .unwrap();

    assert!(matches!(
        registry.register("Entity", &decl),
        Err(SchemaError::NestedCollection { .. })
    ));
    assert!(registry.is_empty());
}

#[test]
fn test_is_versioned_only_for_objects() {
    let mut registry = EntityRegistry::new();
    registry
        .register_all([
            ("score", &EntityDeclaration::Number(0.0)),
            (
                "player",
                &EntityDeclaration::object([("hp", EntityDeclaration::Number(0.0))]),
            ),
        ])
        .unwrap();

    assert!(!registry.is_versioned("score"));
    assert!(registry.is_versioned("player"));
    assert!(!registry.is_versioned("missing"));
}

// ---------------------------------------------------------------------------
// Idempotent patch application
// ---------------------------------------------------------------------------

#[test]
fn test_map_of_object_same_input_twice_bumps_version_once() {
    let decl = EntityDeclaration::from_value(&json!({
        "type": "map",
        "schema": { "type": "object", "schema": { "name": "", "val": 0 } }
    }))
    .unwrap();
    let mut registry = EntityRegistry::new();
    let ty = registry.register("scores", &decl).unwrap();

    let mut value = ty.create();
    let raw = json!({ "p1": { "name": "luffy", "val": 1 } });

    assert!(ty.assign(&mut value, &raw));
    assert!(!ty.assign(&mut value, &raw));
    assert_eq!(value.version(), 1);

    // A structurally equal but freshly built input is still a no-op.
    assert!(!ty.assign(&mut value, &json!({ "p1": { "name": "luffy", "val": 1 } })));
    assert_eq!(value.version(), 1);
}

#[test]
fn test_replayed_batch_is_noop() {
    let mut store = store_with(json!({ "type": "object", "schema": { "val": 0 } }));

    assert!(store.apply("Entity", "e1", 3, &json!({ "val": 5 })).unwrap());
    store.take_patch();

    assert!(!store.apply("Entity", "e1", 3, &json!({ "val": 5 })).unwrap());
    assert!(store.take_patch().is_empty());
    assert_eq!(
        store.entity("Entity", "e1"),
        Some(json!({ "val": 5, "_netVersion": 3 }))
    );
}
