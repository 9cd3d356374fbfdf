//! Per-room table of entity kinds.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::{CompiledEntityType, EntityDeclaration, SchemaCompiler, SchemaError};

/// Maps entity-kind names to their compiled types.
///
/// The registry is filled while a room is being set up, from the
/// declarations the executor reports on load. After that it is shared
/// read-only behind an `Arc`, so nothing can register a kind mid-game.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    compiler: SchemaCompiler,
    kinds: IndexMap<String, Arc<CompiledEntityType>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `kind` under `decl`.
    ///
    /// Registering the same declaration again is a no-op that returns the
    /// existing compiled type.
    ///
    /// # Errors
    /// - [`SchemaError::Conflict`] if `kind` exists with another declaration.
    /// - Any compile error for `decl`.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        decl: &EntityDeclaration,
    ) -> Result<Arc<CompiledEntityType>, SchemaError> {
        let kind = kind.into();
        if let Some(existing) = self.kinds.get(&kind) {
            if existing.declaration() == decl {
                return Ok(Arc::clone(existing));
            }
            return Err(SchemaError::Conflict(kind));
        }

        let compiled = self.compiler.compile(decl)?;
        tracing::debug!(%kind, versioned = compiled.is_versioned(), "entity kind registered");
        self.kinds.insert(kind, Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Registers every `(kind, declaration)` pair, stopping at the first error.
    pub fn register_all<'a, I>(&mut self, entries: I) -> Result<(), SchemaError>
    where
        I: IntoIterator<Item = (&'a str, &'a EntityDeclaration)>,
    {
        for (kind, decl) in entries {
            self.register(kind, decl)?;
        }
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<CompiledEntityType>> {
        self.kinds.get(kind)
    }

    /// Returns `true` if the kind's records carry a network version.
    pub fn is_versioned(&self, kind: &str) -> bool {
        self.kinds.get(kind).is_some_and(|ty| ty.is_versioned())
    }

    /// Registered kind names, in registration order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
