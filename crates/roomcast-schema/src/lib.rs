//! Networked-state schema for Roomcast.
//!
//! Simulations declare the shape of the state they want synchronized; this
//! crate turns those declarations into containers that remember what they
//! last saw, so re-applying identical input is free and never bumps a
//! version.
//!
//! # Key types
//!
//! - [`EntityDeclaration`]: pure-data description of a shape
//! - [`SchemaCompiler`]: memoizing compiler to [`CompiledEntityType`]
//! - [`SyncValue`]: the diffable containers
//! - [`EntityRegistry`]: `kind → compiled type` for one room
//! - [`EntityStore`]: the records of every kind, with patch tracking
//!
//! ```text
//! EntityDeclaration ──compile──▶ CompiledEntityType ──create──▶ SyncValue
//!                                        │                          ▲
//!                                        └────────assign(raw)───────┘
//! ```

mod compiler;
mod container;
mod declaration;
mod error;
mod registry;
mod store;

pub use compiler::{CompiledEntityType, SchemaCompiler, Shape};
pub use container::{SyncList, SyncMap, SyncObject, SyncScalar, SyncValue};
pub use declaration::{EntityDeclaration, PrimitiveKind};
pub use error::SchemaError;
pub use registry::EntityRegistry;
pub use store::{EntityPatch, EntityStore};
