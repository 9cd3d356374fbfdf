//! Error types for the schema layer.

/// Errors raised while compiling declarations or writing synchronized state.
///
/// These are configuration errors: they surface while a room is being set
/// up (a simulation registering an impossible shape) or when a caller
/// addresses a kind/field that was never declared.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// The raw declaration could not be parsed into an [`EntityDeclaration`].
    ///
    /// [`EntityDeclaration`]: crate::EntityDeclaration
    #[error("invalid entity declaration: {0}")]
    InvalidDeclaration(String),

    /// A list or map was declared with another collection as its item.
    #[error("{container} item must be a primitive or object declaration")]
    NestedCollection {
        /// `"map"` or `"array"`.
        container: &'static str,
    },

    /// The kind was registered before with a different declaration.
    #[error("entity kind `{0}` is already registered with a different declaration")]
    Conflict(String),

    /// No compiled type exists for this kind.
    #[error("entity kind `{0}` is not registered")]
    UnknownKind(String),

    /// The object declaration has no field with this name.
    #[error("field `{0}` is not declared")]
    UnknownField(String),
}
