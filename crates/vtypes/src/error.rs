//! Error types for the schema catalogue.

use thiserror::Error;

/// Schema/configuration faults. These are hard failures raised at load or
/// build time, never masked as field absence.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Type not found: {0}")]
    TypeNotFound(String),

    #[error("Field not found: {field} in type {type_name}")]
    FieldNotFound { type_name: String, field: String },

    #[error("Cyclic 'before' ordering among schema modifications: {0}")]
    CyclicModification(String),

    #[error("Duplicate modification name: {0}")]
    DuplicateModification(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Invalid schema definition for {type_name}: {msg}")]
    InvalidDefinition { type_name: String, msg: String },
}

pub type SchemaResult<T> = Result<T, SchemaError>;
