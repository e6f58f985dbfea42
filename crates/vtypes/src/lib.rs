//! Declarative structure-layout catalogue for memory forensics.
//!
//! This crate models OS structure layouts as data: named structures with
//! ordered fields whose offsets and lengths may be literal or computed from
//! sibling fields. A base table (loaded from JSON) is refined by a catalogue
//! of named [`merge::Modification`]s, topologically sorted by their `before`
//! edges, into a frozen [`merge::Catalog`] shared by the whole session. It
//! provides:
//!
//! - Parsing of JSON layout tables into a [`types::SchemaTable`]
//! - [`types::Spec`] for literal-or-computed offsets, lengths and counts
//! - Overlay merging with deterministic ordering and cycle detection
//! - Registered per-type behaviors: validity predicates, tag families for
//!   subtype dispatch, and optional sub-record declarations
//!
//! # Example
//!
//! ```rust,ignore
//! use vtypes::{parse_layout_str, CatalogBuilder, Modification};
//!
//! let base = parse_layout_str(layout_json)?;
//! let catalog = CatalogBuilder::new(8)
//!     .register_base(base)
//!     .register(version_fixups)
//!     .build()?;
//! let pid_offset = catalog.literal_offset("_EPROCESS", "UniqueProcessId")?;
//! ```

pub mod error;
pub mod merge;
pub mod parser;
pub mod types;

// Re-export key types at crate root.
pub use error::{SchemaError, SchemaResult};
pub use merge::{Catalog, CatalogBuilder, FieldPatch, Modification, StructPatch};
pub use parser::{parse_layout_bytes, parse_layout_file, parse_layout_str};
pub use types::{
    BaseKind, ComputedFn, FieldSpec, FieldView, SchemaTable, Spec, StructSchema, SubRecordDecl,
    TagFamily, TypeDecl, ValidityFn,
};
