//! JSON loader for base layout tables.
//!
//! Loads the literal-only structure layouts shipped as JSON files. Computed
//! offsets, validity predicates, tag families and sub-record declarations
//! are code, not data; they arrive via [`crate::merge::Modification`]s after
//! the base table is loaded.

use crate::error::{SchemaError, SchemaResult};
use crate::types::{BaseKind, FieldSpec, SchemaTable, Spec, StructSchema, TypeDecl};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct LayoutFile {
    #[serde(default)]
    metadata: LayoutMetadata,
    structures: HashMap<String, RawStruct>,
}

#[derive(Debug, Deserialize, Default)]
struct LayoutMetadata {
    #[serde(default)]
    format: String,
}

#[derive(Debug, Deserialize)]
struct RawStruct {
    size: u64,
    fields: HashMap<String, RawField>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    offset: i64,
    #[serde(rename = "type")]
    type_info: RawType,
}

#[derive(Debug, Deserialize)]
struct RawType {
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    subtype: Option<Box<RawType>>,
    #[serde(default)]
    count: Option<i64>,
    #[serde(default)]
    length: Option<i64>,
}

/// Parse a layout table from a filesystem path.
pub fn parse_layout_file(path: impl AsRef<Path>) -> SchemaResult<SchemaTable> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| SchemaError::JsonParse(format!("opening {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .map_err(|e| SchemaError::JsonParse(format!("reading {}: {}", path.display(), e)))?;
    parse_layout_bytes(&buf)
}

/// Parse a layout table from raw JSON bytes.
pub fn parse_layout_bytes(json_bytes: &[u8]) -> SchemaResult<SchemaTable> {
    let file: LayoutFile = serde_json::from_slice(json_bytes)
        .map_err(|e| SchemaError::JsonParse(format!("{}", e)))?;
    convert(file)
}

/// Parse a layout table from a JSON string.
pub fn parse_layout_str(json_str: &str) -> SchemaResult<SchemaTable> {
    let file: LayoutFile = serde_json::from_str(json_str)
        .map_err(|e| SchemaError::JsonParse(format!("{}", e)))?;
    convert(file)
}

fn convert(file: LayoutFile) -> SchemaResult<SchemaTable> {
    if !file.metadata.format.is_empty() {
        debug!("Loading layout table, format {}", file.metadata.format);
    }
    let mut table = SchemaTable::new();
    for (name, raw) in file.structures {
        let mut schema = StructSchema::new(raw.size);
        for (field_name, raw_field) in raw.fields {
            let decl = convert_type(&name, &raw_field.type_info)?;
            schema.set_field(field_name, FieldSpec::new(raw_field.offset, decl));
        }
        table.insert(name, schema);
    }
    Ok(table)
}

fn convert_type(type_name: &str, raw: &RawType) -> SchemaResult<TypeDecl> {
    let invalid = |msg: &str| SchemaError::InvalidDefinition {
        type_name: type_name.to_string(),
        msg: msg.to_string(),
    };
    match raw.kind.as_str() {
        "base" => {
            let name = raw.name.as_deref().ok_or_else(|| invalid("base type needs a name"))?;
            Ok(TypeDecl::Base(base_kind(type_name, name)?))
        }
        "pointer" => {
            let target = match &raw.subtype {
                Some(sub) => Some(Box::new(convert_type(type_name, sub)?)),
                None => None,
            };
            Ok(TypeDecl::Pointer(target))
        }
        "struct" => {
            let name = raw
                .name
                .as_deref()
                .ok_or_else(|| invalid("struct reference needs a name"))?;
            Ok(TypeDecl::Struct(name.to_string()))
        }
        "array" => {
            let count = raw.count.ok_or_else(|| invalid("array needs a count"))?;
            let sub = raw
                .subtype
                .as_deref()
                .ok_or_else(|| invalid("array needs a subtype"))?;
            Ok(TypeDecl::Array {
                count: Spec::Literal(count),
                element: Box::new(convert_type(type_name, sub)?),
            })
        }
        "string" => {
            let length = raw.length.ok_or_else(|| invalid("string needs a length"))?;
            Ok(TypeDecl::CString {
                length: Spec::Literal(length),
            })
        }
        "unicode" => Ok(TypeDecl::UnicodeString),
        "fastref" => {
            let target = raw
                .name
                .as_deref()
                .ok_or_else(|| invalid("fastref needs a target type name"))?;
            Ok(TypeDecl::FastRef {
                target: target.to_string(),
            })
        }
        other => Err(invalid(&format!("unknown type kind {:?}", other))),
    }
}

fn base_kind(type_name: &str, name: &str) -> SchemaResult<BaseKind> {
    match name {
        "u8" | "unsigned char" => Ok(BaseKind::U8),
        "u16" | "unsigned short" => Ok(BaseKind::U16),
        "u32" | "unsigned long" => Ok(BaseKind::U32),
        "u64" | "unsigned long long" => Ok(BaseKind::U64),
        "i8" | "char" => Ok(BaseKind::I8),
        "i16" | "short" => Ok(BaseKind::I16),
        "i32" | "long" => Ok(BaseKind::I32),
        "i64" | "long long" => Ok(BaseKind::I64),
        other => Err(SchemaError::InvalidDefinition {
            type_name: type_name.to_string(),
            msg: format!("unknown base type {:?}", other),
        }),
    }
}
