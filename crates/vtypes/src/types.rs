//! Schema model: field layouts for structures decoded out of a memory image.
//!
//! A [`FieldSpec`]'s offset and type parameters may be literal values or pure
//! functions of sibling fields already decoded from the same structure
//! ("this string's length lives in my `NameLength` field"). Those functions
//! receive a read-only [`FieldView`] of the partially decoded structure, so
//! this crate never needs to know about the engine's object type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Read-only view of a partially decoded structure, handed to computed
/// offset/length functions. The engine's memory object implements this.
pub trait FieldView {
    /// Unsigned integer value of a sibling field, if it can be decoded.
    fn field_u64(&self, name: &str) -> Option<u64>;

    /// Signed variant; defaults to a reinterpretation of the unsigned read.
    fn field_i64(&self, name: &str) -> Option<i64> {
        self.field_u64(name).map(|v| v as i64)
    }
}

/// Function evaluated against the partially decoded structure.
pub type ComputedFn<T> = Arc<dyn Fn(&dyn FieldView) -> Option<T> + Send + Sync>;

/// A literal value or a function of sibling fields.
///
/// Cyclic field dependency (a computed offset that needs the field it
/// defines) is a schema authoring error and is not guarded at runtime.
#[derive(Clone)]
pub enum Spec<T: Copy + 'static> {
    Literal(T),
    Computed(ComputedFn<T>),
}

impl<T: Copy + 'static> Spec<T> {
    pub fn eval(&self, view: &dyn FieldView) -> Option<T> {
        match self {
            Spec::Literal(v) => Some(*v),
            Spec::Computed(f) => f(view),
        }
    }

    /// The literal value, if this spec does not depend on sibling fields.
    pub fn literal(&self) -> Option<T> {
        match self {
            Spec::Literal(v) => Some(*v),
            Spec::Computed(_) => None,
        }
    }
}

impl<T: Copy + fmt::Debug + 'static> fmt::Debug for Spec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Spec::Literal(v) => write!(f, "Literal({:?})", v),
            Spec::Computed(_) => write!(f, "Computed(..)"),
        }
    }
}

/// Primitive scalar kinds, little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl BaseKind {
    pub fn size(&self) -> u64 {
        match self {
            BaseKind::U8 | BaseKind::I8 => 1,
            BaseKind::U16 | BaseKind::I16 => 2,
            BaseKind::U32 | BaseKind::I32 => 4,
            BaseKind::U64 | BaseKind::I64 => 8,
        }
    }

    pub fn signed(&self) -> bool {
        matches!(
            self,
            BaseKind::I8 | BaseKind::I16 | BaseKind::I32 | BaseKind::I64
        )
    }
}

/// Type descriptor for a field.
#[derive(Clone, Debug)]
pub enum TypeDecl {
    /// Primitive scalar.
    Base(BaseKind),
    /// Pointer-sized value, optionally typed with its target.
    Pointer(Option<Box<TypeDecl>>),
    /// Embedded structure by name.
    Struct(String),
    /// Fixed-stride array. A computed count depends on sibling fields.
    Array {
        count: Spec<i64>,
        element: Box<TypeDecl>,
    },
    /// NUL-terminated ASCII within a fixed or computed byte length.
    CString { length: Spec<i64> },
    /// Counted UTF-16LE string record: u16 length, u16 capacity, pointer to
    /// the character buffer.
    UnicodeString,
    /// Pointer with a small reference count packed into its low 3 bits.
    FastRef { target: String },
}

impl TypeDecl {
    /// Size in bytes, where it is statically known. Arrays with computed
    /// counts and embedded structs (whose size lives in the catalog) return
    /// None here; the catalog resolves those.
    pub fn static_size(&self, pointer_size: u64) -> Option<u64> {
        match self {
            TypeDecl::Base(k) => Some(k.size()),
            TypeDecl::Pointer(_) | TypeDecl::FastRef { .. } => Some(pointer_size),
            TypeDecl::CString { length } => length.literal().map(|l| l.max(0) as u64),
            TypeDecl::UnicodeString => Some(4 + pointer_size),
            TypeDecl::Array { count, element } => {
                // Counts come from image bytes; an implausible one must not
                // overflow the size computation.
                let c = u64::try_from(count.literal()?).ok()?;
                c.checked_mul(element.static_size(pointer_size)?)
            }
            TypeDecl::Struct(_) => None,
        }
    }
}

/// One field in a structure layout.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    /// Byte offset from the structure start. May be negative: tag bytes can
    /// sit immediately before the nominal structure start.
    pub offset: Spec<i64>,
    pub decl: TypeDecl,
}

impl FieldSpec {
    pub fn new(offset: i64, decl: TypeDecl) -> Self {
        FieldSpec {
            offset: Spec::Literal(offset),
            decl,
        }
    }

    pub fn computed(offset: ComputedFn<i64>, decl: TypeDecl) -> Self {
        FieldSpec {
            offset: Spec::Computed(offset),
            decl,
        }
    }
}

/// A named structure layout: total size plus an ordered field map.
#[derive(Clone, Debug, Default)]
pub struct StructSchema {
    pub size: u64,
    fields: Vec<(String, FieldSpec)>,
}

impl StructSchema {
    pub fn new(size: u64) -> Self {
        StructSchema {
            size,
            fields: Vec::new(),
        }
    }

    /// Add or replace a field, preserving the original position on replace.
    pub fn set_field(&mut self, name: impl Into<String>, spec: FieldSpec) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = spec;
        } else {
            self.fields.push((name, spec));
        }
    }

    pub fn remove_field(&mut self, name: &str) {
        self.fields.retain(|(n, _)| n != name);
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find_map(|(n, spec)| (n == name).then_some(spec))
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.set_field(name, spec);
        self
    }
}

/// Mapping from structure name to layout.
pub type SchemaTable = HashMap<String, StructSchema>;

/// Per-type validity predicate, registered by name at catalog build time.
/// Runs in addition to the engine's address-range check.
pub type ValidityFn = Arc<dyn Fn(&dyn FieldView) -> bool + Send + Sync>;

/// Tag-driven subtype dispatch for tree nodes: a fixed-size tag string sits
/// immediately before the node's nominal start and selects the concrete
/// layout from a closed map. Unknown tags mean the node is not decodable.
#[derive(Clone)]
pub struct TagFamily {
    /// Tag length in bytes; the tag is read at `node_offset - tag_len`.
    pub tag_len: u64,
    /// Tag bytes to concrete structure name.
    pub map: HashMap<Vec<u8>, String>,
    /// Child pointer field names on every concrete layout in the family.
    pub left_field: String,
    pub right_field: String,
}

impl fmt::Debug for TagFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagFamily")
            .field("tag_len", &self.tag_len)
            .field("variants", &self.map.len())
            .field("left_field", &self.left_field)
            .field("right_field", &self.right_field)
            .finish()
    }
}

/// Declaration of an optional sub-record preceding a primary structure.
///
/// The primary structure stores, in `offset_field`, the distance back from
/// its own start to the sub-record; zero means the sub-record is absent.
#[derive(Clone, Debug)]
pub struct SubRecordDecl {
    pub name: String,
    pub offset_field: String,
    pub record_type: String,
}
