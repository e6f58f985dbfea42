//! Lazily-decoded typed objects.
//!
//! A [`MemoryObject`] is nothing but an identity: a type shape, a catalog,
//! an address space and an offset. No bytes are read until an accessor
//! asks for them, and re-reading re-decodes, so objects stay coherent with
//! whatever the layer returns at access time.
//!
//! Member access distinguishes three failure modes. A member that does not
//! exist, a null pointer, or an uncomputable offset yields
//! [`Member::Absent`], which propagates silently through further member
//! access. A fault in the backing source (unreadable raw bytes) surfaces as
//! an [`AsError`] to the direct caller. Invalidity is a question, answered
//! by [`MemoryObject::is_valid`].

mod fastref;
mod subrecord;

use crate::error::{AsError, AsResult};
use crate::layers::{read_uint, AddressSpace};
use std::sync::Arc;
use vtypes::{Catalog, FieldView, Spec, TypeDecl};

/// Byte bound on counted UTF-16 string records; longer lengths mean the
/// record is garbage, not a long string.
const UNICODE_LENGTH_BOUND: u64 = 1024;

/// What an object is an instance of: a named structure from the catalog,
/// or a scalar field type.
#[derive(Clone)]
enum Shape {
    Struct(String),
    Scalar(TypeDecl),
}

/// Result of member access: a decodable object or a reasoned absence.
#[derive(Clone)]
pub enum Member {
    Object(MemoryObject),
    Absent(String),
}

impl Member {
    pub fn absent(reason: impl Into<String>) -> Self {
        Member::Absent(reason.into())
    }

    /// Chained member access; absence propagates.
    pub fn member(&self, name: &str) -> Member {
        match self {
            Member::Object(o) => o.member(name),
            Member::Absent(reason) => Member::Absent(reason.clone()),
        }
    }

    pub fn object(&self) -> Option<&MemoryObject> {
        match self {
            Member::Object(o) => Some(o),
            Member::Absent(_) => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Member::Absent(_))
    }

    pub fn absence_reason(&self) -> Option<&str> {
        match self {
            Member::Absent(reason) => Some(reason),
            Member::Object(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct MemoryObject {
    shape: Shape,
    catalog: Arc<Catalog>,
    space: Arc<dyn AddressSpace>,
    offset: u64,
    /// The structure this object was reached through, if any.
    parent: Option<Box<MemoryObject>>,
    /// Space in which this object's pointers dereference; defaults to the
    /// object's own space.
    native: Option<Arc<dyn AddressSpace>>,
}

impl MemoryObject {
    /// An instance of a named structure at `offset`.
    pub fn new(
        type_name: impl Into<String>,
        catalog: Arc<Catalog>,
        space: Arc<dyn AddressSpace>,
        offset: u64,
    ) -> Self {
        MemoryObject {
            shape: Shape::Struct(type_name.into()),
            catalog,
            space,
            offset,
            parent: None,
            native: None,
        }
    }

    /// Dereference pointers through `space` instead of the object's own
    /// space. Used for objects decoded out of a physical view whose
    /// pointers are virtual.
    pub fn with_native_space(mut self, space: Arc<dyn AddressSpace>) -> Self {
        self.native = Some(space);
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn type_name(&self) -> Option<&str> {
        match &self.shape {
            Shape::Struct(n) => Some(n),
            Shape::Scalar(_) => None,
        }
    }

    pub fn parent(&self) -> Option<&MemoryObject> {
        self.parent.as_deref()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    fn native_space(&self) -> &Arc<dyn AddressSpace> {
        self.native.as_ref().unwrap_or(&self.space)
    }

    /// Size in bytes of this object's representation, 0 when unknowable.
    pub fn size(&self) -> u64 {
        match &self.shape {
            Shape::Struct(n) => self.catalog.structure(n).map(|s| s.size).unwrap_or(0),
            Shape::Scalar(decl) => self.decl_size(decl),
        }
    }

    fn decl_size(&self, decl: &TypeDecl) -> u64 {
        if let Some(size) = decl.static_size(self.catalog.pointer_size()) {
            return size;
        }
        match decl {
            TypeDecl::Struct(n) => self.catalog.structure(n).map(|s| s.size).unwrap_or(0),
            TypeDecl::Array { count, element } => {
                // Saturate on implausible counts: the resulting size fails
                // the range check instead of wrapping into a small one.
                let c = count
                    .literal()
                    .and_then(|c| u64::try_from(c).ok())
                    .unwrap_or(0);
                c.saturating_mul(self.decl_size(element))
            }
            _ => 0,
        }
    }

    /// Whether the object occupies valid addresses and, for structure
    /// types with a registered predicate, passes that predicate.
    pub fn is_valid(&self) -> bool {
        let size = self.size().max(1);
        if !self.space.is_valid(self.offset, size) {
            return false;
        }
        if let Shape::Struct(n) = &self.shape {
            if let Some(predicate) = self.catalog.validity(n) {
                return predicate(self);
            }
        }
        true
    }

    /// Access a named field of a structure instance.
    pub fn member(&self, name: &str) -> Member {
        let type_name = match &self.shape {
            Shape::Struct(n) => n,
            Shape::Scalar(_) => {
                return Member::absent(format!("scalar object has no member {}", name))
            }
        };
        let schema = match self.catalog.structure(type_name) {
            Ok(s) => s,
            Err(e) => return Member::absent(e.to_string()),
        };
        let field = match schema.field(name) {
            Some(f) => f,
            None => {
                return Member::absent(format!("no field {} in type {}", name, type_name))
            }
        };
        let relative = match field.offset.eval(self) {
            Some(v) => v,
            None => {
                return Member::absent(format!(
                    "offset of {}.{} is not computable here",
                    type_name, name
                ))
            }
        };
        let decl = match self.freeze_decl(&field.decl) {
            Some(d) => d,
            None => {
                return Member::absent(format!(
                    "parameters of {}.{} are not computable here",
                    type_name, name
                ))
            }
        };

        let offset = self.offset.wrapping_add(relative as u64);
        let shape = match decl {
            TypeDecl::Struct(n) => Shape::Struct(n),
            other => Shape::Scalar(other),
        };
        Member::Object(MemoryObject {
            shape,
            catalog: Arc::clone(&self.catalog),
            space: Arc::clone(&self.space),
            offset,
            parent: Some(Box::new(self.clone())),
            native: self.native.clone(),
        })
    }

    /// Resolve computed lengths/counts against this structure, so the
    /// member object carries only literals.
    fn freeze_decl(&self, decl: &TypeDecl) -> Option<TypeDecl> {
        Some(match decl {
            TypeDecl::CString { length } => TypeDecl::CString {
                length: Spec::Literal(length.eval(self)?),
            },
            TypeDecl::Array { count, element } => TypeDecl::Array {
                count: Spec::Literal(count.eval(self)?),
                element: element.clone(),
            },
            other => other.clone(),
        })
    }

    fn scalar_decl(&self) -> AsResult<&TypeDecl> {
        match &self.shape {
            Shape::Scalar(d) => Ok(d),
            Shape::Struct(n) => Err(AsError::invalid_parameter(format!(
                "structure {} is not a scalar",
                n
            ))),
        }
    }

    /// Unsigned integer value of a scalar object. Pointer and fast-ref
    /// values are returned raw, tag bits included.
    pub fn as_u64(&self) -> AsResult<u64> {
        let decl = self.scalar_decl()?;
        match decl {
            TypeDecl::Base(kind) => {
                read_uint(self.space.as_ref(), self.offset, kind.size())
            }
            TypeDecl::Pointer(_) | TypeDecl::FastRef { .. } => read_uint(
                self.space.as_ref(),
                self.offset,
                self.catalog.pointer_size(),
            ),
            other => Err(AsError::invalid_parameter(format!(
                "{:?} has no integer value",
                other
            ))),
        }
    }

    /// Signed integer value, sign-extended from the field's width.
    pub fn as_i64(&self) -> AsResult<i64> {
        let decl = self.scalar_decl()?;
        match decl {
            TypeDecl::Base(kind) => {
                let raw = read_uint(self.space.as_ref(), self.offset, kind.size())?;
                Ok(if kind.signed() {
                    sign_extend(raw, kind.size())
                } else {
                    raw as i64
                })
            }
            _ => self.as_u64().map(|v| v as i64),
        }
    }

    /// NUL-terminated ASCII string of a fixed- or computed-length field.
    pub fn as_string(&self) -> AsResult<String> {
        let decl = self.scalar_decl()?;
        let length = match decl {
            TypeDecl::CString { length } => length.literal().ok_or_else(|| {
                AsError::invalid_parameter("string length was not resolved")
            })?,
            other => {
                return Err(AsError::invalid_parameter(format!(
                    "{:?} is not a string",
                    other
                )))
            }
        };
        if length < 0 {
            return Err(AsError::invalid_parameter("negative string length"));
        }
        let bytes = self.space.read(self.offset, length as usize)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Decode a counted UTF-16LE string record: u16 byte length, u16
    /// capacity, pointer to the character buffer. The buffer dereferences
    /// in the native space.
    pub fn as_unicode_string(&self) -> AsResult<String> {
        match self.scalar_decl()? {
            TypeDecl::UnicodeString => {}
            other => {
                return Err(AsError::invalid_parameter(format!(
                    "{:?} is not a counted string record",
                    other
                )))
            }
        }
        let length = read_uint(self.space.as_ref(), self.offset, 2)?;
        // A zero length marks an unset record, not an empty string.
        if length == 0 || length > UNICODE_LENGTH_BOUND {
            return Err(AsError::invalid_parameter(format!(
                "counted string length {} outside 1..={}",
                length, UNICODE_LENGTH_BOUND
            )));
        }
        let buffer = read_uint(
            self.space.as_ref(),
            self.offset + 4,
            self.catalog.pointer_size(),
        )?;
        if buffer == 0 {
            return Err(AsError::invalid_parameter("counted string has null buffer"));
        }
        let bytes = self.native_space().read(buffer, length as usize)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    /// Follow a typed pointer. Null yields Absent; a backing fault is an
    /// error.
    pub fn dereference(&self) -> AsResult<Member> {
        let target = match self.scalar_decl()? {
            TypeDecl::Pointer(target) => target.clone(),
            other => {
                return Err(AsError::invalid_parameter(format!(
                    "{:?} is not a pointer",
                    other
                )))
            }
        };
        let target = target.ok_or_else(|| {
            AsError::invalid_parameter("untyped pointer needs dereference_as")
        })?;
        let addr = self.as_u64()?;
        Ok(self.object_at(*target, addr))
    }

    /// Follow a pointer as an instance of the named structure.
    pub fn dereference_as(&self, type_name: &str) -> AsResult<Member> {
        match self.scalar_decl()? {
            TypeDecl::Pointer(_) | TypeDecl::FastRef { .. } => {}
            other => {
                return Err(AsError::invalid_parameter(format!(
                    "{:?} is not a pointer",
                    other
                )))
            }
        }
        let addr = self.as_u64()?;
        Ok(self.object_at(TypeDecl::Struct(type_name.to_string()), addr))
    }

    /// Index into a fixed-stride array field.
    pub fn element(&self, index: u64) -> AsResult<Member> {
        let (count, element) = match self.scalar_decl()? {
            TypeDecl::Array { count, element } => (count.clone(), element.clone()),
            other => {
                return Err(AsError::invalid_parameter(format!(
                    "{:?} is not an array",
                    other
                )))
            }
        };
        let count = count
            .literal()
            .ok_or_else(|| AsError::invalid_parameter("array count was not resolved"))?;
        if count < 0 || index >= count as u64 {
            return Ok(Member::absent(format!(
                "array index {} out of {} elements",
                index, count
            )));
        }
        let stride = self.decl_size(&element);
        if stride == 0 {
            return Err(AsError::invalid_parameter("array element size unknown"));
        }
        let addr = self.offset + index * stride;
        Ok(self.sibling_at(*element, addr))
    }

    /// Build a member-shaped object at an absolute address in the native
    /// space; address zero is an absence.
    fn object_at(&self, decl: TypeDecl, addr: u64) -> Member {
        if addr == 0 {
            return Member::absent("null pointer");
        }
        let shape = match decl {
            TypeDecl::Struct(n) => Shape::Struct(n),
            other => Shape::Scalar(other),
        };
        Member::Object(MemoryObject {
            shape,
            catalog: Arc::clone(&self.catalog),
            space: Arc::clone(self.native_space()),
            offset: addr,
            parent: Some(Box::new(self.clone())),
            native: self.native.clone(),
        })
    }

    /// Build an object at an address in this object's own space.
    fn sibling_at(&self, decl: TypeDecl, addr: u64) -> Member {
        let shape = match decl {
            TypeDecl::Struct(n) => Shape::Struct(n),
            other => Shape::Scalar(other),
        };
        Member::Object(MemoryObject {
            shape,
            catalog: Arc::clone(&self.catalog),
            space: Arc::clone(&self.space),
            offset: addr,
            parent: Some(Box::new(self.clone())),
            native: self.native.clone(),
        })
    }
}

/// Computed offsets and registered predicates see the structure through
/// this narrow view.
impl FieldView for MemoryObject {
    fn field_u64(&self, name: &str) -> Option<u64> {
        match self.member(name) {
            Member::Object(o) => o.as_u64().ok(),
            Member::Absent(_) => None,
        }
    }

    fn field_i64(&self, name: &str) -> Option<i64> {
        match self.member(name) {
            Member::Object(o) => o.as_i64().ok(),
            Member::Absent(_) => None,
        }
    }
}

fn sign_extend(raw: u64, size: u64) -> i64 {
    let bits = size * 8;
    if bits >= 64 {
        return raw as i64;
    }
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}
