//! Tagged fast-reference pointers.
//!
//! A fast reference packs a small reference count into the low bits of an
//! aligned pointer. The pointee address is the value with the low bits
//! masked off; the tag is those bits. The mask is fixed by the alignment
//! contract: targets are at least 8-byte aligned, so three bits carry tag.

use crate::error::AsResult;
use crate::object::{Member, MemoryObject};
use vtypes::TypeDecl;

/// Low bits carrying the packed reference count.
pub const FAST_REF_MASK: u64 = 7;

impl MemoryObject {
    /// The packed tag, always in `0..=7`.
    pub fn fast_ref_tag(&self) -> AsResult<u64> {
        Ok(self.as_u64()? & FAST_REF_MASK)
    }

    /// Follow the fast reference to its declared target type. A masked
    /// value of zero is an absence, exactly like a null pointer.
    pub fn fast_ref_object(&self) -> AsResult<Member> {
        self.fast_ref_with_parent(None)
    }

    /// Follow the fast reference, overriding the parent recorded on the
    /// pointee. Used when the pointee logically belongs to a different
    /// owner than the structure holding the reference.
    pub fn fast_ref_with_parent(&self, parent: Option<MemoryObject>) -> AsResult<Member> {
        let target = match self.scalar_decl()? {
            TypeDecl::FastRef { target } => target.clone(),
            other => {
                return Err(crate::error::AsError::invalid_parameter(format!(
                    "{:?} is not a fast reference",
                    other
                )))
            }
        };
        let addr = self.as_u64()? & !FAST_REF_MASK;
        let member = self.object_at(TypeDecl::Struct(target), addr);
        Ok(match (member, parent) {
            (Member::Object(mut o), Some(p)) => {
                o.parent = Some(Box::new(p));
                Member::Object(o)
            }
            (m, _) => m,
        })
    }
}
