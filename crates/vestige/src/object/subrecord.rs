//! Optional sub-records preceding a primary structure.
//!
//! A primary structure stores, per declared sub-record, the distance back
//! from its own start to that record; zero means the record was never
//! allocated for this instance. Declarations whose record type is missing
//! from the catalog were pruned at build time, so lookups here treat them
//! the same as never-declared names.

use crate::error::{AsError, AsResult};
use crate::object::{Member, MemoryObject, Shape};
use vtypes::TypeDecl;

impl MemoryObject {
    /// Resolve a named optional sub-record of this structure instance.
    pub fn sub_record(&self, name: &str) -> AsResult<Member> {
        let type_name = match &self.shape {
            Shape::Struct(n) => n.clone(),
            Shape::Scalar(_) => {
                return Err(AsError::invalid_parameter(
                    "scalar objects carry no sub-records",
                ))
            }
        };
        let decl = match self
            .catalog()
            .subrecords(&type_name)
            .iter()
            .find(|d| d.name == name)
        {
            Some(d) => d.clone(),
            None => {
                return Ok(Member::absent(format!(
                    "no sub-record {} declared for {}",
                    name, type_name
                )))
            }
        };

        let stored = match self.member(&decl.offset_field) {
            Member::Object(o) => o.as_u64()?,
            Member::Absent(reason) => return Ok(Member::Absent(reason)),
        };
        if stored == 0 {
            return Ok(Member::absent(format!(
                "sub-record {} not allocated for this instance",
                name
            )));
        }
        let addr = match self.offset().checked_sub(stored) {
            Some(a) => a,
            None => {
                return Ok(Member::absent(format!(
                    "sub-record {} offset {:#x} precedes the space",
                    name, stored
                )))
            }
        };
        Ok(self.sibling_at(TypeDecl::Struct(decl.record_type), addr))
    }

    /// Names of the sub-records declared (and retained) for this type.
    pub fn sub_record_names(&self) -> Vec<&str> {
        match &self.shape {
            Shape::Struct(n) => self
                .catalog()
                .subrecords(n)
                .iter()
                .map(|d| d.name.as_str())
                .collect(),
            Shape::Scalar(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{AddressSpace, BufferLayer};
    use std::sync::Arc;
    use vtypes::{
        BaseKind, Catalog, CatalogBuilder, FieldSpec, Modification, SchemaTable, StructSchema,
        SubRecordDecl,
    };

    fn catalog() -> Arc<Catalog> {
        let mut base = SchemaTable::new();
        base.insert(
            "_HEADER".to_string(),
            StructSchema::new(0x18)
                .with_field(
                    "NameInfoOffset",
                    FieldSpec::new(0x00, TypeDecl::Base(BaseKind::U8)),
                )
                .with_field(
                    "QuotaInfoOffset",
                    FieldSpec::new(0x01, TypeDecl::Base(BaseKind::U8)),
                ),
        );
        base.insert(
            "_NAME_INFO".to_string(),
            StructSchema::new(0x10).with_field(
                "RefCount",
                FieldSpec::new(0x00, TypeDecl::Base(BaseKind::U32)),
            ),
        );

        Arc::new(
            CatalogBuilder::new(8)
                .register_base(base)
                .register(Modification::new("header-subrecords").subrecords(
                    "_HEADER",
                    vec![
                        SubRecordDecl {
                            name: "NameInfo".into(),
                            offset_field: "NameInfoOffset".into(),
                            record_type: "_NAME_INFO".into(),
                        },
                        SubRecordDecl {
                            name: "QuotaInfo".into(),
                            offset_field: "QuotaInfoOffset".into(),
                            // Absent from the schema: pruned at build.
                            record_type: "_QUOTA_INFO".into(),
                        },
                    ],
                ))
                .build()
                .unwrap(),
        )
    }

    fn header_at(data: Vec<u8>, offset: u64) -> MemoryObject {
        let space: Arc<dyn AddressSpace> = Arc::new(BufferLayer::new("physical", data));
        MemoryObject::new("_HEADER", catalog(), space, offset)
    }

    #[test]
    fn test_nonzero_offset_resolves_backwards() {
        let mut data = vec![0u8; 0x200];
        data[0x100] = 0x20; // NameInfoOffset
        data[0xe0..0xe4].copy_from_slice(&7u32.to_le_bytes()); // _NAME_INFO.RefCount
        let header = header_at(data, 0x100);

        let info = header.sub_record("NameInfo").unwrap();
        let info = info.object().unwrap();
        assert_eq!(info.offset(), 0xe0);
        assert_eq!(info.type_name(), Some("_NAME_INFO"));
        assert_eq!(info.member("RefCount").object().unwrap().as_u64().unwrap(), 7);
    }

    #[test]
    fn test_zero_offset_means_absent() {
        let data = vec![0u8; 0x200];
        let header = header_at(data, 0x100);
        let info = header.sub_record("NameInfo").unwrap();
        assert!(info.is_absent());
        assert!(info.absence_reason().unwrap().contains("not allocated"));
    }

    #[test]
    fn test_pruned_declaration_is_absent() {
        let mut data = vec![0u8; 0x200];
        data[0x101] = 0x10; // QuotaInfoOffset, but _QUOTA_INFO was pruned
        let header = header_at(data, 0x100);
        let quota = header.sub_record("QuotaInfo").unwrap();
        assert!(quota.is_absent());
        assert_eq!(header.sub_record_names(), vec!["NameInfo"]);
    }

    #[test]
    fn test_offset_past_space_start_is_absent() {
        let mut data = vec![0u8; 0x200];
        data[0x10] = 0x20; // stored offset larger than the header offset
        let header = header_at(data, 0x10);
        let info = header.sub_record("NameInfo").unwrap();
        assert!(info.is_absent());
    }
}
