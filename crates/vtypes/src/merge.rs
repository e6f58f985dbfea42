//! Overlay merge engine.
//!
//! A base schema table is refined by a catalogue of named modifications.
//! Each modification declares the set of modifications it must apply
//! *before*; the builder topologically sorts the catalogue once, applies
//! every patch in that order, and freezes the result into a [`Catalog`].
//! A cycle in the `before` edges is a configuration fault reported at build
//! time. Merging is idempotent: applying the same overlay twice yields the
//! same table.

use crate::error::{SchemaError, SchemaResult};
use crate::types::{
    FieldSpec, SchemaTable, StructSchema, SubRecordDecl, TagFamily, ValidityFn,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Patch action for a single field.
#[derive(Clone, Debug)]
pub enum FieldPatch {
    /// No-op sentinel: leave the existing field untouched.
    Keep,
    /// Replace the field's offset/type wholesale (or add it).
    Set(FieldSpec),
    /// Delete the field.
    Delete,
}

/// Patch for one structure. A patch against a structure absent from the
/// base creates it, provided it supplies a size and a full field table.
#[derive(Clone, Debug, Default)]
pub struct StructPatch {
    pub size: Option<u64>,
    pub fields: Vec<(String, FieldPatch)>,
}

impl StructPatch {
    pub fn new() -> Self {
        StructPatch::default()
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn set(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.push((name.into(), FieldPatch::Set(spec)));
        self
    }

    pub fn keep(mut self, name: impl Into<String>) -> Self {
        self.fields.push((name.into(), FieldPatch::Keep));
        self
    }

    pub fn delete(mut self, name: impl Into<String>) -> Self {
        self.fields.push((name.into(), FieldPatch::Delete));
        self
    }
}

/// A named, ordered refinement of the schema table. Besides field patches a
/// modification may register per-type behaviors: validity predicates, tag
/// families for subtype dispatch, and optional sub-record declarations.
#[derive(Default)]
pub struct Modification {
    pub name: String,
    /// Names of modifications this one must apply before.
    pub before: Vec<String>,
    patches: Vec<(String, StructPatch)>,
    validity: Vec<(String, ValidityFn)>,
    tag_families: Vec<(String, TagFamily)>,
    subrecords: Vec<(String, Vec<SubRecordDecl>)>,
}

impl Modification {
    pub fn new(name: impl Into<String>) -> Self {
        Modification {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn before(mut self, other: impl Into<String>) -> Self {
        self.before.push(other.into());
        self
    }

    pub fn patch(mut self, type_name: impl Into<String>, patch: StructPatch) -> Self {
        self.patches.push((type_name.into(), patch));
        self
    }

    pub fn validity(mut self, type_name: impl Into<String>, f: ValidityFn) -> Self {
        self.validity.push((type_name.into(), f));
        self
    }

    pub fn tag_family(mut self, family: impl Into<String>, tags: TagFamily) -> Self {
        self.tag_families.push((family.into(), tags));
        self
    }

    pub fn subrecords(
        mut self,
        type_name: impl Into<String>,
        decls: Vec<SubRecordDecl>,
    ) -> Self {
        self.subrecords.push((type_name.into(), decls));
        self
    }
}

/// Frozen result of the merge: the resolved structure table plus every
/// registered per-type behavior. Shared read-only for the whole session.
pub struct Catalog {
    structs: SchemaTable,
    validity: HashMap<String, ValidityFn>,
    tag_families: HashMap<String, TagFamily>,
    /// Sub-record declarations that survived build-time pruning, keyed by
    /// the primary structure name.
    subrecords: HashMap<String, Vec<SubRecordDecl>>,
    pointer_size: u64,
}

impl Catalog {
    pub fn structure(&self, name: &str) -> SchemaResult<&StructSchema> {
        self.structs
            .get(name)
            .ok_or_else(|| SchemaError::TypeNotFound(name.to_string()))
    }

    pub fn has_structure(&self, name: &str) -> bool {
        self.structs.contains_key(name)
    }

    pub fn field(&self, type_name: &str, field: &str) -> SchemaResult<&FieldSpec> {
        self.structure(type_name)?
            .field(field)
            .ok_or_else(|| SchemaError::FieldNotFound {
                type_name: type_name.to_string(),
                field: field.to_string(),
            })
    }

    /// Literal byte offset of a field, for callers that cannot supply a
    /// partially decoded view (list/tree walkers).
    pub fn literal_offset(&self, type_name: &str, field: &str) -> SchemaResult<i64> {
        let spec = self.field(type_name, field)?;
        spec.offset
            .literal()
            .ok_or_else(|| SchemaError::InvalidDefinition {
                type_name: type_name.to_string(),
                msg: format!("field {} requires a literal offset here", field),
            })
    }

    pub fn validity(&self, type_name: &str) -> Option<&ValidityFn> {
        self.validity.get(type_name)
    }

    pub fn tag_family(&self, family: &str) -> Option<&TagFamily> {
        self.tag_families.get(family)
    }

    pub fn subrecords(&self, type_name: &str) -> &[SubRecordDecl] {
        self.subrecords
            .get(type_name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn pointer_size(&self) -> u64 {
        self.pointer_size
    }
}

/// Accumulates the base table and the modification catalogue, then builds
/// the frozen [`Catalog`].
pub struct CatalogBuilder {
    base: SchemaTable,
    mods: Vec<Modification>,
    pointer_size: u64,
}

impl CatalogBuilder {
    pub fn new(pointer_size: u64) -> Self {
        CatalogBuilder {
            base: SchemaTable::new(),
            mods: Vec::new(),
            pointer_size,
        }
    }

    /// Register the base structure table supplied by the layout catalogue.
    /// Later registrations extend (and on name collision replace) earlier
    /// ones.
    pub fn register_base(mut self, table: SchemaTable) -> Self {
        self.base.extend(table);
        self
    }

    pub fn register(mut self, m: Modification) -> Self {
        self.mods.push(m);
        self
    }

    pub fn build(self) -> SchemaResult<Catalog> {
        let order = sort_modifications(&self.mods)?;

        let mut structs = self.base;
        let mut validity: HashMap<String, ValidityFn> = HashMap::new();
        let mut tag_families: HashMap<String, TagFamily> = HashMap::new();
        let mut declared: HashMap<String, Vec<SubRecordDecl>> = HashMap::new();

        for idx in order {
            let m = &self.mods[idx];
            debug!("Applying schema modification {}", m.name);
            for (type_name, patch) in &m.patches {
                apply_patch(&mut structs, type_name, patch)?;
            }
            for (type_name, f) in &m.validity {
                validity.insert(type_name.clone(), Arc::clone(f));
            }
            for (family, tags) in &m.tag_families {
                tag_families.insert(family.clone(), tags.clone());
            }
            for (type_name, decls) in &m.subrecords {
                declared.insert(type_name.clone(), decls.clone());
            }
        }

        // Sub-record types missing from the merged table (an OS version that
        // dropped that record) are pruned here, once, never per instance.
        let mut subrecords = HashMap::new();
        for (type_name, decls) in declared {
            let kept: Vec<SubRecordDecl> = decls
                .into_iter()
                .filter(|d| {
                    let present = structs.contains_key(&d.record_type);
                    if !present {
                        debug!(
                            "Dropping sub-record {} of {}: type {} not in schema",
                            d.name, type_name, d.record_type
                        );
                    }
                    present
                })
                .collect();
            subrecords.insert(type_name, kept);
        }

        Ok(Catalog {
            structs,
            validity,
            tag_families,
            subrecords,
            pointer_size: self.pointer_size,
        })
    }
}

fn apply_patch(
    structs: &mut SchemaTable,
    type_name: &str,
    patch: &StructPatch,
) -> SchemaResult<()> {
    let entry = structs.entry(type_name.to_string()).or_insert_with(|| {
        StructSchema::new(patch.size.unwrap_or(0))
    });
    if let Some(size) = patch.size {
        entry.size = size;
    }
    for (field, action) in &patch.fields {
        match action {
            FieldPatch::Keep => {}
            FieldPatch::Set(spec) => entry.set_field(field.clone(), spec.clone()),
            FieldPatch::Delete => entry.remove_field(field),
        }
    }
    Ok(())
}

/// Stable topological sort over "must apply before" edges. Ties (no edge
/// between two modifications) are broken by registration order, so the
/// result is deterministic regardless of incidental ordering elsewhere.
fn sort_modifications(mods: &[Modification]) -> SchemaResult<Vec<usize>> {
    let mut index_of: HashMap<&str, usize> = HashMap::new();
    for (i, m) in mods.iter().enumerate() {
        if index_of.insert(m.name.as_str(), i).is_some() {
            return Err(SchemaError::DuplicateModification(m.name.clone()));
        }
    }

    // successors[i] = modifications that must apply after i
    let mut indegree = vec![0usize; mods.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); mods.len()];
    for (i, m) in mods.iter().enumerate() {
        for target in &m.before {
            // A `before` edge naming an unregistered modification is inert.
            if let Some(&j) = index_of.get(target.as_str()) {
                successors[i].push(j);
                indegree[j] += 1;
            }
        }
    }

    let mut order = Vec::with_capacity(mods.len());
    let mut placed = vec![false; mods.len()];
    while order.len() < mods.len() {
        // Lowest registration index among ready nodes keeps the sort stable.
        let next = (0..mods.len()).find(|&i| !placed[i] && indegree[i] == 0);
        let Some(i) = next else {
            let stuck: Vec<&str> = (0..mods.len())
                .filter(|&i| !placed[i])
                .map(|i| mods[i].name.as_str())
                .collect();
            return Err(SchemaError::CyclicModification(stuck.join(", ")));
        };
        placed[i] = true;
        order.push(i);
        for &j in &successors[i] {
            indegree[j] -= 1;
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BaseKind, TypeDecl};

    fn base_table() -> SchemaTable {
        let mut t = SchemaTable::new();
        t.insert(
            "_THING".to_string(),
            StructSchema::new(16)
                .with_field("a", FieldSpec::new(0, TypeDecl::Base(BaseKind::U32)))
                .with_field("b", FieldSpec::new(4, TypeDecl::Base(BaseKind::U32))),
        );
        t
    }

    #[test]
    fn test_patch_replace_add_delete() {
        let catalog = CatalogBuilder::new(8)
            .register_base(base_table())
            .register(Modification::new("fixups").patch(
                "_THING",
                StructPatch::new()
                    .set("a", FieldSpec::new(8, TypeDecl::Base(BaseKind::U64)))
                    .keep("b")
                    .delete("missing")
                    .set("c", FieldSpec::new(12, TypeDecl::Base(BaseKind::U8))),
            ))
            .build()
            .unwrap();

        let s = catalog.structure("_THING").unwrap();
        assert_eq!(s.field("a").unwrap().offset.literal(), Some(8));
        assert_eq!(s.field("b").unwrap().offset.literal(), Some(4));
        assert!(s.field("c").is_some());
    }

    #[test]
    fn test_patch_creates_missing_structure() {
        let catalog = CatalogBuilder::new(8)
            .register_base(base_table())
            .register(Modification::new("extra").patch(
                "_NEW",
                StructPatch::new()
                    .size(8)
                    .set("x", FieldSpec::new(0, TypeDecl::Base(BaseKind::U64))),
            ))
            .build()
            .unwrap();

        assert_eq!(catalog.structure("_NEW").unwrap().size, 8);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let m = || {
            Modification::new("fixups").patch(
                "_THING",
                StructPatch::new().set("a", FieldSpec::new(8, TypeDecl::Base(BaseKind::U64))),
            )
        };
        let once = CatalogBuilder::new(8)
            .register_base(base_table())
            .register(m())
            .build()
            .unwrap();
        let twice = CatalogBuilder::new(8)
            .register_base(base_table())
            .register(m())
            .register({
                let mut m2 = m();
                m2.name = "fixups-again".to_string();
                m2
            })
            .build()
            .unwrap();

        let a1 = once.structure("_THING").unwrap();
        let a2 = twice.structure("_THING").unwrap();
        assert_eq!(
            a1.field("a").unwrap().offset.literal(),
            a2.field("a").unwrap().offset.literal()
        );
        let n1: Vec<_> = a1.fields().map(|(n, _)| n).collect();
        let n2: Vec<_> = a2.fields().map(|(n, _)| n).collect();
        assert_eq!(n1, n2);
    }

    #[test]
    fn test_before_ordering_applies_first() {
        // "late" registered first, but "early" declares before=["late"],
        // so "early"'s value must be overwritten by "late".
        let build = |register_early_first: bool| {
            let early = Modification::new("early").before("late").patch(
                "_THING",
                StructPatch::new().set("a", FieldSpec::new(100, TypeDecl::Base(BaseKind::U32))),
            );
            let late = Modification::new("late").patch(
                "_THING",
                StructPatch::new().set("a", FieldSpec::new(200, TypeDecl::Base(BaseKind::U32))),
            );
            let b = CatalogBuilder::new(8).register_base(base_table());
            let b = if register_early_first {
                b.register(early).register(late)
            } else {
                b.register(late).register(early)
            };
            b.build().unwrap()
        };

        for order in [true, false] {
            let catalog = build(order);
            assert_eq!(
                catalog
                    .structure("_THING")
                    .unwrap()
                    .field("a")
                    .unwrap()
                    .offset
                    .literal(),
                Some(200),
                "registration order must not matter"
            );
        }
    }

    #[test]
    fn test_cyclic_before_is_a_build_fault() {
        let result = CatalogBuilder::new(8)
            .register(Modification::new("a").before("b"))
            .register(Modification::new("b").before("a"))
            .build();
        assert!(matches!(result, Err(SchemaError::CyclicModification(_))));
    }

    #[test]
    fn test_subrecord_pruned_when_type_missing() {
        let catalog = CatalogBuilder::new(8)
            .register_base(base_table())
            .register(
                Modification::new("subrecords").subrecords(
                    "_THING",
                    vec![
                        SubRecordDecl {
                            name: "NameInfo".into(),
                            offset_field: "NameInfoOffset".into(),
                            record_type: "_THING".into(),
                        },
                        SubRecordDecl {
                            name: "QuotaInfo".into(),
                            offset_field: "QuotaInfoOffset".into(),
                            record_type: "_NOT_DEFINED".into(),
                        },
                    ],
                ),
            )
            .build()
            .unwrap();

        let decls = catalog.subrecords("_THING");
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, "NameInfo");
    }
}
