//! Multi-level indexed table walker.
//!
//! The table descriptor packs the level count into the low three bits of a
//! page-aligned base pointer. Pages above level zero are arrays of child
//! page pointers; level-zero pages are arrays of fixed-size leaf records.
//! Each yielded leaf carries its table-wide index, computed from its
//! position in the page and how many leaf pages came before it. The first
//! invalid leaf ends its own page; sibling pages are unaffected.

use crate::config::Config;
use crate::error::{AsError, AsResult};
use crate::layers::{read_uint, AddressSpace};
use crate::object::MemoryObject;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use vtypes::Catalog;

/// Low bits of the descriptor carrying the level count.
const LEVEL_MASK: u64 = 7;

struct LeafPage {
    base: u64,
    position: u64,
    /// How many leaf pages were entered before this one.
    depth: u64,
}

pub struct TableWalker {
    catalog: Arc<Catalog>,
    space: Arc<dyn AddressSpace>,
    leaf_type: String,
    leaf_size: u64,
    page_size: u64,
    multiplier: u64,
    ptr_size: u64,
    /// Pointer pages still being enumerated: (base, level, next slot).
    frames: Vec<(u64, u64, u64)>,
    current: Option<LeafPage>,
    leaf_pages_entered: u64,
    visited: HashSet<u64>,
}

impl TableWalker {
    /// Start a walk of the table described by `table_code`, yielding
    /// `(index, leaf)` pairs of `leaf_type` records.
    pub fn new(
        catalog: Arc<Catalog>,
        space: Arc<dyn AddressSpace>,
        leaf_type: impl Into<String>,
        table_code: u64,
        config: &Config,
    ) -> AsResult<Self> {
        let leaf_type = leaf_type.into();
        let leaf_size = catalog.structure(&leaf_type)?.size;
        if leaf_size == 0 || leaf_size > config.table_page_size() {
            return Err(AsError::invalid_parameter(format!(
                "leaf type {} has size {}, which does not fit a {}-byte table page",
                leaf_type,
                leaf_size,
                config.table_page_size()
            )));
        }
        let ptr_size = catalog.pointer_size();

        let level = table_code & LEVEL_MASK;
        let base = table_code & !LEVEL_MASK;
        debug!("Table walk: base {:#x}, {} levels", base, level);

        let mut walker = TableWalker {
            catalog,
            space,
            leaf_type,
            leaf_size,
            page_size: config.table_page_size(),
            multiplier: config.index_multiplier(),
            ptr_size,
            frames: Vec::new(),
            current: None,
            leaf_pages_entered: 0,
            visited: HashSet::new(),
        };
        walker.visited.insert(base);
        if level == 0 {
            walker.enter_leaf_page(base);
        } else {
            walker.frames.push((base, level, 0));
        }
        Ok(walker)
    }

    fn page_capacity(&self) -> u64 {
        self.page_size / self.leaf_size
    }

    fn pointers_per_page(&self) -> u64 {
        self.page_size / self.ptr_size
    }

    fn enter_leaf_page(&mut self, base: u64) {
        self.current = Some(LeafPage {
            base,
            position: 0,
            depth: self.leaf_pages_entered,
        });
        self.leaf_pages_entered += 1;
    }
}

impl Iterator for TableWalker {
    /// Table-wide leaf index and the leaf record itself.
    type Item = (u64, MemoryObject);

    fn next(&mut self) -> Option<(u64, MemoryObject)> {
        loop {
            // Drain the current leaf page first.
            if let Some(page) = &self.current {
                let (base, position, depth) = (page.base, page.position, page.depth);
                if position >= self.page_capacity() {
                    self.current = None;
                    continue;
                }
                let addr = base + position * self.leaf_size;
                let leaf = MemoryObject::new(
                    self.leaf_type.clone(),
                    Arc::clone(&self.catalog),
                    Arc::clone(&self.space),
                    addr,
                );
                if !leaf.is_valid() {
                    debug!("Invalid leaf at {:#x} ends page {:#x}", addr, base);
                    self.current = None;
                    continue;
                }
                if let Some(page) = self.current.as_mut() {
                    page.position += 1;
                }
                let index = position + depth * self.page_capacity() * self.multiplier;
                return Some((index, leaf));
            }

            // Otherwise advance the innermost pointer page.
            let (base, level, slot) = match self.frames.last_mut() {
                Some(frame) => {
                    let snapshot = *frame;
                    frame.2 += 1;
                    snapshot
                }
                None => return None,
            };
            if slot >= self.pointers_per_page() {
                self.frames.pop();
                continue;
            }
            let at = base + slot * self.ptr_size;
            let child = match read_uint(self.space.as_ref(), at, self.ptr_size) {
                Ok(c) => c,
                Err(_) => {
                    self.frames.pop();
                    continue;
                }
            };
            if child == 0 || !self.visited.insert(child) {
                continue;
            }
            if level == 1 {
                self.enter_leaf_page(child);
            } else {
                self.frames.push((child, level - 1, 0));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::BufferLayer;
    use vtypes::{
        BaseKind, CatalogBuilder, FieldSpec, FieldView, Modification, SchemaTable, StructSchema,
        TypeDecl,
    };

    const PAGE_SIZE: u64 = 0x100;
    const LEAF_SIZE: u64 = 0x10;
    const MULTIPLIER: u64 = 4;
    const CAPACITY: u64 = PAGE_SIZE / LEAF_SIZE; // 16

    /// Leaf records are valid while their Object pointer is nonzero.
    fn catalog() -> Arc<Catalog> {
        let mut base = SchemaTable::new();
        base.insert(
            "_TABLE_ENTRY".to_string(),
            StructSchema::new(LEAF_SIZE)
                .with_field("Object", FieldSpec::new(0, TypeDecl::Pointer(None)))
                .with_field("Access", FieldSpec::new(8, TypeDecl::Base(BaseKind::U32))),
        );
        Arc::new(
            CatalogBuilder::new(8)
                .register_base(base)
                .register(Modification::new("entry-validity").validity(
                    "_TABLE_ENTRY",
                    Arc::new(|v: &dyn FieldView| v.field_u64("Object").is_some_and(|o| o != 0)),
                ))
                .build()
                .unwrap(),
        )
    }

    fn config() -> Config {
        Config::new()
            .with_table_page_size(PAGE_SIZE)
            .with_index_multiplier(MULTIPLIER)
    }

    struct TableBuilder {
        data: Vec<u8>,
    }

    impl TableBuilder {
        fn new() -> Self {
            TableBuilder {
                data: vec![0u8; 0x4000],
            }
        }

        fn pointer(&mut self, page: u64, slot: u64, value: u64) {
            let at = (page + slot * 8) as usize;
            self.data[at..at + 8].copy_from_slice(&value.to_le_bytes());
        }

        /// Fill `count` valid leaves at the start of a leaf page; the
        /// Access field records a recognizable value.
        fn leaves(&mut self, page: u64, count: u64) {
            for position in 0..count {
                let at = (page + position * LEAF_SIZE) as usize;
                self.data[at..at + 8].copy_from_slice(&(0x9000u64 + position).to_le_bytes());
                self.data[at + 8..at + 12]
                    .copy_from_slice(&((page as u32) + position as u32).to_le_bytes());
            }
        }

        fn walk(self, table_code: u64) -> Vec<u64> {
            let space: Arc<dyn AddressSpace> = Arc::new(BufferLayer::new("physical", self.data));
            TableWalker::new(catalog(), space, "_TABLE_ENTRY", table_code, &config())
                .unwrap()
                .map(|(index, _)| index)
                .collect()
        }
    }

    #[test]
    fn test_single_level_indices() {
        let mut t = TableBuilder::new();
        t.leaves(0x1000, 3);
        // Level 0: the descriptor points straight at the leaf page.
        assert_eq!(t.walk(0x1000), vec![0, 1, 2]);
    }

    #[test]
    fn test_two_level_index_formula() {
        let mut t = TableBuilder::new();
        // Level-1 page at 0x1000 pointing at two leaf pages.
        t.pointer(0x1000, 0, 0x2000);
        t.pointer(0x1000, 1, 0x3000);
        t.leaves(0x2000, 2);
        t.leaves(0x3000, 3);

        let stride = CAPACITY * MULTIPLIER; // 64
        assert_eq!(
            t.walk(0x1000 | 1),
            vec![0, 1, stride, stride + 1, stride + 2]
        );
    }

    #[test]
    fn test_invalid_leaf_ends_its_page_only() {
        let mut t = TableBuilder::new();
        t.pointer(0x1000, 0, 0x2000);
        t.pointer(0x1000, 1, 0x3000);
        t.leaves(0x2000, 2); // entries 2.. have a zero Object: invalid
        t.leaves(0x3000, 1);

        let stride = CAPACITY * MULTIPLIER;
        assert_eq!(t.walk(0x1000 | 1), vec![0, 1, stride]);
    }

    #[test]
    fn test_sparse_pointer_slots_skipped_but_depth_counts_pages() {
        let mut t = TableBuilder::new();
        // Slot 0 empty; slot 1 and 3 populated.
        t.pointer(0x1000, 1, 0x2000);
        t.pointer(0x1000, 3, 0x3000);
        t.leaves(0x2000, 1);
        t.leaves(0x3000, 1);

        // Depth counts enumerated leaf pages, not slots.
        let stride = CAPACITY * MULTIPLIER;
        assert_eq!(t.walk(0x1000 | 1), vec![0, stride]);
    }

    #[test]
    fn test_three_levels() {
        let mut t = TableBuilder::new();
        t.pointer(0x1000, 0, 0x1100); // level 2 -> level 1
        t.pointer(0x1100, 0, 0x2000); // level 1 -> leaves
        t.leaves(0x2000, 2);
        assert_eq!(t.walk(0x1000 | 2), vec![0, 1]);
    }

    #[test]
    fn test_cyclic_page_pointer_terminates() {
        let mut t = TableBuilder::new();
        t.pointer(0x1000, 0, 0x2000);
        t.pointer(0x1000, 1, 0x1000); // back at the root page
        t.leaves(0x2000, 1);
        assert_eq!(t.walk(0x1000 | 1), vec![0]);
    }

    #[test]
    fn test_zero_size_leaf_type_is_a_fault() {
        let mut base = SchemaTable::new();
        base.insert("_EMPTY".to_string(), StructSchema::new(0));
        let catalog = Arc::new(CatalogBuilder::new(8).register_base(base).build().unwrap());
        let space: Arc<dyn AddressSpace> =
            Arc::new(BufferLayer::new("physical", vec![0u8; 0x1000]));
        assert!(matches!(
            TableWalker::new(catalog, space, "_EMPTY", 0x100, &config()),
            Err(AsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_oversized_leaf_type_is_a_fault() {
        let mut base = SchemaTable::new();
        base.insert("_WIDE".to_string(), StructSchema::new(PAGE_SIZE * 2));
        let catalog = Arc::new(CatalogBuilder::new(8).register_base(base).build().unwrap());
        let space: Arc<dyn AddressSpace> =
            Arc::new(BufferLayer::new("physical", vec![0u8; 0x1000]));
        assert!(matches!(
            TableWalker::new(catalog, space, "_WIDE", 0x100, &config()),
            Err(AsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_leaf_payload_decodes() {
        let mut t = TableBuilder::new();
        t.leaves(0x1000, 1);
        let space: Arc<dyn AddressSpace> = Arc::new(BufferLayer::new("physical", t.data));
        let mut walker =
            TableWalker::new(catalog(), space, "_TABLE_ENTRY", 0x1000, &config()).unwrap();
        let (index, leaf) = walker.next().unwrap();
        assert_eq!(index, 0);
        assert_eq!(
            leaf.member("Object").object().unwrap().as_u64().unwrap(),
            0x9000
        );
    }
}
