//! Doubly-linked circular list walker.
//!
//! Elements embed a two-pointer link record (forward at word 0, backward at
//! word one) at a known offset; the list head is a bare link record outside
//! any element. Walking yields the containing elements: each visited link
//! pointer is rewound by the link field's offset to find the element base.

use crate::error::AsResult;
use crate::layers::{read_uint, AddressSpace};
use crate::object::MemoryObject;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use vtypes::Catalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

pub struct ListWalker {
    catalog: Arc<Catalog>,
    space: Arc<dyn AddressSpace>,
    element_type: String,
    /// Literal offset of the embedded link record within the element.
    link_offset: i64,
    direction: Direction,
    ptr_size: u64,
    next_link: Option<u64>,
    visited: HashSet<u64>,
}

impl ListWalker {
    /// Start a walk from the list head at `head`, yielding elements of
    /// `element_type` whose `link_field` embeds the link record.
    pub fn new(
        catalog: Arc<Catalog>,
        space: Arc<dyn AddressSpace>,
        element_type: impl Into<String>,
        link_field: &str,
        head: u64,
        direction: Direction,
    ) -> AsResult<Self> {
        let element_type = element_type.into();
        let link_offset = catalog.literal_offset(&element_type, link_field)?;
        let ptr_size = catalog.pointer_size();

        let mut walker = ListWalker {
            catalog,
            space,
            element_type,
            link_offset,
            direction,
            ptr_size,
            next_link: None,
            visited: HashSet::new(),
        };
        // The head is a link record, not an element: mark it visited so a
        // complete circle terminates, and step off it immediately.
        walker.visited.insert(head);
        walker.next_link = walker.follow(head);
        Ok(walker)
    }

    /// Read the next link pointer out of a link record.
    fn follow(&self, link: u64) -> Option<u64> {
        let at = match self.direction {
            Direction::Forward => link,
            Direction::Backward => link + self.ptr_size,
        };
        read_uint(self.space.as_ref(), at, self.ptr_size).ok()
    }
}

impl Iterator for ListWalker {
    type Item = MemoryObject;

    fn next(&mut self) -> Option<MemoryObject> {
        let link = self.next_link.take()?;

        if link == 0 || !self.space.is_valid(link, self.ptr_size * 2) {
            debug!("List walk stopped at invalid link {:#x}", link);
            return None;
        }
        if !self.visited.insert(link) {
            debug!("List walk closed its cycle at {:#x}", link);
            return None;
        }

        let element_base = link.wrapping_sub(self.link_offset as u64);
        let element = MemoryObject::new(
            self.element_type.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&self.space),
            element_base,
        );
        self.next_link = self.follow(link);
        Some(element)
    }
}
