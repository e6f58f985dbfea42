//! Tagged binary tree walker.
//!
//! Nodes of the tree are instances of several concrete layouts; which one a
//! given node uses is announced by a fixed-size tag sitting immediately
//! before the node's nominal start. The walker resolves each node through
//! the catalog's tag family, yields it, then descends left subtree first.
//! An unknown tag or an invalid node stops that branch only.

use crate::error::{AsError, AsResult};
use crate::layers::{read_uint, AddressSpace};
use crate::object::MemoryObject;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use vtypes::{Catalog, TagFamily};

pub struct TreeWalker {
    catalog: Arc<Catalog>,
    space: Arc<dyn AddressSpace>,
    family: TagFamily,
    ptr_size: u64,
    stack: Vec<u64>,
    visited: HashSet<u64>,
}

impl TreeWalker {
    /// Start a preorder walk from the node at `root`, dispatching concrete
    /// node types through the named tag family.
    pub fn new(
        catalog: Arc<Catalog>,
        space: Arc<dyn AddressSpace>,
        family_name: &str,
        root: u64,
    ) -> AsResult<Self> {
        let family = catalog
            .tag_family(family_name)
            .cloned()
            .ok_or_else(|| {
                AsError::invalid_parameter(format!("unknown tag family {}", family_name))
            })?;
        let ptr_size = catalog.pointer_size();
        Ok(TreeWalker {
            catalog,
            space,
            family,
            ptr_size,
            stack: vec![root],
            visited: HashSet::new(),
        })
    }

    /// Resolve the concrete layout of the node at `addr` from its tag.
    fn resolve_type(&self, addr: u64) -> Option<String> {
        let tag_at = addr.checked_sub(self.family.tag_len)?;
        let tag = self.space.read(tag_at, self.family.tag_len as usize).ok()?;
        match self.family.map.get(&tag) {
            Some(name) => Some(name.clone()),
            None => {
                debug!(
                    "Unknown tag {:?} at {:#x}; branch stops",
                    String::from_utf8_lossy(&tag),
                    addr
                );
                None
            }
        }
    }

    fn child(&self, type_name: &str, node: u64, field: &str) -> Option<u64> {
        let offset = self.catalog.literal_offset(type_name, field).ok()?;
        read_uint(
            self.space.as_ref(),
            node.wrapping_add(offset as u64),
            self.ptr_size,
        )
        .ok()
    }
}

impl Iterator for TreeWalker {
    type Item = MemoryObject;

    fn next(&mut self) -> Option<MemoryObject> {
        while let Some(addr) = self.stack.pop() {
            if addr == 0 || !self.visited.insert(addr) {
                continue;
            }
            let type_name = match self.resolve_type(addr) {
                Some(t) => t,
                None => continue,
            };
            let node = MemoryObject::new(
                type_name.clone(),
                Arc::clone(&self.catalog),
                Arc::clone(&self.space),
                addr,
            );
            if !node.is_valid() {
                debug!("Invalid {} node at {:#x}; branch stops", type_name, addr);
                continue;
            }

            // Left first in a preorder walk, so it is pushed last.
            let left = self.child(&type_name, addr, self.family.left_field.as_str());
            let right = self.child(&type_name, addr, self.family.right_field.as_str());
            if let Some(right) = right {
                self.stack.push(right);
            }
            if let Some(left) = left {
                self.stack.push(left);
            }
            return Some(node);
        }
        None
    }
}
