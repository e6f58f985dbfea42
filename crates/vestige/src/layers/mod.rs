//! Address-space layers.
//!
//! Layers stack innermost-first: a terminal raw layer (file or buffer) at
//! the bottom, with translating layers (crash-dump run mapping, paged
//! translation) wrapping it. Layers are immutable after construction and
//! never mutate their base; reads delegate downward through [`AddressSpace`].

mod buffer;
mod crashdump;
mod file;
mod paged;

pub use buffer::BufferLayer;
pub use crashdump::CrashDumpLayer;
pub use file::FileLayer;
pub use paged::PagedLayer;

#[cfg(test)]
pub(crate) use paged::tests::TableImage;

use crate::error::AsResult;
use std::sync::Arc;

/// Trait for reading from an address-space layer.
///
/// Abstracts the source of memory data so translators, scanners and objects
/// work against any stack of layers.
pub trait AddressSpace: Send + Sync {
    /// Read `length` bytes starting at `offset`.
    fn read(&self, offset: u64, length: usize) -> AsResult<Vec<u8>>;

    /// Check if the address range `[offset, offset+length)` is valid.
    fn is_valid(&self, offset: u64, length: u64) -> bool;

    /// The name of this layer.
    fn name(&self) -> &str;

    /// Maximum valid address in this layer.
    fn maximum_address(&self) -> u64;

    /// The layer this one reads through, if any. Terminal layers return None.
    fn base(&self) -> Option<&Arc<dyn AddressSpace>> {
        None
    }

    /// Translate an address in this layer to an address in the base layer.
    /// Identity on non-translating layers.
    fn translate(&self, addr: u64) -> AsResult<u64> {
        Ok(addr)
    }

    /// Whether this layer performs page-table translation. Used by factories
    /// to refuse stacking a paged layer on another paged layer.
    fn is_virtual(&self) -> bool {
        false
    }
}

/// Read a little-endian unsigned integer of `size` bytes (1, 2, 4 or 8).
pub(crate) fn read_uint(space: &dyn AddressSpace, offset: u64, size: u64) -> AsResult<u64> {
    let bytes = space.read(offset, size as usize)?;
    let mut buf = [0u8; 8];
    buf[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
    Ok(u64::from_le_bytes(buf))
}
