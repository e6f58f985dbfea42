//! 4-level paged address translation.
//!
//! Walks page tables rooted at a directory table base, with LRU caching of
//! entries and whole tables. Derived chains (per-process views) are built by
//! constructing another `PagedLayer` over the same base with a different
//! directory table base; each owns its own caches.

use crate::error::{AsError, AsResult};
use crate::layers::AddressSpace;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Page table entry flags.
const PAGE_PRESENT: u64 = 1 << 0;
const PAGE_PSE: u64 = 1 << 7; // large page
const PAGE_PAT_LARGE: u64 = 1 << 12; // PAT bit inside large-page entries

const PAGE_SIZE_4K: u64 = 4096;

/// Table levels, outermost first: (index bits, may terminate in a large page).
const STRUCTURE: [(u32, bool); 4] = [
    (9, false), // level 4 map
    (9, true),  // directory pointer, 1GB pages
    (9, true),  // directory, 2MB pages
    (9, false), // table
];

const MAXPHYADDR: u32 = 52;
const MAXVIRTADDR: u32 = 48;
const PAGE_SHIFT: u32 = 12;
const ENTRY_SIZE: usize = 8;

/// Cached entry: (raw entry, bit position of the page boundary).
type CacheEntry = (u64, u32);

pub struct PagedLayer {
    name: String,
    base: Arc<dyn AddressSpace>,
    dtb: u64,
    entry_cache: Mutex<LruCache<u64, CacheEntry>>,
    table_cache: Mutex<LruCache<u64, Option<Vec<u8>>>>,
    initial_entry: u64,
    initial_position: u32,
}

impl PagedLayer {
    pub fn new(
        name: impl Into<String>,
        base: Arc<dyn AddressSpace>,
        dtb: u64,
        cache_size: usize,
    ) -> Self {
        let initial_position = MAXVIRTADDR - 1;
        let initial_entry = mask(dtb, initial_position, 0) | PAGE_PRESENT;
        let entries = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::new(1024).unwrap());
        let tables = NonZeroUsize::new(cache_size + 1).unwrap_or(NonZeroUsize::new(1025).unwrap());

        PagedLayer {
            name: name.into(),
            base,
            dtb,
            entry_cache: Mutex::new(LruCache::new(entries)),
            table_cache: Mutex::new(LruCache::new(tables)),
            initial_entry,
            initial_position,
        }
    }

    pub fn directory_table_base(&self) -> u64 {
        self.dtb
    }

    fn address_mask(&self) -> u64 {
        (1u64 << MAXVIRTADDR) - 1
    }

    /// Fetch a whole page table, caching the result. A table whose entries
    /// are all identical carries no information and is treated as invalid.
    fn get_valid_table(&self, base_address: u64) -> Option<Vec<u8>> {
        {
            let mut cache = self.table_cache.lock();
            if let Some(cached) = cache.get(&base_address) {
                return cached.clone();
            }
        }

        let table = match self.base.read(base_address, PAGE_SIZE_4K as usize) {
            Ok(t) => t,
            Err(_) => {
                self.table_cache.lock().put(base_address, None);
                return None;
            }
        };

        if table.len() >= ENTRY_SIZE {
            let first = &table[..ENTRY_SIZE];
            if table.chunks_exact(ENTRY_SIZE).all(|chunk| chunk == first) {
                self.table_cache.lock().put(base_address, None);
                return None;
            }
        }

        self.table_cache.lock().put(base_address, Some(table.clone()));
        Some(table)
    }

    /// Walk the page tables for one page address.
    fn translate_entry(&self, page_address: u64) -> AsResult<CacheEntry> {
        {
            let mut cache = self.entry_cache.lock();
            if let Some(cached) = cache.get(&page_address) {
                return Ok(*cached);
            }
        }

        if page_address & self.address_mask() > max_virtual_address() {
            return Err(AsError::paged_invalid_address(
                &self.name,
                page_address,
                self.initial_position + 1,
                self.initial_entry,
                "Entry outside virtual address range",
            ));
        }

        let mut position = self.initial_position;
        let mut entry = self.initial_entry;

        for (size, large_page) in STRUCTURE.iter() {
            if !entry_is_present(entry) {
                return Err(AsError::paged_invalid_address(
                    &self.name,
                    page_address,
                    position + 1,
                    entry,
                    format!("Page fault at entry {:#x}", entry),
                ));
            }

            // 8-byte entries, so the table base is aligned to size+3 bits.
            let base_address = mask(entry, MAXPHYADDR - 1, *size + 3);
            let table = match self.get_valid_table(base_address) {
                Some(t) => t,
                None => {
                    return Err(AsError::paged_invalid_address(
                        &self.name,
                        page_address,
                        position + 1,
                        entry,
                        format!("Page fault at entry {:#x}", entry),
                    ));
                }
            };

            let start = position;
            position -= size;
            let index = (mask(page_address, start, position + 1) >> (position + 1)) as usize;

            let entry_offset = index * ENTRY_SIZE;
            if entry_offset + ENTRY_SIZE > table.len() {
                return Err(AsError::paged_invalid_address(
                    &self.name,
                    page_address,
                    position + 1,
                    entry,
                    "Entry offset out of bounds",
                ));
            }
            entry = u64::from_le_bytes(
                table[entry_offset..entry_offset + ENTRY_SIZE]
                    .try_into()
                    .unwrap(),
            );

            if *large_page && (entry & PAGE_PSE) != 0 {
                if entry & PAGE_PAT_LARGE != 0 {
                    entry -= PAGE_PAT_LARGE;
                }
                break;
            }
        }

        let result = (entry, position);
        self.entry_cache.lock().put(page_address, result);
        Ok(result)
    }

    /// Translate one virtual address: (physical address, page size).
    fn translate_impl(&self, offset: u64) -> AsResult<(u64, u64)> {
        let page_address = offset & !((1u64 << PAGE_SHIFT) - 1);
        let (entry, position) = self.translate_entry(page_address)?;

        if !entry_is_present(entry) {
            return Err(AsError::paged_invalid_address(
                &self.name,
                offset,
                position + 1,
                entry,
                format!("Page fault at entry {:#x}", entry),
            ));
        }

        let pfn = mask(entry, MAXPHYADDR - 1, 0) >> PAGE_SHIFT;
        let page_offset = mask(offset, position, 0);
        let physical = (pfn << PAGE_SHIFT) | page_offset;
        let page_size = 1u64 << (position + 1);
        Ok((physical, page_size))
    }

    /// Map a virtual range to physical chunks: (offset, length, mapped offset).
    /// With `ignore_errors`, unmapped pages are skipped by their invalid-bits
    /// stride and appear as gaps in the result.
    pub fn mapping_ranges(
        &self,
        offset: u64,
        length: u64,
        ignore_errors: bool,
    ) -> AsResult<Vec<(u64, u64, u64)>> {
        let mut results = Vec::new();
        let mut remaining = length;
        let mut current = offset;

        while remaining > 0 {
            match self.translate_impl(current) {
                Ok((physical, page_size)) => {
                    let page_offset = current % page_size;
                    let chunk = (page_size - page_offset).min(remaining);
                    results.push((current, chunk, physical));
                    current += chunk;
                    remaining -= chunk;
                }
                Err(e) => {
                    if !ignore_errors {
                        return Err(e);
                    }
                    let skip = match &e {
                        AsError::PagedInvalidAddress { invalid_bits, .. } => {
                            let skip_mask = (1u64 << invalid_bits) - 1;
                            skip_mask + 1 - (current & skip_mask)
                        }
                        _ => PAGE_SIZE_4K - (current % PAGE_SIZE_4K),
                    };
                    let skip = skip.min(remaining);
                    current += skip;
                    remaining -= skip;
                }
            }
        }

        Ok(results)
    }

    /// Read a virtual range, padding unmapped gaps with zeros when `pad`.
    pub fn read_virtual(&self, offset: u64, length: usize, pad: bool) -> AsResult<Vec<u8>> {
        let mut output = Vec::with_capacity(length);
        let mut current = offset;

        for (chunk_offset, chunk_length, mapped) in
            self.mapping_ranges(offset, length as u64, pad)?
        {
            if chunk_offset > current {
                if !pad {
                    return Err(AsError::invalid_address(
                        &self.name,
                        current,
                        format!("Layer {} cannot map offset {:#x}", self.name, current),
                    ));
                }
                output.resize(output.len() + (chunk_offset - current) as usize, 0);
                current = chunk_offset;
            }
            output.extend_from_slice(&self.base.read(mapped, chunk_length as usize)?);
            current += chunk_length;
        }

        if pad && output.len() < length {
            output.resize(length, 0);
        }
        Ok(output)
    }
}

impl AddressSpace for PagedLayer {
    fn read(&self, offset: u64, length: usize) -> AsResult<Vec<u8>> {
        self.read_virtual(offset, length, false)
    }

    fn is_valid(&self, offset: u64, length: u64) -> bool {
        self.mapping_ranges(offset, length, false).is_ok()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn maximum_address(&self) -> u64 {
        max_virtual_address()
    }

    fn base(&self) -> Option<&Arc<dyn AddressSpace>> {
        Some(&self.base)
    }

    fn translate(&self, addr: u64) -> AsResult<u64> {
        self.translate_impl(addr).map(|(physical, _)| physical)
    }

    fn is_virtual(&self) -> bool {
        true
    }
}

/// Mask of `value` keeping bits high_bit..=low_bit.
#[inline]
fn mask(value: u64, high_bit: u32, low_bit: u32) -> u64 {
    let high_mask = if high_bit >= 63 {
        u64::MAX
    } else {
        (1u64 << (high_bit + 1)).wrapping_sub(1)
    };
    let low_mask = if low_bit >= 64 {
        u64::MAX
    } else {
        (1u64 << low_bit).wrapping_sub(1)
    };
    value & (high_mask ^ low_mask)
}

#[inline]
fn entry_is_present(entry: u64) -> bool {
    entry & PAGE_PRESENT != 0
}

fn max_virtual_address() -> u64 {
    (1u64 << MAXVIRTADDR) - 1
}
