//! Crash-dump layer.
//!
//! Wraps a raw layer whose content is a full-memory crash dump: a one-page
//! header carrying the `PAGE`/`DUMP` signature pair and a table of physical
//! memory runs, followed by the run pages back to back. This layer exposes
//! the physical address space, translating physical addresses through the
//! run table into file offsets past the header.

use crate::error::{AsError, AsResult, Rejection};
use crate::layers::{read_uint, AddressSpace};
use std::sync::Arc;
use tracing::debug;

const SIG_FIRST: &[u8; 4] = b"PAGE";
const SIG_SECOND: &[u8; 4] = b"DUMP";
/// Offset of the physical memory run table within the header.
const RUN_TABLE_OFFSET: u64 = 0x64;
/// Header occupies exactly one page; run data starts right after it.
const HEADER_SIZE: u64 = 0x1000;
const PAGE_SIZE: u64 = 0x1000;
const PAGE_SHIFT: u32 = 12;

#[derive(Debug, Clone, Copy)]
struct Run {
    /// First physical page of the run.
    base_page: u64,
    page_count: u64,
    /// File page (past the header) where this run's data starts.
    file_page: u64,
}

pub struct CrashDumpLayer {
    name: String,
    base: Arc<dyn AddressSpace>,
    runs: Vec<Run>,
}

impl CrashDumpLayer {
    /// Probe the base layer for a crash-dump header. A missing or
    /// malformed header is a rejection, not a fault: the image is simply
    /// not in this format.
    pub fn probe(name: impl Into<String>, base: Arc<dyn AddressSpace>) -> Result<Self, Rejection> {
        let name = name.into();
        let reject = |reason: String| Rejection::new(&name, reason);

        let sig = base
            .read(0, 8)
            .map_err(|e| reject(format!("header unreadable: {}", e)))?;
        if &sig[0..4] != SIG_FIRST || &sig[4..8] != SIG_SECOND {
            return Err(reject("header signature mismatch".to_string()));
        }

        let number_of_runs = read_uint(base.as_ref(), RUN_TABLE_OFFSET, 4)
            .map_err(|e| reject(format!("run table unreadable: {}", e)))?;
        let number_of_pages = read_uint(base.as_ref(), RUN_TABLE_OFFSET + 4, 4)
            .map_err(|e| reject(format!("run table unreadable: {}", e)))?;
        if number_of_runs == 0 || number_of_runs > 0x100 {
            return Err(reject(format!(
                "implausible run count {}",
                number_of_runs
            )));
        }

        let mut runs = Vec::with_capacity(number_of_runs as usize);
        let mut file_page = HEADER_SIZE >> PAGE_SHIFT;
        let mut total_pages = 0u64;
        for i in 0..number_of_runs {
            let entry = RUN_TABLE_OFFSET + 8 + i * 8;
            let base_page = read_uint(base.as_ref(), entry, 4)
                .map_err(|e| reject(format!("run {} unreadable: {}", i, e)))?;
            let page_count = read_uint(base.as_ref(), entry + 4, 4)
                .map_err(|e| reject(format!("run {} unreadable: {}", i, e)))?;
            if page_count == 0 {
                return Err(reject(format!("run {} has zero pages", i)));
            }
            runs.push(Run {
                base_page,
                page_count,
                file_page,
            });
            file_page += page_count;
            total_pages += page_count;
        }
        if total_pages != number_of_pages {
            return Err(reject(format!(
                "run table inconsistent: runs cover {} pages, header claims {}",
                total_pages, number_of_pages
            )));
        }

        debug!(
            "Crash dump header accepted: {} runs, {} pages",
            number_of_runs, number_of_pages
        );
        Ok(CrashDumpLayer { name, base, runs })
    }

    /// Map a physical address to a file offset through the run table.
    fn translate_impl(&self, addr: u64) -> AsResult<u64> {
        let page = addr >> PAGE_SHIFT;
        for run in &self.runs {
            if page >= run.base_page && page < run.base_page + run.page_count {
                let file_page = run.file_page + (page - run.base_page);
                return Ok((file_page << PAGE_SHIFT) | (addr & (PAGE_SIZE - 1)));
            }
        }
        Err(AsError::invalid_address(
            &self.name,
            addr,
            "Physical address not covered by any memory run",
        ))
    }
}

impl AddressSpace for CrashDumpLayer {
    fn read(&self, offset: u64, length: usize) -> AsResult<Vec<u8>> {
        // Runs need not be contiguous in physical space, so reads go page
        // by page through the run table.
        let mut output = Vec::with_capacity(length);
        let mut current = offset;
        let mut remaining = length as u64;
        while remaining > 0 {
            let file_offset = self.translate_impl(current)?;
            let in_page = PAGE_SIZE - (current & (PAGE_SIZE - 1));
            let chunk = in_page.min(remaining);
            output.extend_from_slice(&self.base.read(file_offset, chunk as usize)?);
            current += chunk;
            remaining -= chunk;
        }
        Ok(output)
    }

    fn is_valid(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return false;
        }
        let mut current = offset;
        let end = match offset.checked_add(length) {
            Some(e) => e,
            None => return false,
        };
        while current < end {
            match self.translate_impl(current) {
                Ok(file_offset) => {
                    let in_page = PAGE_SIZE - (current & (PAGE_SIZE - 1));
                    let chunk = in_page.min(end - current);
                    if !self.base.is_valid(file_offset, chunk) {
                        return false;
                    }
                    current += chunk;
                }
                Err(_) => return false,
            }
        }
        true
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn maximum_address(&self) -> u64 {
        self.runs
            .iter()
            .map(|r| ((r.base_page + r.page_count) << PAGE_SHIFT) - 1)
            .max()
            .unwrap_or(0)
    }

    fn base(&self) -> Option<&Arc<dyn AddressSpace>> {
        Some(&self.base)
    }

    fn translate(&self, addr: u64) -> AsResult<u64> {
        self.translate_impl(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::BufferLayer;

    /// Build a synthetic dump: header page plus the run pages, each run
    /// page filled with a marker byte derived from its physical page.
    fn synthetic_dump(runs: &[(u32, u32)]) -> Vec<u8> {
        let total_pages: u32 = runs.iter().map(|(_, c)| c).sum();
        let mut data = vec![0u8; (HEADER_SIZE + (total_pages as u64) * PAGE_SIZE) as usize];
        data[0..4].copy_from_slice(SIG_FIRST);
        data[4..8].copy_from_slice(SIG_SECOND);
        let rt = RUN_TABLE_OFFSET as usize;
        data[rt..rt + 4].copy_from_slice(&(runs.len() as u32).to_le_bytes());
        data[rt + 4..rt + 8].copy_from_slice(&total_pages.to_le_bytes());
        let mut file_page = 1u64;
        for (i, (base_page, page_count)) in runs.iter().enumerate() {
            let entry = rt + 8 + i * 8;
            data[entry..entry + 4].copy_from_slice(&base_page.to_le_bytes());
            data[entry + 4..entry + 8].copy_from_slice(&page_count.to_le_bytes());
            for p in 0..*page_count {
                let marker = (base_page + p) as u8;
                let start = (file_page + p as u64) as usize * PAGE_SIZE as usize;
                data[start..start + PAGE_SIZE as usize].fill(marker);
            }
            file_page += *page_count as u64;
        }
        data
    }

    #[test]
    fn test_probe_rejects_bad_signature() {
        let base = Arc::new(BufferLayer::new("raw", vec![0u8; 0x2000]));
        let rejection = match CrashDumpLayer::probe("crashdump", base) {
            Err(r) => r,
            Ok(_) => panic!("expected the probe to decline"),
        };
        assert!(rejection.reason.contains("signature"));
    }

    #[test]
    fn test_run_mapping_with_gap() {
        // Two runs: pages 0-1 and pages 4-5, leaving a hole at 2-3.
        let base = Arc::new(BufferLayer::new("raw", synthetic_dump(&[(0, 2), (4, 2)])));
        let layer = CrashDumpLayer::probe("crashdump", base).unwrap();

        // Page 0 data sits right after the header.
        assert_eq!(layer.translate(0).unwrap(), 0x1000);
        assert_eq!(layer.translate(0x1234).unwrap(), 0x2234);
        // Page 4 is the third data page in the file.
        assert_eq!(layer.translate(0x4000).unwrap(), 0x3000);
        assert_eq!(layer.translate(0x5abc).unwrap(), 0x4abc);
        // The hole is unmapped.
        assert!(layer.translate(0x2000).is_err());
        assert!(!layer.is_valid(0x2000, 1));
        assert!(layer.is_valid(0x5000, 0x1000));

        // Read markers confirm the mapping.
        assert_eq!(layer.read(0x1000, 1).unwrap(), vec![1]);
        assert_eq!(layer.read(0x4fff, 1).unwrap(), vec![4]);
        assert_eq!(layer.read(0x4fff, 2).unwrap(), vec![4, 5]);
    }

    #[test]
    fn test_read_across_run_boundary_in_hole_fails() {
        let base = Arc::new(BufferLayer::new("raw", synthetic_dump(&[(0, 2), (4, 2)])));
        let layer = CrashDumpLayer::probe("crashdump", base).unwrap();
        assert!(layer.read(0x1ff0, 0x20).is_err());
    }

    #[test]
    fn test_probe_rejects_inconsistent_run_table() {
        let mut data = synthetic_dump(&[(0, 2)]);
        // Claim 3 pages while the single run covers 2.
        let rt = RUN_TABLE_OFFSET as usize;
        data[rt + 4..rt + 8].copy_from_slice(&3u32.to_le_bytes());
        let base = Arc::new(BufferLayer::new("raw", data));
        let rejection = match CrashDumpLayer::probe("crashdump", base) {
            Err(r) => r,
            Ok(_) => panic!("expected the probe to decline"),
        };
        assert!(rejection.reason.contains("inconsistent"));
    }

    #[test]
    fn test_maximum_address() {
        let base = Arc::new(BufferLayer::new("raw", synthetic_dump(&[(0, 2), (4, 2)])));
        let layer = CrashDumpLayer::probe("crashdump", base).unwrap();
        assert_eq!(layer.maximum_address(), 0x6000 - 1);
    }
}
