//! Self-referential translation validators.
//!
//! A candidate paged chain is checked against properties that hold for a
//! correctly rooted translation and almost never for a misrooted one. Each
//! check is independent; a translation failure inside one check is a soft
//! signal and falls through to the next. The candidate is rejected only
//! when every check declines.

use crate::layers::{AddressSpace, PagedLayer};
use tracing::debug;

const PAGE_MASK: u64 = !0xfff;
/// Index bits per page-table level, used to build recursive-entry addresses.
const LEVEL_BITS: u32 = 9;
const PAGE_SHIFT: u32 = 12;
const LEVELS: u32 = 4;

/// Boolean verdict over a candidate paged chain.
pub trait ChainValidator: Send + Sync {
    fn name(&self) -> &str;

    /// Ok to accept the candidate, Err with a reason to decline.
    fn validate(&self, layer: &PagedLayer) -> Result<(), String>;
}

/// Accepts when the self-referencing table entry translates back to the
/// chain's own directory table base.
pub struct SelfMapValidator {
    self_map_address: u64,
}

impl SelfMapValidator {
    pub fn new(self_map_address: u64) -> Self {
        SelfMapValidator { self_map_address }
    }

    /// The virtual address that resolves to the root table itself when the
    /// root's `slot` entry points back at the root: every level's index is
    /// `slot` and the page offset is zero.
    pub fn for_slot(slot: u64) -> Self {
        let mut address = 0u64;
        for level in 0..LEVELS {
            address |= slot << (PAGE_SHIFT + level * LEVEL_BITS);
        }
        SelfMapValidator::new(address)
    }
}

impl ChainValidator for SelfMapValidator {
    fn name(&self) -> &str {
        "self-map"
    }

    fn validate(&self, layer: &PagedLayer) -> Result<(), String> {
        let physical = layer
            .translate(self.self_map_address)
            .map_err(|e| format!("self-map address does not translate: {}", e))?;
        let dtb_page = layer.directory_table_base() & PAGE_MASK;
        if physical & PAGE_MASK == dtb_page {
            Ok(())
        } else {
            Err(format!(
                "self-map resolves to {:#x}, not the table root {:#x}",
                physical, dtb_page
            ))
        }
    }
}

/// Accepts when two virtual addresses known to share one physical page
/// both translate, to the same page.
pub struct SharedPageValidator {
    first: u64,
    second: u64,
}

impl SharedPageValidator {
    pub fn new(first: u64, second: u64) -> Self {
        SharedPageValidator { first, second }
    }
}

impl ChainValidator for SharedPageValidator {
    fn name(&self) -> &str {
        "shared-page"
    }

    fn validate(&self, layer: &PagedLayer) -> Result<(), String> {
        let first = layer
            .translate(self.first)
            .map_err(|e| format!("first shared address does not translate: {}", e))?;
        let second = layer
            .translate(self.second)
            .map_err(|e| format!("second shared address does not translate: {}", e))?;
        if first & PAGE_MASK == second & PAGE_MASK {
            Ok(())
        } else {
            Err(format!(
                "shared addresses resolve to distinct pages {:#x} and {:#x}",
                first & PAGE_MASK,
                second & PAGE_MASK
            ))
        }
    }
}

/// Runs validators in order, accepting on the first pass. An empty check
/// list accepts everything.
#[derive(Default)]
pub struct ConsistencyChecks {
    checks: Vec<Box<dyn ChainValidator>>,
}

impl ConsistencyChecks {
    pub fn new() -> Self {
        ConsistencyChecks::default()
    }

    pub fn with(mut self, check: impl ChainValidator + 'static) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    /// Ok when any check accepts; Err joining every reason otherwise.
    pub fn evaluate(&self, layer: &PagedLayer) -> Result<(), String> {
        if self.checks.is_empty() {
            return Ok(());
        }
        let mut reasons = Vec::new();
        for check in &self.checks {
            match check.validate(layer) {
                Ok(()) => {
                    debug!(
                        "Candidate dtb {:#x} accepted by {}",
                        layer.directory_table_base(),
                        check.name()
                    );
                    return Ok(());
                }
                Err(reason) => {
                    debug!(
                        "Candidate dtb {:#x} declined by {}: {}",
                        layer.directory_table_base(),
                        check.name(),
                        reason
                    );
                    reasons.push(format!("{}: {}", check.name(), reason));
                }
            }
        }
        Err(reasons.join("; "))
    }
}
