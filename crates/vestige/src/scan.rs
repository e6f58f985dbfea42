//! Scanning heuristics.
//!
//! Suggestion sources lazily produce candidate offsets from a layer, so a
//! consumer that only needs the first viable candidate never pays for a
//! full-image scan. [`SignatureScanner`] is the provided implementation:
//! a chunked byte-signature search, optionally post-processed by an extract
//! function that turns a raw hit into the value of interest (a directory
//! table base read out of a structure near the hit, for instance).

use crate::layers::AddressSpace;
use memchr::memmem::Finder;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Lazy producer of candidate offsets from a layer.
pub trait SuggestionSource: Send + Sync {
    fn suggest(&self, layer: &Arc<dyn AddressSpace>) -> Box<dyn Iterator<Item = u64> + Send>;
}

/// Turns a raw signature hit into the suggested value; None drops the hit.
pub type ExtractFn = Arc<dyn Fn(&dyn AddressSpace, u64) -> Option<u64> + Send + Sync>;

/// Scan granularity. Chunks overlap by needle length minus one so hits
/// spanning a boundary are not lost.
const CHUNK_SIZE: u64 = 0x10000;

pub struct SignatureScanner {
    name: String,
    finder: Finder<'static>,
    needle_len: usize,
    extract: Option<ExtractFn>,
}

impl SignatureScanner {
    pub fn new(name: impl Into<String>, needle: &[u8]) -> Self {
        SignatureScanner {
            name: name.into(),
            finder: Finder::new(needle).into_owned(),
            needle_len: needle.len(),
            extract: None,
        }
    }

    pub fn with_extract(mut self, extract: ExtractFn) -> Self {
        self.extract = Some(extract);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SuggestionSource for SignatureScanner {
    fn suggest(&self, layer: &Arc<dyn AddressSpace>) -> Box<dyn Iterator<Item = u64> + Send> {
        debug!("Starting {} signature scan over {}", self.name, layer.name());
        let hits = ScanIter::new(Arc::clone(layer), self.finder.clone(), self.needle_len);
        match &self.extract {
            Some(f) => {
                let f = Arc::clone(f);
                let layer = Arc::clone(layer);
                Box::new(hits.filter_map(move |hit| f(layer.as_ref(), hit)))
            }
            None => Box::new(hits),
        }
    }
}

/// Chunked lazy scan over a layer. Unreadable chunks are skipped.
struct ScanIter {
    layer: Arc<dyn AddressSpace>,
    finder: Finder<'static>,
    needle_len: usize,
    next_offset: u64,
    end: u64,
    pending: VecDeque<u64>,
    done: bool,
}

impl ScanIter {
    fn new(layer: Arc<dyn AddressSpace>, finder: Finder<'static>, needle_len: usize) -> Self {
        let end = layer.maximum_address().saturating_add(1);
        ScanIter {
            layer,
            finder,
            needle_len,
            next_offset: 0,
            end,
            pending: VecDeque::new(),
            done: needle_len == 0,
        }
    }
}

impl Iterator for ScanIter {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        loop {
            if let Some(hit) = self.pending.pop_front() {
                return Some(hit);
            }
            if self.done || self.next_offset >= self.end {
                return None;
            }

            let read_len = CHUNK_SIZE.min(self.end - self.next_offset) as usize;
            // Advance by a needle length less than the chunk so boundary
            // hits land whole in the next chunk. Complete matches always
            // start below the advance point, so nothing repeats.
            let advance = if read_len > self.needle_len - 1 {
                read_len - (self.needle_len - 1)
            } else {
                read_len
            };

            if let Ok(data) = self.layer.read(self.next_offset, read_len) {
                let base = self.next_offset;
                for pos in self.finder.find_iter(&data) {
                    self.pending.push_back(base + pos as u64);
                }
            }

            self.next_offset += advance as u64;
        }
    }
}
