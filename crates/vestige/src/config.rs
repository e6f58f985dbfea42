//! Session configuration.
//!
//! An immutable option bag threaded unchanged through every layer
//! construction attempt, so a factory probing late in resolution sees the
//! same options as one probing first.

/// Configuration for opening an image and decoding objects out of it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Raw image location: a `file://` URL or plain filesystem path.
    location: Option<String>,
    /// Directory table base override. When set, paged-layer probing tries
    /// this value before consulting any suggestion source.
    dtb: Option<u64>,
    /// Layout profile name to select in the catalogue.
    profile: Option<String>,
    /// Table page size in bytes for the multi-level table walker.
    table_page_size: u64,
    /// Index multiplier for the table walker's leaf index formula.
    index_multiplier: u64,
    /// Entry/table LRU cache size for paged translation.
    cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            location: None,
            dtb: None,
            profile: None,
            table_page_size: 4096,
            index_multiplier: 4,
            cache_size: 1024,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_dtb(mut self, dtb: u64) -> Self {
        self.dtb = Some(dtb);
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn with_table_page_size(mut self, size: u64) -> Self {
        self.table_page_size = size;
        self
    }

    pub fn with_index_multiplier(mut self, multiplier: u64) -> Self {
        self.index_multiplier = multiplier;
        self
    }

    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn dtb(&self) -> Option<u64> {
        self.dtb
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    pub fn table_page_size(&self) -> u64 {
        self.table_page_size
    }

    pub fn index_multiplier(&self) -> u64 {
        self.index_multiplier
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }
}
