//! Layer-stack resolution by voting.
//!
//! Every registered factory is offered the current stack in catalogue
//! order. An acceptance pushes a new layer and restarts the scan from the
//! top of the catalogue, so factories that declined earlier get another
//! look at the taller stack. A full pass with no acceptance terminates:
//! whatever stack exists is the result, and an empty stack is a failure
//! that reports every factory's rejection reason from the failing pass.

use crate::config::Config;
use crate::error::{AsError, AsResult, Rejection};
use crate::layers::{AddressSpace, CrashDumpLayer, FileLayer, PagedLayer};
use crate::scan::SuggestionSource;
use crate::validators::ConsistencyChecks;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of one factory's construction attempt.
pub enum Attempt {
    Accepted(Arc<dyn AddressSpace>),
    /// The factory's self-test declined; resolution continues.
    Rejected(Rejection),
    /// A real fault (I/O, bad configuration); resolution aborts.
    Fault(AsError),
}

pub trait LayerFactory: Send + Sync {
    fn name(&self) -> &str;

    fn attempt(&self, base: Option<&Arc<dyn AddressSpace>>, config: &Config) -> Attempt;
}

/// Resolve the tallest layer stack the catalogue can build over the
/// configured image. Deterministic for a fixed image, config and
/// catalogue order.
pub fn resolve(
    catalogue: &[Box<dyn LayerFactory>],
    config: &Config,
) -> AsResult<Arc<dyn AddressSpace>> {
    let mut current: Option<Arc<dyn AddressSpace>> = None;

    loop {
        let mut rejections = Vec::new();
        let mut accepted = false;

        for factory in catalogue {
            match factory.attempt(current.as_ref(), config) {
                Attempt::Accepted(layer) => {
                    info!("Layer accepted: {} ({})", layer.name(), factory.name());
                    current = Some(layer);
                    accepted = true;
                    break;
                }
                Attempt::Rejected(rejection) => {
                    debug!("Layer rejected: {}", rejection);
                    rejections.push(rejection);
                }
                Attempt::Fault(e) => return Err(e),
            }
        }

        if !accepted {
            return match current {
                Some(layer) => Ok(layer),
                None => Err(AsError::NoAddressSpace {
                    reasons: rejections,
                }),
            };
        }
    }
}

/// Terminal raw layer from the configured location. Only ever the first
/// layer of a stack.
pub struct FileLayerFactory;

impl LayerFactory for FileLayerFactory {
    fn name(&self) -> &str {
        "file"
    }

    fn attempt(&self, base: Option<&Arc<dyn AddressSpace>>, config: &Config) -> Attempt {
        if base.is_some() {
            return Attempt::Rejected(Rejection::new(self.name(), "must be the first layer"));
        }
        let location = match config.location() {
            Some(l) => l,
            None => {
                return Attempt::Rejected(Rejection::new(self.name(), "no location configured"))
            }
        };
        match FileLayer::open("physical", location) {
            Ok(layer) => Attempt::Accepted(Arc::new(layer)),
            Err(e) => Attempt::Rejected(Rejection::new(self.name(), e.to_string())),
        }
    }
}

/// Crash-dump run mapping over a terminal raw layer whose header matches.
pub struct CrashDumpFactory;

impl LayerFactory for CrashDumpFactory {
    fn name(&self) -> &str {
        "crashdump"
    }

    fn attempt(&self, base: Option<&Arc<dyn AddressSpace>>, _config: &Config) -> Attempt {
        let base = match base {
            Some(b) => b,
            None => {
                return Attempt::Rejected(Rejection::new(self.name(), "requires a base layer"))
            }
        };
        if base.base().is_some() {
            return Attempt::Rejected(Rejection::new(
                self.name(),
                "base is not a terminal raw layer",
            ));
        }
        match CrashDumpLayer::probe("crashdump", Arc::clone(base)) {
            Ok(layer) => Attempt::Accepted(Arc::new(layer)),
            Err(rejection) => Attempt::Rejected(rejection),
        }
    }
}

/// Paged translation over a physical base. The directory table base comes
/// from the config override when present, otherwise candidates are pulled
/// lazily from the suggestion source; the first candidate the consistency
/// checks accept wins.
pub struct PagedLayerFactory {
    suggestions: Option<Arc<dyn SuggestionSource>>,
    checks: ConsistencyChecks,
}

impl PagedLayerFactory {
    pub fn new(checks: ConsistencyChecks) -> Self {
        PagedLayerFactory {
            suggestions: None,
            checks,
        }
    }

    pub fn with_suggestions(mut self, source: Arc<dyn SuggestionSource>) -> Self {
        self.suggestions = Some(source);
        self
    }
}

impl LayerFactory for PagedLayerFactory {
    fn name(&self) -> &str {
        "paged"
    }

    fn attempt(&self, base: Option<&Arc<dyn AddressSpace>>, config: &Config) -> Attempt {
        let base = match base {
            Some(b) => b,
            None => {
                return Attempt::Rejected(Rejection::new(self.name(), "requires a base layer"))
            }
        };
        if base.is_virtual() {
            return Attempt::Rejected(Rejection::new(self.name(), "base already translates"));
        }

        let configured = config.dtb().into_iter();
        let suggested = self
            .suggestions
            .as_ref()
            .map(|s| s.suggest(base))
            .unwrap_or_else(|| Box::new(std::iter::empty()));

        let mut tried = 0usize;
        for dtb in configured.chain(suggested) {
            tried += 1;
            let candidate = PagedLayer::new("paged", Arc::clone(base), dtb, config.cache_size());
            match self.checks.evaluate(&candidate) {
                Ok(()) => return Attempt::Accepted(Arc::new(candidate)),
                Err(reason) => {
                    debug!("Candidate dtb {:#x} rejected: {}", dtb, reason);
                }
            }
        }

        Attempt::Rejected(Rejection::new(
            self.name(),
            format!(
                "no directory table base candidate passed validation ({} tried)",
                tried
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{BufferLayer, TableImage};
    use crate::validators::SelfMapValidator;

    /// Test stand-in for the file factory: a terminal buffer layer.
    struct BufferFactory {
        data: Vec<u8>,
    }

    impl LayerFactory for BufferFactory {
        fn name(&self) -> &str {
            "buffer"
        }

        fn attempt(&self, base: Option<&Arc<dyn AddressSpace>>, _config: &Config) -> Attempt {
            if base.is_some() {
                return Attempt::Rejected(Rejection::new(self.name(), "must be the first layer"));
            }
            Attempt::Accepted(Arc::new(BufferLayer::new("physical", self.data.clone())))
        }
    }

    fn paged_catalogue(data: Vec<u8>) -> Vec<Box<dyn LayerFactory>> {
        vec![
            Box::new(BufferFactory { data }),
            Box::new(PagedLayerFactory::new(
                ConsistencyChecks::new().with(SelfMapValidator::for_slot(10)),
            )),
        ]
    }

    fn self_mapped_image() -> TableImage {
        let mut image = TableImage::new(0x20000, 0x1000);
        image.map(0x7000, 0x10000);
        image.self_map(10);
        image
    }

    #[test]
    fn test_voting_stacks_paged_over_raw() {
        let image = self_mapped_image();
        let config = Config::new().with_dtb(0x1000);

        let stack = resolve(&paged_catalogue(image.data.clone()), &config).unwrap();
        assert!(stack.is_virtual());
        assert_eq!(stack.name(), "paged");
        assert_eq!(stack.base().unwrap().name(), "physical");
        assert_eq!(stack.translate(0x7000).unwrap(), 0x10000);
    }

    #[test]
    fn test_partial_success_is_success() {
        // No dtb and no suggestions: the paged factory rejects every
        // round, leaving the raw layer as the result.
        let config = Config::new();
        let stack = resolve(&paged_catalogue(vec![0u8; 0x1000]), &config).unwrap();
        assert!(!stack.is_virtual());
        assert_eq!(stack.name(), "physical");
    }

    #[test]
    fn test_total_failure_reports_every_reason() {
        let catalogue: Vec<Box<dyn LayerFactory>> = vec![
            Box::new(FileLayerFactory),
            Box::new(CrashDumpFactory),
            Box::new(PagedLayerFactory::new(ConsistencyChecks::new())),
        ];
        let reasons = match resolve(&catalogue, &Config::new()) {
            Err(AsError::NoAddressSpace { reasons }) => reasons,
            Err(other) => panic!("expected NoAddressSpace, got: {}", other),
            Ok(_) => panic!("expected resolution to fail"),
        };
        assert_eq!(reasons.len(), 3);
        let layers: Vec<&str> = reasons.iter().map(|r| r.layer.as_str()).collect();
        assert_eq!(layers, vec!["file", "crashdump", "paged"]);
    }

    #[test]
    fn test_bad_dtb_falls_back_to_suggestions() {
        struct FixedSuggestions(Vec<u64>);
        impl SuggestionSource for FixedSuggestions {
            fn suggest(
                &self,
                _layer: &Arc<dyn AddressSpace>,
            ) -> Box<dyn Iterator<Item = u64> + Send> {
                Box::new(self.0.clone().into_iter())
            }
        }

        let image = self_mapped_image();
        let catalogue: Vec<Box<dyn LayerFactory>> = vec![
            Box::new(BufferFactory {
                data: image.data.clone(),
            }),
            Box::new(
                PagedLayerFactory::new(
                    ConsistencyChecks::new().with(SelfMapValidator::for_slot(10)),
                )
                .with_suggestions(Arc::new(FixedSuggestions(vec![0x5000, 0x1000]))),
            ),
        ];

        // Configured dtb is wrong; the second suggestion validates.
        let config = Config::new().with_dtb(0x14000);
        let stack = resolve(&catalogue, &config).unwrap();
        assert_eq!(stack.translate(0x7000).unwrap(), 0x10000);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let image = self_mapped_image();
        let config = Config::new().with_dtb(0x1000);
        let a = resolve(&paged_catalogue(image.data.clone()), &config).unwrap();
        let b = resolve(&paged_catalogue(image.data.clone()), &config).unwrap();
        assert_eq!(a.name(), b.name());
        assert_eq!(a.translate(0x7123).unwrap(), b.translate(0x7123).unwrap());
    }

    #[test]
    fn test_crashdump_then_paged_stack() {
        // Physical content with page tables, packaged as a crash dump with
        // a single run covering pages 0..32.
        let image = self_mapped_image();
        let pages = (image.data.len() / 0x1000) as u32;
        let mut dump = vec![0u8; 0x1000 + image.data.len()];
        dump[0..4].copy_from_slice(b"PAGE");
        dump[4..8].copy_from_slice(b"DUMP");
        dump[0x64..0x68].copy_from_slice(&1u32.to_le_bytes());
        dump[0x68..0x6c].copy_from_slice(&pages.to_le_bytes());
        dump[0x6c..0x70].copy_from_slice(&0u32.to_le_bytes());
        dump[0x70..0x74].copy_from_slice(&pages.to_le_bytes());
        dump[0x1000..].copy_from_slice(&image.data);

        let catalogue: Vec<Box<dyn LayerFactory>> = vec![
            Box::new(BufferFactory { data: dump }),
            Box::new(CrashDumpFactory),
            Box::new(PagedLayerFactory::new(
                ConsistencyChecks::new().with(SelfMapValidator::for_slot(10)),
            )),
        ];
        let config = Config::new().with_dtb(0x1000);
        let stack = resolve(&catalogue, &config).unwrap();

        // Three layers tall: paged over crashdump over the raw buffer.
        assert!(stack.is_virtual());
        let middle = stack.base().unwrap();
        assert_eq!(middle.name(), "crashdump");
        assert!(middle.base().is_some());
        assert_eq!(stack.translate(0x7000).unwrap(), 0x10000);
    }
}
