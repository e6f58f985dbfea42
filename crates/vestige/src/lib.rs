//! Typed reconstruction of OS structures from raw memory images.
//!
//! An image is opened as a stack of address-space layers assembled by a
//! voting resolver: every registered layer factory is offered the current
//! stack in catalogue order, an acceptance restarts the scan, and the
//! tallest stack wins. Structures are then decoded through lazily-read
//! [`object::MemoryObject`]s whose layouts come from a `vtypes` catalog,
//! and walked with cycle-safe traversals. It provides:
//!
//! - [`layers`]: raw file/buffer layers, crash-dump run mapping, and
//!   4-level paged translation with LRU-cached table walks
//! - [`resolver`]: the voting layer-stack resolution algorithm and the
//!   standard factory catalogue
//! - [`object`]: lazily-decoded typed objects with absence propagation,
//!   tagged fast references and optional sub-records
//! - [`traverse`]: linked-list, tagged-tree and multi-level-table walkers
//! - [`validators`]: self-referential checks that accept or decline a
//!   candidate paged chain
//! - [`scan`]: lazy signature scanning for candidate offsets
//!
//! # Example
//!
//! ```rust,ignore
//! use vestige::config::Config;
//! use vestige::resolver::{self, CrashDumpFactory, FileLayerFactory, LayerFactory,
//!     PagedLayerFactory};
//! use vestige::validators::{ConsistencyChecks, SelfMapValidator};
//!
//! let config = Config::new()
//!     .with_location("file:///cases/host.dmp")
//!     .with_dtb(0x1aa000);
//! let catalogue: Vec<Box<dyn LayerFactory>> = vec![
//!     Box::new(FileLayerFactory),
//!     Box::new(CrashDumpFactory),
//!     Box::new(PagedLayerFactory::new(
//!         ConsistencyChecks::new().with(SelfMapValidator::for_slot(0x1ed)),
//!     )),
//! ];
//! let space = resolver::resolve(&catalogue, &config)?;
//! ```

pub mod config;
pub mod error;
pub mod layers;
pub mod object;
pub mod resolver;
pub mod scan;
pub mod traverse;
pub mod validators;

// Re-export key types at crate root.
pub use config::Config;
pub use error::{AsError, AsResult, Rejection};
pub use layers::{AddressSpace, BufferLayer, CrashDumpLayer, FileLayer, PagedLayer};
pub use object::{Member, MemoryObject};
pub use resolver::{resolve, Attempt, LayerFactory};
pub use scan::{SignatureScanner, SuggestionSource};
pub use traverse::{Direction, ListWalker, TableWalker, TreeWalker};
pub use validators::{ChainValidator, ConsistencyChecks, SelfMapValidator, SharedPageValidator};
