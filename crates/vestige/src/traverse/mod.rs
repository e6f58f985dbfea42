//! Cycle-safe traversals over linked structures in an image.
//!
//! Memory under reconstruction is adversarial: links can be corrupted into
//! cycles or point at garbage. Every walker here is a lazy, restartable
//! [`Iterator`] sharing one discipline: a visited set seeded with the start,
//! a membership-and-validity check before anything is yielded, and bounds
//! on nothing but memory. A revisited address ends that path; it is never
//! an error.

mod list;
mod table;
mod tree;

pub use list::{Direction, ListWalker};
pub use table::TableWalker;
pub use tree::TreeWalker;
