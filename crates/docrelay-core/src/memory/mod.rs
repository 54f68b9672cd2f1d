//! In-memory backends for tests and embedding.
//!
//! Every collaborator trait has an implementation here built on `HashMap`
//! and `Vec` behind `std::sync` locks. Each one also exposes call counters
//! and failure switches so tests can assert exactly which side effects a
//! pipeline step performed.

mod index;
mod queue;
mod store;

pub use index::MemoryIndex;
pub use queue::{MemoryDeadLetters, MemoryQueue};
pub use store::MemoryObjectStore;
