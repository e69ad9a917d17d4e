//! Utility modules: in-memory storage, hint cache, and validation helpers

pub mod hint_cache;
pub mod memory_store;
pub mod validation;

pub use hint_cache::HintCache;
pub use memory_store::{MemoryAuditSink, MemoryStore};
