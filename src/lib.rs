//! # Settlement Core
//!
//! A cash-transaction allocation and bulk-voucher reconciliation engine for
//! price/settlement management systems.
//!
//! ## Features
//!
//! - **Allocation engine**: maps deposits and withdrawals onto outstanding
//!   trade vouchers while enforcing conservation-of-balance invariants
//! - **FIFO auto-allocation**: deterministic oldest-voucher-first proposals
//! - **Counterparty matching**: exact name and alias resolution for free-text
//!   names, with human mapping of unmatched names
//! - **Upload reconciliation**: resumable multi-stage import jobs with
//!   per-row classification, field-level diffs, and conflict approval
//! - **Exactly-once confirmation**: atomic, idempotent commit of approved
//!   import results
//! - **Storage abstraction**: database-agnostic design with trait-based
//!   storage and optimistic concurrency
//!
//! ## Quick Start
//!
//! ```rust
//! use settlement_core::{AllocationEngine, UploadPipeline, utils::MemoryStore};
//!
//! let store = MemoryStore::new();
//! let engine = AllocationEngine::new(store.clone());
//! let pipeline = UploadPipeline::new(store);
//! ```

pub mod allocation;
pub mod matcher;
pub mod reconciliation;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use allocation::*;
pub use matcher::{CounterpartyDirectory, CounterpartyMatcher, MatchOutcome};
pub use reconciliation::*;
pub use traits::*;
pub use types::*;
