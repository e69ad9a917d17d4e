//! Traits for storage abstraction, audit emission, and pluggable policy

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reconciliation::job::UploadJob;
use crate::types::*;

/// An update guarded by an optimistic-concurrency precondition: the write is
/// rejected with `StaleVersion` unless the stored version still equals
/// `expected_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedWrite<T> {
    pub record: T,
    pub expected_version: u64,
}

impl<T> VersionedWrite<T> {
    pub fn new(record: T, expected_version: u64) -> Self {
        Self {
            record,
            expected_version,
        }
    }
}

/// A set of ledger writes applied atomically: either every write lands, with
/// every version precondition satisfied, or none do.
///
/// The allocation engine and job confirmation both funnel their multi-entity
/// mutations through a batch so that no caller ever observes a
/// partially-updated balance.
#[derive(Debug, Clone, Default)]
pub struct LedgerBatch {
    pub insert_counterparties: Vec<Counterparty>,
    pub update_counterparties: Vec<VersionedWrite<Counterparty>>,
    pub insert_vouchers: Vec<Voucher>,
    pub update_vouchers: Vec<VersionedWrite<Voucher>>,
    pub insert_transactions: Vec<CashTransaction>,
    pub update_transactions: Vec<VersionedWrite<CashTransaction>>,
    pub upsert_allocations: Vec<Allocation>,
    pub update_jobs: Vec<UploadJob>,
}

impl LedgerBatch {
    pub fn is_empty(&self) -> bool {
        self.insert_counterparties.is_empty()
            && self.update_counterparties.is_empty()
            && self.insert_vouchers.is_empty()
            && self.update_vouchers.is_empty()
            && self.insert_transactions.is_empty()
            && self.update_transactions.is_empty()
            && self.upsert_allocations.is_empty()
            && self.update_jobs.is_empty()
    }
}

/// Storage abstraction for the settlement engine
///
/// This trait allows the engine to work with any transactional backend
/// (PostgreSQL, MySQL, SQLite, in-memory, etc.) by implementing these methods.
/// Name and alias lookups take case-normalized input (see
/// [`crate::matcher::normalize`]), must compare stored values the same way,
/// and never return soft-deleted counterparties.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Save a new counterparty
    async fn save_counterparty(&mut self, counterparty: &Counterparty) -> EngineResult<()>;

    /// Get a counterparty by id
    async fn get_counterparty(&self, id: Uuid) -> EngineResult<Option<Counterparty>>;

    /// Find a counterparty whose display name matches the normalized input
    async fn find_counterparty_by_name(&self, normalized: &str)
        -> EngineResult<Option<Counterparty>>;

    /// Find a counterparty one of whose aliases matches the normalized input
    async fn find_counterparty_by_alias(
        &self,
        normalized: &str,
    ) -> EngineResult<Option<Counterparty>>;

    /// List all counterparties, including inactive and soft-deleted ones
    async fn list_counterparties(&self) -> EngineResult<Vec<Counterparty>>;

    /// Get a voucher by id
    async fn get_voucher(&self, id: Uuid) -> EngineResult<Option<Voucher>>;

    /// Find a voucher by its natural key
    async fn find_voucher_by_key(&self, key: &VoucherKey) -> EngineResult<Option<Voucher>>;

    /// List a counterparty's vouchers of the given kind with `balance > 0`
    /// and not locked (the FIFO allocator's input set)
    async fn list_open_vouchers(
        &self,
        counterparty_id: Uuid,
        kind: VoucherKind,
    ) -> EngineResult<Vec<Voucher>>;

    /// Get a cash transaction by id
    async fn get_transaction(&self, id: Uuid) -> EngineResult<Option<CashTransaction>>;

    /// List a transaction's allocations, cancelled ones included, in order
    async fn list_allocations(&self, transaction_id: Uuid) -> EngineResult<Vec<Allocation>>;

    /// Save an upload job checkpoint
    async fn save_job(&mut self, job: &UploadJob) -> EngineResult<()>;

    /// Get an upload job by id
    async fn get_job(&self, id: Uuid) -> EngineResult<Option<UploadJob>>;

    /// Apply a batch of writes atomically, validating every version
    /// precondition against the current store state first
    async fn apply_batch(&mut self, batch: LedgerBatch) -> EngineResult<()>;
}

/// An audit record emitted for every state-changing operation. The engine
/// never persists these itself; the sink forwards them to the external
/// audit/identity service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub action: String,
    pub actor: String,
    pub target: String,
    pub description: String,
    pub timestamp: NaiveDateTime,
}

impl AuditRecord {
    pub fn new(action: &str, actor: &str, target: impl ToString, description: String) -> Self {
        Self {
            action: action.to_string(),
            actor: actor.to_string(),
            target: target.to_string(),
            description,
            timestamp: chrono::Utc::now().naive_utc(),
        }
    }
}

/// Destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, record: AuditRecord) -> EngineResult<()>;
}

/// Audit sink that discards all records
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn emit(&self, _record: AuditRecord) -> EngineResult<()> {
        Ok(())
    }
}

/// Decides whether an import row targeting `existing` may be applied silently
/// (`update`) or needs explicit per-row approval (`conflict`).
pub trait ConflictPolicy: Send + Sync {
    fn requires_approval(&self, existing: &Voucher) -> bool;
}

/// Default policy: any voucher with dependent progress (allocations, or
/// settlement/payment movement beyond open/unpaid) needs approval.
pub struct DefaultConflictPolicy;

impl ConflictPolicy for DefaultConflictPolicy {
    fn requires_approval(&self, existing: &Voucher) -> bool {
        existing.has_progress()
    }
}

/// Tunable behavior of the allocation engine
#[derive(Debug, Clone)]
pub struct AllocationPolicy {
    /// When set, a held transaction rejects `apply_allocations` until unheld
    pub hold_blocks_apply: bool,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            hold_blocks_apply: true,
        }
    }
}
