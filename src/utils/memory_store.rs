//! In-memory storage implementation for testing and development

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::matcher::normalize;
use crate::reconciliation::job::UploadJob;
use crate::traits::*;
use crate::types::*;

/// Every entity map lives under one lock so a batch can validate and apply
/// against a single consistent snapshot.
#[derive(Debug, Default)]
struct Inner {
    counterparties: HashMap<Uuid, Counterparty>,
    vouchers: HashMap<Uuid, Voucher>,
    transactions: HashMap<Uuid, CashTransaction>,
    allocations: HashMap<Uuid, Allocation>,
    jobs: HashMap<Uuid, UploadJob>,
}

/// In-memory ledger store with the same atomicity and version-check contract
/// as a transactional database backend
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all data (useful for testing)
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        *inner = Inner::default();
    }
}

fn check_version(stored: Option<u64>, expected: u64, entity: &'static str, id: Uuid) -> EngineResult<()> {
    match stored {
        Some(version) if version == expected => Ok(()),
        _ => Err(EngineError::StaleVersion { entity, id }),
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn save_counterparty(&mut self, counterparty: &Counterparty) -> EngineResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .counterparties
            .insert(counterparty.id, counterparty.clone());
        Ok(())
    }

    async fn get_counterparty(&self, id: Uuid) -> EngineResult<Option<Counterparty>> {
        Ok(self.inner.read().unwrap().counterparties.get(&id).cloned())
    }

    async fn find_counterparty_by_name(
        &self,
        normalized: &str,
    ) -> EngineResult<Option<Counterparty>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .counterparties
            .values()
            .find(|cp| !cp.is_deleted() && normalize(&cp.name) == normalized)
            .cloned())
    }

    async fn find_counterparty_by_alias(
        &self,
        normalized: &str,
    ) -> EngineResult<Option<Counterparty>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .counterparties
            .values()
            .find(|cp| {
                !cp.is_deleted() && cp.aliases.iter().any(|a| normalize(a) == normalized)
            })
            .cloned())
    }

    async fn list_counterparties(&self) -> EngineResult<Vec<Counterparty>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .counterparties
            .values()
            .cloned()
            .collect())
    }

    async fn get_voucher(&self, id: Uuid) -> EngineResult<Option<Voucher>> {
        Ok(self.inner.read().unwrap().vouchers.get(&id).cloned())
    }

    async fn find_voucher_by_key(&self, key: &VoucherKey) -> EngineResult<Option<Voucher>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .vouchers
            .values()
            .find(|v| v.key() == *key)
            .cloned())
    }

    async fn list_open_vouchers(
        &self,
        counterparty_id: Uuid,
        kind: VoucherKind,
    ) -> EngineResult<Vec<Voucher>> {
        let zero = bigdecimal::BigDecimal::from(0);
        let inner = self.inner.read().unwrap();
        Ok(inner
            .vouchers
            .values()
            .filter(|v| {
                v.counterparty_id == counterparty_id
                    && v.kind == kind
                    && !v.is_locked()
                    && v.balance() > zero
            })
            .cloned()
            .collect())
    }

    async fn get_transaction(&self, id: Uuid) -> EngineResult<Option<CashTransaction>> {
        Ok(self.inner.read().unwrap().transactions.get(&id).cloned())
    }

    async fn list_allocations(&self, transaction_id: Uuid) -> EngineResult<Vec<Allocation>> {
        let inner = self.inner.read().unwrap();
        let mut allocations: Vec<Allocation> = inner
            .allocations
            .values()
            .filter(|a| a.transaction_id == transaction_id)
            .cloned()
            .collect();
        allocations.sort_by_key(|a| a.order);
        Ok(allocations)
    }

    async fn save_job(&mut self, job: &UploadJob) -> EngineResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> EngineResult<Option<UploadJob>> {
        Ok(self.inner.read().unwrap().jobs.get(&id).cloned())
    }

    async fn apply_batch(&mut self, batch: LedgerBatch) -> EngineResult<()> {
        let mut inner = self.inner.write().unwrap();

        // Validate everything against the snapshot before touching anything,
        // so a failed batch leaves the store untouched.
        for write in &batch.update_counterparties {
            check_version(
                inner.counterparties.get(&write.record.id).map(|c| c.version),
                write.expected_version,
                "counterparty",
                write.record.id,
            )?;
        }
        for write in &batch.update_vouchers {
            check_version(
                inner.vouchers.get(&write.record.id).map(|v| v.version),
                write.expected_version,
                "voucher",
                write.record.id,
            )?;
        }
        for write in &batch.update_transactions {
            check_version(
                inner.transactions.get(&write.record.id).map(|t| t.version),
                write.expected_version,
                "cash transaction",
                write.record.id,
            )?;
        }
        for voucher in &batch.insert_vouchers {
            if inner.vouchers.contains_key(&voucher.id) {
                return Err(EngineError::Storage(format!(
                    "voucher {} already exists",
                    voucher.id
                )));
            }
            let key = voucher.key();
            if inner.vouchers.values().any(|v| v.key() == key) {
                return Err(EngineError::Validation(format!(
                    "voucher number '{}' already exists for this counterparty, kind, and date",
                    voucher.voucher_no
                )));
            }
        }
        for transaction in &batch.insert_transactions {
            if inner.transactions.contains_key(&transaction.id) {
                return Err(EngineError::Storage(format!(
                    "cash transaction {} already exists",
                    transaction.id
                )));
            }
        }

        for counterparty in batch.insert_counterparties {
            inner.counterparties.insert(counterparty.id, counterparty);
        }
        for write in batch.update_counterparties {
            let mut record = write.record;
            record.version = write.expected_version + 1;
            inner.counterparties.insert(record.id, record);
        }
        for voucher in batch.insert_vouchers {
            inner.vouchers.insert(voucher.id, voucher);
        }
        for write in batch.update_vouchers {
            let mut record = write.record;
            record.version = write.expected_version + 1;
            inner.vouchers.insert(record.id, record);
        }
        for transaction in batch.insert_transactions {
            inner.transactions.insert(transaction.id, transaction);
        }
        for write in batch.update_transactions {
            let mut record = write.record;
            record.version = write.expected_version + 1;
            inner.transactions.insert(record.id, record);
        }
        for allocation in batch.upsert_allocations {
            inner.allocations.insert(allocation.id, allocation);
        }
        for job in batch.update_jobs {
            inner.jobs.insert(job.id, job);
        }

        Ok(())
    }
}

/// Audit sink that collects records in memory for assertions
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records emitted so far
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.read().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn emit(&self, record: AuditRecord) -> EngineResult<()> {
        self.records.write().unwrap().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::NaiveDate;

    fn voucher(counterparty_id: Uuid, no: &str) -> Voucher {
        Voucher::new(
            counterparty_id,
            VoucherKind::Sales,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            no.to_string(),
            BigDecimal::from(100),
        )
    }

    #[tokio::test]
    async fn batch_version_check_rejects_stale_writes() {
        let mut store = MemoryStore::new();
        let v = voucher(Uuid::new_v4(), "V-1");
        let mut batch = LedgerBatch::default();
        batch.insert_vouchers.push(v.clone());
        store.apply_batch(batch).await.unwrap();

        // stale write: expected version 5 but stored is 1
        let mut batch = LedgerBatch::default();
        batch.update_vouchers.push(VersionedWrite::new(v.clone(), 5));
        let err = store.apply_batch(batch).await.unwrap_err();
        assert!(matches!(err, EngineError::StaleVersion { .. }));

        // correct expectation bumps the stored version
        let mut batch = LedgerBatch::default();
        batch.update_vouchers.push(VersionedWrite::new(v.clone(), 1));
        store.apply_batch(batch).await.unwrap();
        assert_eq!(store.get_voucher(v.id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn failed_batch_leaves_the_store_untouched() {
        let mut store = MemoryStore::new();
        let cp = Uuid::new_v4();
        let v1 = voucher(cp, "V-1");
        let mut batch = LedgerBatch::default();
        batch.insert_vouchers.push(v1.clone());
        store.apply_batch(batch).await.unwrap();

        // one good insert plus one stale update: nothing may land
        let mut batch = LedgerBatch::default();
        batch.insert_vouchers.push(voucher(cp, "V-2"));
        batch.update_vouchers.push(VersionedWrite::new(v1, 9));
        assert!(store.apply_batch(batch).await.is_err());

        let key = VoucherKey {
            counterparty_id: cp,
            kind: VoucherKind::Sales,
            trade_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            voucher_no: "V-2".to_string(),
        };
        assert!(store.find_voucher_by_key(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn natural_key_uniqueness_is_enforced() {
        let mut store = MemoryStore::new();
        let cp = Uuid::new_v4();
        let mut batch = LedgerBatch::default();
        batch.insert_vouchers.push(voucher(cp, "V-1"));
        store.apply_batch(batch).await.unwrap();

        let mut batch = LedgerBatch::default();
        batch.insert_vouchers.push(voucher(cp, "V-1"));
        let err = store.apply_batch(batch).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
