//! Allocation engine: maps cash-transaction amounts onto vouchers while
//! preserving the conservation and balance invariants

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::allocation::fifo::{self, AllocationProposal};
use crate::traits::*;
use crate::types::*;
use crate::utils::validation;

/// Orchestrates creation, allocation, and lifecycle of cash transactions.
///
/// All multi-entity mutations go through a single [`LedgerBatch`] so that a
/// transaction's status and the affected voucher balances always move
/// together or not at all.
pub struct AllocationEngine<S: LedgerStore> {
    store: S,
    audit: Box<dyn AuditSink>,
    policy: AllocationPolicy,
}

impl<S: LedgerStore> AllocationEngine<S> {
    /// Create an engine with the default policy and no audit forwarding
    pub fn new(store: S) -> Self {
        Self {
            store,
            audit: Box::new(NullAuditSink),
            policy: AllocationPolicy::default(),
        }
    }

    /// Create an engine that forwards audit records to the given sink
    pub fn with_audit(store: S, audit: Box<dyn AuditSink>) -> Self {
        Self {
            store,
            audit,
            policy: AllocationPolicy::default(),
        }
    }

    /// Override the allocation policy
    pub fn with_policy(mut self, policy: AllocationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Create a new pending cash transaction with no allocations
    pub async fn create_transaction(
        &mut self,
        counterparty_id: Uuid,
        flow: CashFlow,
        date: NaiveDate,
        amount: BigDecimal,
        memo: Option<String>,
        source: CashSource,
        actor: &str,
    ) -> EngineResult<CashTransaction> {
        validation::validate_positive_amount(&amount)?;

        let counterparty = self
            .store
            .get_counterparty(counterparty_id)
            .await?
            .ok_or(EngineError::CounterpartyNotFound(counterparty_id))?;
        if !counterparty.accepts_transactions() {
            return Err(EngineError::Validation(format!(
                "counterparty '{}' is inactive and cannot take new transactions",
                counterparty.name
            )));
        }

        let transaction = CashTransaction::new(counterparty_id, flow, date, amount, memo, source);

        let mut batch = LedgerBatch::default();
        batch.insert_transactions.push(transaction.clone());
        self.store.apply_batch(batch).await?;

        self.audit
            .emit(AuditRecord::new(
                "cash_transaction.create",
                actor,
                transaction.id,
                format!(
                    "created {:?} of {} for counterparty '{}'",
                    transaction.flow, transaction.amount, counterparty.name
                ),
            ))
            .await?;

        Ok(transaction)
    }

    /// Propose a default FIFO allocation for the transaction's full amount.
    ///
    /// Pure read: nothing is mutated. The transaction's own active
    /// allocations are treated as released when computing voucher balances,
    /// so re-running after an apply yields the same fresh plan, never a
    /// stacked one.
    pub async fn propose_allocation(
        &self,
        transaction_id: Uuid,
    ) -> EngineResult<Vec<AllocationProposal>> {
        let transaction = self.require_transaction(transaction_id).await?;
        if transaction.is_cancelled() {
            return Err(EngineError::InvalidState(format!(
                "transaction {transaction_id} is cancelled"
            )));
        }

        let mut vouchers = self
            .store
            .list_open_vouchers(transaction.counterparty_id, transaction.flow.voucher_kind())
            .await?;
        for allocation in self.store.list_allocations(transaction_id).await? {
            if allocation.cancelled {
                continue;
            }
            let release = -allocation.amount.clone();
            if let Some(voucher) = vouchers.iter_mut().find(|v| v.id == allocation.voucher_id) {
                voucher.apply_allocation_delta(&release)?;
            } else if let Some(mut voucher) = self.store.get_voucher(allocation.voucher_id).await?
            {
                // fully consumed by this transaction, so absent from the open list
                if !voucher.is_locked() {
                    voucher.apply_allocation_delta(&release)?;
                    vouchers.push(voucher);
                }
            }
        }
        Ok(fifo::propose(&transaction.amount, &vouchers))
    }

    /// Replace the transaction's allocation set with `requested`.
    ///
    /// Validates that every voucher belongs to the transaction's counterparty,
    /// matches the implied voucher kind, and is not locked; that no voucher is
    /// pushed past its balance; and that the requested sum stays within the
    /// transaction amount. On success the voucher balances, the allocation
    /// rows, and the derived transaction status are written in one batch.
    pub async fn apply_allocations(
        &mut self,
        transaction_id: Uuid,
        requested: Vec<AllocationProposal>,
        actor: &str,
    ) -> EngineResult<CashTransaction> {
        let mut transaction = self.require_transaction(transaction_id).await?;
        if transaction.is_cancelled() {
            return Err(EngineError::InvalidState(format!(
                "transaction {transaction_id} is cancelled"
            )));
        }
        if self.policy.hold_blocks_apply && transaction.is_on_hold() {
            return Err(EngineError::InvalidState(format!(
                "transaction {transaction_id} is on hold"
            )));
        }

        let zero = BigDecimal::from(0);
        let mut requested_total = zero.clone();
        let mut seen = std::collections::HashSet::new();
        for proposal in &requested {
            validation::validate_positive_amount(&proposal.amount)?;
            if !seen.insert(proposal.voucher_id) {
                return Err(EngineError::Validation(format!(
                    "voucher {} appears more than once in the allocation set",
                    proposal.voucher_id
                )));
            }
            requested_total = &requested_total + &proposal.amount;
        }
        if requested_total > transaction.amount {
            return Err(EngineError::OverAllocation {
                transaction_id,
                requested: requested_total,
                available: transaction.amount.clone(),
            });
        }

        // Current allocation rows, keyed by voucher: the new set replaces them.
        let existing = self.store.list_allocations(transaction_id).await?;
        let mut active: HashMap<Uuid, Allocation> = existing
            .into_iter()
            .filter(|a| !a.cancelled)
            .map(|a| (a.voucher_id, a))
            .collect();

        let mut batch = LedgerBatch::default();

        for (order, proposal) in requested.iter().enumerate() {
            let mut voucher = self
                .store
                .get_voucher(proposal.voucher_id)
                .await?
                .ok_or(EngineError::VoucherNotFound(proposal.voucher_id))?;
            if voucher.counterparty_id != transaction.counterparty_id {
                return Err(EngineError::Validation(format!(
                    "voucher {} belongs to a different counterparty",
                    voucher.id
                )));
            }
            if voucher.kind != transaction.flow.voucher_kind() {
                return Err(EngineError::Validation(format!(
                    "voucher {} is a {:?} voucher; a {:?} settles {:?} vouchers",
                    voucher.id,
                    voucher.kind,
                    transaction.flow,
                    transaction.flow.voucher_kind()
                )));
            }
            if voucher.is_locked() {
                return Err(EngineError::VoucherLocked {
                    voucher_id: voucher.id,
                });
            }

            let previous = active.remove(&voucher.id);
            let old_amount = previous
                .as_ref()
                .map(|a| a.amount.clone())
                .unwrap_or_else(|| zero.clone());
            let delta = &proposal.amount - &old_amount;

            let expected_version = voucher.version;
            voucher.apply_allocation_delta(&delta)?;
            batch
                .update_vouchers
                .push(VersionedWrite::new(voucher, expected_version));

            let allocation = match previous {
                Some(mut row) => {
                    row.amount = proposal.amount.clone();
                    row.order = order as u32;
                    row
                }
                None => Allocation::new(
                    transaction_id,
                    proposal.voucher_id,
                    proposal.amount.clone(),
                    order as u32,
                ),
            };
            batch.upsert_allocations.push(allocation);
        }

        // Vouchers dropped from the set get their balance back.
        for (voucher_id, mut row) in active {
            let mut voucher = self
                .store
                .get_voucher(voucher_id)
                .await?
                .ok_or(EngineError::VoucherNotFound(voucher_id))?;
            let expected_version = voucher.version;
            let release = -row.amount.clone();
            voucher.apply_allocation_delta(&release)?;
            batch
                .update_vouchers
                .push(VersionedWrite::new(voucher, expected_version));
            row.cancelled = true;
            batch.upsert_allocations.push(row);
        }

        let expected_version = transaction.version;
        transaction.status = CashStatus::derive(&requested_total, &transaction.amount);
        transaction.updated_at = chrono::Utc::now().naive_utc();
        batch
            .update_transactions
            .push(VersionedWrite::new(transaction.clone(), expected_version));

        self.store.apply_batch(batch).await?;
        debug!(
            transaction = %transaction_id,
            allocated = %requested_total,
            status = ?transaction.status,
            "allocations applied"
        );

        self.audit
            .emit(AuditRecord::new(
                "cash_transaction.allocate",
                actor,
                transaction_id,
                format!(
                    "allocated {} across {} voucher(s)",
                    requested_total,
                    requested.len()
                ),
            ))
            .await?;

        Ok(transaction)
    }

    /// Cancel the transaction, releasing all its allocations.
    ///
    /// Terminal: every affected voucher gets its balance back in the same
    /// batch, and a cancelled transaction rejects all further operations
    /// except reads.
    pub async fn cancel(&mut self, transaction_id: Uuid, actor: &str) -> EngineResult<CashTransaction> {
        let mut transaction = self.require_transaction(transaction_id).await?;
        if transaction.is_cancelled() {
            return Err(EngineError::InvalidState(format!(
                "transaction {transaction_id} is already cancelled"
            )));
        }

        let mut batch = LedgerBatch::default();
        let mut released = BigDecimal::from(0);
        for mut row in self.store.list_allocations(transaction_id).await? {
            if row.cancelled {
                continue;
            }
            let mut voucher = self
                .store
                .get_voucher(row.voucher_id)
                .await?
                .ok_or(EngineError::VoucherNotFound(row.voucher_id))?;
            let expected_version = voucher.version;
            let release = -row.amount.clone();
            voucher.apply_allocation_delta(&release)?;
            batch
                .update_vouchers
                .push(VersionedWrite::new(voucher, expected_version));
            released = &released + &row.amount;
            row.cancelled = true;
            batch.upsert_allocations.push(row);
        }

        let expected_version = transaction.version;
        transaction.status = CashStatus::Cancelled;
        transaction.updated_at = chrono::Utc::now().naive_utc();
        batch
            .update_transactions
            .push(VersionedWrite::new(transaction.clone(), expected_version));

        self.store.apply_batch(batch).await?;
        debug!(transaction = %transaction_id, released = %released, "transaction cancelled");

        self.audit
            .emit(AuditRecord::new(
                "cash_transaction.cancel",
                actor,
                transaction_id,
                format!("cancelled, releasing {released} back to vouchers"),
            ))
            .await?;

        Ok(transaction)
    }

    /// Put the transaction on hold. The reason is mandatory; allocations are
    /// untouched.
    pub async fn hold(
        &mut self,
        transaction_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> EngineResult<CashTransaction> {
        validation::validate_reason(reason)?;
        let mut transaction = self.require_transaction(transaction_id).await?;
        if transaction.is_cancelled() {
            return Err(EngineError::InvalidState(format!(
                "transaction {transaction_id} is cancelled"
            )));
        }
        if transaction.hidden {
            return Err(EngineError::InvalidState(format!(
                "transaction {transaction_id} is hidden"
            )));
        }

        transaction.hold_reason = Some(reason.to_string());
        self.write_transaction(&mut transaction).await?;
        self.audit
            .emit(AuditRecord::new(
                "cash_transaction.hold",
                actor,
                transaction_id,
                format!("held: {reason}"),
            ))
            .await?;
        Ok(transaction)
    }

    /// Release a hold
    pub async fn unhold(&mut self, transaction_id: Uuid, actor: &str) -> EngineResult<CashTransaction> {
        let mut transaction = self.require_transaction(transaction_id).await?;
        if transaction.is_cancelled() {
            return Err(EngineError::InvalidState(format!(
                "transaction {transaction_id} is cancelled"
            )));
        }
        if !transaction.is_on_hold() {
            return Err(EngineError::InvalidState(format!(
                "transaction {transaction_id} is not on hold"
            )));
        }

        transaction.hold_reason = None;
        self.write_transaction(&mut transaction).await?;
        self.audit
            .emit(AuditRecord::new(
                "cash_transaction.unhold",
                actor,
                transaction_id,
                "hold released".to_string(),
            ))
            .await?;
        Ok(transaction)
    }

    /// Hide the transaction from default views. Orthogonal to status; valid
    /// from any non-cancelled state.
    pub async fn hide(
        &mut self,
        transaction_id: Uuid,
        reason: Option<String>,
        actor: &str,
    ) -> EngineResult<CashTransaction> {
        let mut transaction = self.require_transaction(transaction_id).await?;
        if transaction.is_cancelled() {
            return Err(EngineError::InvalidState(format!(
                "transaction {transaction_id} is cancelled"
            )));
        }

        transaction.hidden = true;
        transaction.hide_reason = reason.clone();
        self.write_transaction(&mut transaction).await?;
        self.audit
            .emit(AuditRecord::new(
                "cash_transaction.hide",
                actor,
                transaction_id,
                reason.unwrap_or_else(|| "hidden".to_string()),
            ))
            .await?;
        Ok(transaction)
    }

    /// Make a hidden transaction visible again
    pub async fn unhide(&mut self, transaction_id: Uuid, actor: &str) -> EngineResult<CashTransaction> {
        let mut transaction = self.require_transaction(transaction_id).await?;
        if transaction.is_cancelled() {
            return Err(EngineError::InvalidState(format!(
                "transaction {transaction_id} is cancelled"
            )));
        }
        if !transaction.hidden {
            return Err(EngineError::InvalidState(format!(
                "transaction {transaction_id} is not hidden"
            )));
        }

        transaction.hidden = false;
        transaction.hide_reason = None;
        self.write_transaction(&mut transaction).await?;
        self.audit
            .emit(AuditRecord::new(
                "cash_transaction.unhide",
                actor,
                transaction_id,
                "made visible".to_string(),
            ))
            .await?;
        Ok(transaction)
    }

    /// Get a cash transaction by id
    pub async fn get_transaction(&self, id: Uuid) -> EngineResult<Option<CashTransaction>> {
        self.store.get_transaction(id).await
    }

    /// List a transaction's allocations, cancelled ones included
    pub async fn allocations(&self, transaction_id: Uuid) -> EngineResult<Vec<Allocation>> {
        self.store.list_allocations(transaction_id).await
    }

    async fn require_transaction(&self, id: Uuid) -> EngineResult<CashTransaction> {
        self.store
            .get_transaction(id)
            .await?
            .ok_or(EngineError::TransactionNotFound(id))
    }

    async fn write_transaction(&mut self, transaction: &mut CashTransaction) -> EngineResult<()> {
        let expected_version = transaction.version;
        transaction.updated_at = chrono::Utc::now().naive_utc();
        let mut batch = LedgerBatch::default();
        batch
            .update_transactions
            .push(VersionedWrite::new(transaction.clone(), expected_version));
        self.store.apply_batch(batch).await
    }
}
