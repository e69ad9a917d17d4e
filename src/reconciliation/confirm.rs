//! Exactly-once application of an approved reconciliation result

use tracing::info;
use uuid::Uuid;

use crate::reconciliation::job::*;
use crate::traits::*;
use crate::types::*;
use crate::utils::validation;

/// What a confirmation call did
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmOutcome {
    /// The job's persisted per-classification counts
    pub summary: RowSummary,
    /// Vouchers created by this call
    pub created: u32,
    /// Vouchers updated by this call
    pub updated: u32,
    /// True when the job was confirmed earlier and this call was a no-op
    pub already_confirmed: bool,
}

/// Applies an approved upload job to the ledger in one atomic batch.
///
/// `new` rows become vouchers; `update` rows and approved `conflict` rows
/// get their diffs applied under the version read at classification time;
/// everything else is skipped and stays available for a later import. Any
/// row-level failure rolls the whole commit back and leaves the job
/// unconfirmed.
pub struct JobConfirmation<S: LedgerStore> {
    store: S,
    audit: Box<dyn AuditSink>,
}

impl<S: LedgerStore> JobConfirmation<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            audit: Box::new(NullAuditSink),
        }
    }

    pub fn with_audit(store: S, audit: Box<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    /// Confirm the job. Idempotent from the caller's perspective: a second
    /// call applies nothing and returns the same summary.
    pub async fn confirm(&mut self, job_id: Uuid, actor: &str) -> EngineResult<ConfirmOutcome> {
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;

        if job.is_confirmed {
            return Ok(ConfirmOutcome {
                summary: job.result_summary.clone().unwrap_or_default(),
                created: 0,
                updated: 0,
                already_confirmed: true,
            });
        }
        if job.state != JobState::Succeeded {
            return Err(EngineError::InvalidState(format!(
                "job {job_id} is {:?} and cannot be confirmed",
                job.state
            )));
        }

        let mut batch = LedgerBatch::default();
        let mut created = 0u32;
        let mut updated = 0u32;

        for row in &job.rows {
            match row.status {
                RowStatus::New => {
                    batch.insert_vouchers.push(self.build_voucher(row)?);
                    created += 1;
                }
                RowStatus::Update => {
                    batch.update_vouchers.push(self.build_update(row).await?);
                    updated += 1;
                }
                RowStatus::Conflict => {
                    // only explicitly approved conflicts are applied;
                    // undecided and rejected rows stay untouched
                    if job.decision_for(row.index) == Some(ConflictDecision::Approve) {
                        batch.update_vouchers.push(self.build_update(row).await?);
                        updated += 1;
                    }
                }
                RowStatus::Unmatched
                | RowStatus::Locked
                | RowStatus::Excluded
                | RowStatus::Error => {}
            }
        }

        job.is_confirmed = true;
        job.confirmed_at = Some(chrono::Utc::now().naive_utc());
        job.confirmed_by = Some(actor.to_string());
        if job.result_summary.is_none() {
            job.result_summary = Some(RowSummary::tally(&job.rows));
        }
        job.updated_at = chrono::Utc::now().naive_utc();
        let summary = job.result_summary.clone().unwrap_or_default();
        batch.update_jobs.push(job);

        // all-or-nothing: a failure here leaves the stored job unconfirmed
        self.store.apply_batch(batch).await?;
        info!(job = %job_id, created, updated, "upload job confirmed");

        self.audit
            .emit(AuditRecord::new(
                "upload_job.confirm",
                actor,
                job_id,
                format!("applied {created} new and {updated} updated voucher(s)"),
            ))
            .await?;

        Ok(ConfirmOutcome {
            summary,
            created,
            updated,
            already_confirmed: false,
        })
    }

    fn build_voucher(&self, row: &PreviewRow) -> EngineResult<Voucher> {
        let typed = row.raw.typed().map_err(|reason| EngineError::CommitFailed {
            row: row.index,
            reason,
        })?;
        let counterparty_id = row.counterparty_id.ok_or(EngineError::CommitFailed {
            row: row.index,
            reason: "new row has no resolved counterparty".to_string(),
        })?;
        validation::validate_voucher_no(&typed.voucher_no).map_err(|e| {
            EngineError::CommitFailed {
                row: row.index,
                reason: e.to_string(),
            }
        })?;

        let mut voucher = Voucher::new(
            counterparty_id,
            typed.kind,
            typed.trade_date,
            typed.voucher_no.clone(),
            typed.amount.clone(),
        );
        voucher.cost_amount = typed.cost_amount.clone();
        voucher.memo = typed.memo.clone();
        Ok(voucher)
    }

    async fn build_update(&self, row: &PreviewRow) -> EngineResult<VersionedWrite<Voucher>> {
        let typed = row.raw.typed().map_err(|reason| EngineError::CommitFailed {
            row: row.index,
            reason,
        })?;
        let voucher_id = row.existing_voucher_id.ok_or(EngineError::CommitFailed {
            row: row.index,
            reason: "update row has no target voucher".to_string(),
        })?;
        let expected_version = row.existing_version.ok_or(EngineError::CommitFailed {
            row: row.index,
            reason: "update row has no recorded version".to_string(),
        })?;

        let mut voucher = self
            .store
            .get_voucher(voucher_id)
            .await?
            .ok_or(EngineError::VoucherNotFound(voucher_id))?;
        // the version read at classification is the optimistic precondition:
        // a voucher touched since then fails the commit rather than being
        // silently overwritten from a stale diff
        if voucher.version != expected_version {
            return Err(EngineError::StaleVersion {
                entity: "voucher",
                id: voucher_id,
            });
        }
        if typed.amount < voucher.allocated_amount {
            return Err(EngineError::CommitFailed {
                row: row.index,
                reason: format!(
                    "new total {} is below the already-allocated {}",
                    typed.amount, voucher.allocated_amount
                ),
            });
        }

        voucher.total_amount = typed.amount.clone();
        voucher.cost_amount = typed.cost_amount.clone();
        voucher.memo = typed.memo.clone();
        voucher.refresh_payment_status();
        voucher.updated_at = chrono::Utc::now().naive_utc();
        Ok(VersionedWrite::new(voucher, expected_version))
    }
}
