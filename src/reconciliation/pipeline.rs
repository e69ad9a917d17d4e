//! Upload reconciliation pipeline: ingest, classify, and the human
//! resolution steps, each a durable checkpoint on the upload job

use std::collections::HashSet;
use std::io::BufRead;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::matcher::{normalize, CounterpartyDirectory, CounterpartyMatcher, MatchOutcome};
use crate::reconciliation::job::*;
use crate::reconciliation::parser;
use crate::reconciliation::row::{self, RawRow};
use crate::traits::*;
use crate::types::*;

/// Operator action for one distinct unmatched name
#[derive(Debug, Clone, PartialEq)]
pub enum UnmatchedAction {
    /// Create a new counterparty named after the free text
    Create,
    /// Register the free text as an alias of an existing counterparty
    Link(Uuid),
    /// Leave the rows unmatched; they stay out of the commit
    Skip,
}

/// One resolution entry for the unmatched-names step
#[derive(Debug, Clone, PartialEq)]
pub struct UnmatchedResolution {
    pub name: String,
    pub action: UnmatchedAction,
}

/// Drives an upload job through parse, classification, and the human
/// resolution steps. Classification is a pure function of (row, current
/// ledger state); re-running it never regresses a resolved row unless the
/// ledger itself still produces that classification.
pub struct UploadPipeline<S: LedgerStore + Clone> {
    store: S,
    matcher: CounterpartyMatcher<S>,
    directory: CounterpartyDirectory<S>,
    conflict_policy: Box<dyn ConflictPolicy>,
}

impl<S: LedgerStore + Clone> UploadPipeline<S> {
    pub fn new(store: S) -> Self {
        Self {
            matcher: CounterpartyMatcher::new(store.clone()),
            directory: CounterpartyDirectory::new(store.clone()),
            conflict_policy: Box::new(DefaultConflictPolicy),
            store,
        }
    }

    /// Forward directory mutations (counterparty creation, alias linking)
    /// to the given audit sink
    pub fn with_audit(store: S, audit: Box<dyn AuditSink>) -> Self {
        Self {
            matcher: CounterpartyMatcher::new(store.clone()),
            directory: CounterpartyDirectory::with_audit(store.clone(), audit),
            conflict_policy: Box::new(DefaultConflictPolicy),
            store,
        }
    }

    /// Override the update-versus-conflict policy
    pub fn with_conflict_policy(mut self, policy: Box<dyn ConflictPolicy>) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Create a queued job for an uploaded file
    pub async fn create_job(&mut self, source_name: &str) -> EngineResult<UploadJob> {
        let job = UploadJob::new(source_name);
        self.store.save_job(&job).await?;
        info!(job = %job.id, source = source_name, "upload job queued");
        Ok(job)
    }

    /// Run ingest and classification for a queued job.
    ///
    /// Designed to run as a background task; the caller polls
    /// [`Self::job_status`] instead of blocking on this future. A malformed
    /// file fails the job (no partial ingest) and is reported through the
    /// job's status, not as a call error.
    pub async fn ingest<R: BufRead + Send>(
        &mut self,
        job_id: Uuid,
        reader: R,
    ) -> EngineResult<JobStatus> {
        let mut job = self.require_job(job_id).await?;
        if job.state != JobState::Queued {
            return Err(EngineError::InvalidState(format!(
                "job {job_id} has already run (state {:?})",
                job.state
            )));
        }

        job.state = JobState::Running;
        job.advance(5);
        self.store.save_job(&job).await?;

        let raw_rows = match parser::parse_rows(reader) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(job = %job_id, error = %e, "upload parse failed");
                job.state = JobState::Failed;
                job.error_message = Some(e.to_string());
                job.advance(100);
                self.store.save_job(&job).await?;
                return Ok(job.status());
            }
        };
        info!(job = %job_id, rows = raw_rows.len(), "upload parsed");
        job.advance(40);
        self.store.save_job(&job).await?;

        match self.classify_all(&raw_rows).await {
            Ok(rows) => {
                job.rows = rows;
                job.result_summary = Some(RowSummary::tally(&job.rows));
                job.state = JobState::Succeeded;
                job.advance(100);
                self.store.save_job(&job).await?;
                info!(job = %job_id, summary = ?job.result_summary, "upload classified");
                Ok(job.status())
            }
            Err(e) => {
                // infrastructure failure: record it on the job for pollers,
                // then surface it to the caller
                job.state = JobState::Failed;
                job.error_message = Some(e.to_string());
                self.store.save_job(&job).await?;
                Err(e)
            }
        }
    }

    /// Re-run matching for rows still classified `unmatched`, leaving every
    /// already-resolved row untouched. Invoked after counterparty creation or
    /// alias linking so the affected rows pick up the new identity.
    pub async fn rematch(&mut self, job_id: Uuid) -> EngineResult<UploadJob> {
        let mut job = self.require_job(job_id).await?;
        self.ensure_mutable(&job)?;

        let mut reclassified = 0usize;
        for i in 0..job.rows.len() {
            if job.rows[i].status != RowStatus::Unmatched {
                continue;
            }
            let index = job.rows[i].index;
            let raw = job.rows[i].raw.clone();
            job.rows[i] = self.classify_row(index, raw).await?;
            reclassified += 1;
        }

        job.result_summary = Some(RowSummary::tally(&job.rows));
        job.advance(job.progress); // touch updated_at
        self.store.save_job(&job).await?;
        debug!(job = %job_id, reclassified, "rematch complete");
        Ok(job)
    }

    /// Apply operator decisions for distinct unmatched names, then rematch.
    pub async fn resolve_unmatched(
        &mut self,
        job_id: Uuid,
        resolutions: Vec<UnmatchedResolution>,
        actor: &str,
    ) -> EngineResult<UploadJob> {
        let job = self.require_job(job_id).await?;
        self.ensure_mutable(&job)?;

        for resolution in &resolutions {
            match &resolution.action {
                UnmatchedAction::Create => {
                    self.directory
                        .create_from_unmatched(&resolution.name, actor)
                        .await?;
                }
                UnmatchedAction::Link(counterparty_id) => {
                    self.directory
                        .link_alias(&resolution.name, *counterparty_id, actor)
                        .await?;
                }
                UnmatchedAction::Skip => {}
            }
        }

        self.rematch(job_id).await
    }

    /// Record an operator decision for a conflict row. Decisions live in an
    /// overlay map; the row's classification is never mutated in place.
    pub async fn decide_conflict(
        &mut self,
        job_id: Uuid,
        row_index: u32,
        decision: ConflictDecision,
    ) -> EngineResult<UploadJob> {
        let mut job = self.require_job(job_id).await?;
        self.ensure_mutable(&job)?;

        let row = job
            .rows
            .iter()
            .find(|r| r.index == row_index)
            .ok_or_else(|| {
                EngineError::Validation(format!("job {job_id} has no row {row_index}"))
            })?;
        if row.status != RowStatus::Conflict {
            return Err(EngineError::InvalidState(format!(
                "row {row_index} is {:?}, not a conflict",
                row.status
            )));
        }

        job.conflict_decisions.insert(row_index, decision);
        job.advance(job.progress);
        self.store.save_job(&job).await?;
        Ok(job)
    }

    /// The polling surface
    pub async fn job_status(&self, job_id: Uuid) -> EngineResult<JobStatus> {
        Ok(self.require_job(job_id).await?.status())
    }

    /// Get the full job, preview rows included
    pub async fn get_job(&self, job_id: Uuid) -> EngineResult<UploadJob> {
        self.require_job(job_id).await
    }

    async fn require_job(&self, id: Uuid) -> EngineResult<UploadJob> {
        self.store
            .get_job(id)
            .await?
            .ok_or(EngineError::JobNotFound(id))
    }

    fn ensure_mutable(&self, job: &UploadJob) -> EngineResult<()> {
        if job.is_confirmed {
            return Err(EngineError::AlreadyConfirmed(job.id));
        }
        if job.state != JobState::Succeeded {
            return Err(EngineError::InvalidState(format!(
                "job {} is {:?}; classification has not completed",
                job.id, job.state
            )));
        }
        Ok(())
    }

    /// Classify every parsed row. Duplicate natural keys within the file are
    /// detected first; later occurrences are excluded without touching the
    /// ledger.
    async fn classify_all(&mut self, raw_rows: &[RawRow]) -> EngineResult<Vec<PreviewRow>> {
        let mut seen_keys = HashSet::new();
        let mut rows = Vec::with_capacity(raw_rows.len());

        for (i, raw) in raw_rows.iter().enumerate() {
            let index = i as u32;
            if let Ok(typed) = raw.typed() {
                let key = (
                    normalize(&typed.counterparty_name),
                    typed.kind,
                    typed.trade_date,
                    typed.voucher_no.clone(),
                );
                if !seen_keys.insert(key) {
                    rows.push(PreviewRow {
                        index,
                        status: RowStatus::Excluded,
                        raw: raw.clone(),
                        counterparty_id: None,
                        existing_voucher_id: None,
                        existing_version: None,
                        diff: None,
                        message: Some("duplicate of an earlier row in this file".to_string()),
                    });
                    continue;
                }
            }
            rows.push(self.classify_row(index, raw.clone()).await?);
        }
        Ok(rows)
    }

    /// Classify one row against the current ledger state. Pure: the outcome
    /// depends only on the row and the ledger, never on prior pipeline state.
    async fn classify_row(&mut self, index: u32, raw: RawRow) -> EngineResult<PreviewRow> {
        let mut row = PreviewRow {
            index,
            status: RowStatus::Error,
            raw,
            counterparty_id: None,
            existing_voucher_id: None,
            existing_version: None,
            diff: None,
            message: None,
        };

        let typed = match row.raw.typed() {
            Ok(typed) => typed,
            Err(message) => {
                row.message = Some(message);
                return Ok(row);
            }
        };

        let counterparty = match self.matcher.resolve(&typed.counterparty_name).await? {
            MatchOutcome::Matched(cp) => cp,
            MatchOutcome::Unmatched(_) => {
                row.status = RowStatus::Unmatched;
                return Ok(row);
            }
        };
        row.counterparty_id = Some(counterparty.id);

        let key = VoucherKey {
            counterparty_id: counterparty.id,
            kind: typed.kind,
            trade_date: typed.trade_date,
            voucher_no: typed.voucher_no.clone(),
        };
        let existing = match self.store.find_voucher_by_key(&key).await? {
            Some(voucher) => voucher,
            None => {
                row.status = RowStatus::New;
                return Ok(row);
            }
        };
        row.existing_voucher_id = Some(existing.id);
        row.existing_version = Some(existing.version);

        if existing.is_locked() {
            row.status = RowStatus::Locked;
            return Ok(row);
        }

        match row::diff((&existing).into(), (&typed).into()) {
            None => {
                row.status = RowStatus::Excluded;
                row.message = Some("no field changes".to_string());
            }
            Some(diff) => {
                row.diff = Some(diff);
                row.status = if self.conflict_policy.requires_approval(&existing) {
                    RowStatus::Conflict
                } else {
                    RowStatus::Update
                };
            }
        }
        Ok(row)
    }
}
