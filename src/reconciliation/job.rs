//! Upload job model: durable pipeline checkpoints, preview rows, and the
//! client-observable polling status

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::reconciliation::row::{RawRow, RowDiff};

/// Lifecycle of an upload job. Progress is monotonic and the state eventually
/// reaches one of the terminal values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Classification of one import row against the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    /// No existing voucher with the same natural key
    New,
    /// Existing voucher found with field differences, safe to apply silently
    Update,
    /// Existing voucher has dependent progress; needs explicit approval
    Conflict,
    /// Counterparty name could not be resolved
    Unmatched,
    /// The target voucher is period-locked
    Locked,
    /// Skipped, e.g. a duplicate key within the same file or a no-change row
    Excluded,
    /// Required fields missing or invalid
    Error,
}

/// One classified row of the upload preview
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewRow {
    /// Zero-based row index within the file
    pub index: u32,
    pub status: RowStatus,
    /// The canonical input fields as uploaded
    pub raw: RawRow,
    /// Resolved counterparty, when matching succeeded
    pub counterparty_id: Option<Uuid>,
    /// Target voucher for update/conflict/locked rows
    pub existing_voucher_id: Option<Uuid>,
    /// Voucher version read at classification time; the commit's optimistic
    /// precondition
    pub existing_version: Option<u64>,
    /// Field diff for update/conflict rows
    pub diff: Option<RowDiff>,
    /// Explanation for error/excluded rows
    pub message: Option<String>,
}

/// Operator decision on a conflict row. Kept in an overlay map keyed by row
/// index, never written into the row's classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictDecision {
    Approve,
    Reject,
}

/// Counts per row classification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSummary {
    pub new_count: u32,
    pub update_count: u32,
    pub conflict_count: u32,
    pub unmatched_count: u32,
    pub locked_count: u32,
    pub excluded_count: u32,
    pub error_count: u32,
}

impl RowSummary {
    /// Tally a preview row set
    pub fn tally(rows: &[PreviewRow]) -> Self {
        let mut summary = Self::default();
        for row in rows {
            match row.status {
                RowStatus::New => summary.new_count += 1,
                RowStatus::Update => summary.update_count += 1,
                RowStatus::Conflict => summary.conflict_count += 1,
                RowStatus::Unmatched => summary.unmatched_count += 1,
                RowStatus::Locked => summary.locked_count += 1,
                RowStatus::Excluded => summary.excluded_count += 1,
                RowStatus::Error => summary.error_count += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> u32 {
        self.new_count
            + self.update_count
            + self.conflict_count
            + self.unmatched_count
            + self.locked_count
            + self.excluded_count
            + self.error_count
    }
}

/// Client-observable job status, polled rather than pushed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    /// 0-100, monotonic
    pub progress: u8,
    pub result_summary: Option<RowSummary>,
    pub error_message: Option<String>,
}

/// A bulk-import task. Mutated only by the pipeline until confirmed; after
/// confirmation it is append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJob {
    pub id: Uuid,
    /// Name of the uploaded file, for display and diagnostics
    pub source_name: String,
    pub state: JobState,
    /// 0-100, never decreases
    pub progress: u8,
    pub error_message: Option<String>,
    pub rows: Vec<PreviewRow>,
    /// Conflict decisions overlay, keyed by row index
    pub conflict_decisions: BTreeMap<u32, ConflictDecision>,
    pub result_summary: Option<RowSummary>,
    /// Set exactly once, atomically with the commit
    pub is_confirmed: bool,
    pub confirmed_at: Option<NaiveDateTime>,
    pub confirmed_by: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl UploadJob {
    /// Create a queued job with no rows yet
    pub fn new(source_name: &str) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4(),
            source_name: source_name.to_string(),
            state: JobState::Queued,
            progress: 0,
            error_message: None,
            rows: Vec::new(),
            conflict_decisions: BTreeMap::new(),
            result_summary: None,
            is_confirmed: false,
            confirmed_at: None,
            confirmed_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advance progress, keeping it monotonic
    pub(crate) fn advance(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
        self.updated_at = chrono::Utc::now().naive_utc();
    }

    /// The polling surface value object
    pub fn status(&self) -> JobStatus {
        JobStatus {
            state: self.state,
            progress: self.progress,
            result_summary: self.result_summary.clone(),
            error_message: self.error_message.clone(),
        }
    }

    /// Distinct unmatched names in order of first appearance, for the human
    /// resolution step
    pub fn unmatched_names(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut names = Vec::new();
        for row in &self.rows {
            if row.status == RowStatus::Unmatched {
                let name = row.raw.counterparty_name.trim().to_string();
                if seen.insert(name.to_lowercase()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// The decision recorded for a conflict row, if any
    pub fn decision_for(&self, index: u32) -> Option<ConflictDecision> {
        self.conflict_decisions.get(&index).copied()
    }
}
