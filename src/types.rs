//! Core types and data structures for the settlement engine

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Counterparty trading roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterpartyKind {
    /// We purchase from this counterparty
    Seller,
    /// We sell to this counterparty
    Buyer,
    /// Both directions
    Both,
}

/// A trading partner with alternate names used for free-text matching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counterparty {
    /// Unique identifier
    pub id: Uuid,
    /// Display name, unique across active counterparties (case-normalized)
    pub name: String,
    /// Trading role
    pub kind: CounterpartyKind,
    /// Inactive counterparties reject new transactions
    pub active: bool,
    /// Alternate names resolved during import matching
    pub aliases: Vec<String>,
    /// Set when soft-deleted; the record stays while vouchers reference it
    pub deleted_reason: Option<String>,
    /// Optimistic-concurrency stamp, bumped on every write
    pub version: u64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Counterparty {
    /// Create a new active counterparty
    pub fn new(name: String, kind: CounterpartyKind) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4(),
            name,
            kind,
            active: true,
            aliases: Vec::new(),
            deleted_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the counterparty has been soft-deleted
    pub fn is_deleted(&self) -> bool {
        self.deleted_reason.is_some()
    }

    /// Whether the counterparty can take part in new transactions
    pub fn accepts_transactions(&self) -> bool {
        self.active && !self.is_deleted()
    }
}

/// Voucher trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoucherKind {
    Sales,
    Purchase,
}

impl VoucherKind {
    /// Parse from the import file representation
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "sales" | "sale" => Some(VoucherKind::Sales),
            "purchase" => Some(VoucherKind::Purchase),
            _ => None,
        }
    }
}

/// Settlement lifecycle of a voucher, independent of payment progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Open,
    Settling,
    Settled,
    /// Period-closed; the voucher rejects all new allocations
    Locked,
}

/// Payment progress of a voucher, driven by its allocated amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
    /// Period-closed; the voucher rejects all new allocations
    Locked,
}

/// Natural key identifying a voucher within the ledger
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoucherKey {
    pub counterparty_id: Uuid,
    pub kind: VoucherKind,
    pub trade_date: NaiveDate,
    pub voucher_no: String,
}

/// An individual sales or purchase trade record owed to/by a counterparty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voucher {
    pub id: Uuid,
    pub counterparty_id: Uuid,
    pub kind: VoucherKind,
    pub trade_date: NaiveDate,
    /// Unique within (counterparty, kind, trade date)
    pub voucher_no: String,
    /// Gross trade amount
    pub total_amount: BigDecimal,
    /// Sum of non-cancelled allocation amounts; `balance = total - allocated`
    pub allocated_amount: BigDecimal,
    /// Purchase cost used for profit reporting on sales vouchers
    pub cost_amount: Option<BigDecimal>,
    pub memo: Option<String>,
    pub settlement_status: SettlementStatus,
    pub payment_status: PaymentStatus,
    /// Optimistic-concurrency stamp, bumped on every write
    pub version: u64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Voucher {
    /// Create a new open, unpaid voucher
    pub fn new(
        counterparty_id: Uuid,
        kind: VoucherKind,
        trade_date: NaiveDate,
        voucher_no: String,
        total_amount: BigDecimal,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4(),
            counterparty_id,
            kind,
            trade_date,
            voucher_no,
            total_amount,
            allocated_amount: BigDecimal::from(0),
            cost_amount: None,
            memo: None,
            settlement_status: SettlementStatus::Open,
            payment_status: PaymentStatus::Unpaid,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// The natural key of this voucher
    pub fn key(&self) -> VoucherKey {
        VoucherKey {
            counterparty_id: self.counterparty_id,
            kind: self.kind,
            trade_date: self.trade_date,
            voucher_no: self.voucher_no.clone(),
        }
    }

    /// Remaining unallocated amount; invariant `0 <= balance <= total_amount`
    pub fn balance(&self) -> BigDecimal {
        &self.total_amount - &self.allocated_amount
    }

    /// Locked vouchers reject all new allocations
    pub fn is_locked(&self) -> bool {
        self.settlement_status == SettlementStatus::Locked
            || self.payment_status == PaymentStatus::Locked
    }

    /// Whether the voucher carries dependent progress (allocations or
    /// settlement/payment movement) that makes a silent overwrite unsafe
    pub fn has_progress(&self) -> bool {
        self.allocated_amount > BigDecimal::from(0)
            || self.settlement_status != SettlementStatus::Open
            || self.payment_status != PaymentStatus::Unpaid
    }

    /// Profit derived from total and cost amounts, when cost is known
    pub fn profit(&self) -> Option<BigDecimal> {
        self.cost_amount
            .as_ref()
            .map(|cost| &self.total_amount - cost)
    }

    /// Shift the allocated amount by `delta`, keeping the balance invariant
    /// and re-deriving the payment status.
    pub(crate) fn apply_allocation_delta(&mut self, delta: &BigDecimal) -> EngineResult<()> {
        let next = &self.allocated_amount + delta;
        if next < BigDecimal::from(0) || next > self.total_amount {
            return Err(EngineError::InsufficientBalance {
                voucher_id: self.id,
                requested: delta.clone(),
                balance: self.balance(),
            });
        }
        self.allocated_amount = next;
        self.refresh_payment_status();
        self.updated_at = chrono::Utc::now().naive_utc();
        Ok(())
    }

    /// Re-derive the payment status from the allocated amount. Locked
    /// vouchers keep their status.
    pub(crate) fn refresh_payment_status(&mut self) {
        if self.payment_status == PaymentStatus::Locked {
            return;
        }
        self.payment_status = if self.allocated_amount == BigDecimal::from(0) {
            PaymentStatus::Unpaid
        } else if self.allocated_amount < self.total_amount {
            PaymentStatus::Partial
        } else {
            PaymentStatus::Paid
        };
    }
}

/// Direction of a cash movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CashFlow {
    Deposit,
    Withdrawal,
}

impl CashFlow {
    /// The voucher kind a cash movement settles against:
    /// deposits pay down sales vouchers, withdrawals pay down purchases.
    pub fn voucher_kind(&self) -> VoucherKind {
        match self {
            CashFlow::Deposit => VoucherKind::Sales,
            CashFlow::Withdrawal => VoucherKind::Purchase,
        }
    }
}

/// Where a cash transaction came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CashSource {
    Manual,
    BankImport,
    Netting,
}

/// Allocation-driven status of a cash transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CashStatus {
    /// Nothing allocated yet
    Pending,
    /// Partially allocated
    Partial,
    /// Fully allocated
    Allocated,
    /// Terminal; rejects everything except reads
    Cancelled,
}

impl CashStatus {
    /// Derive the status from the allocated total versus the transaction amount
    pub fn derive(allocated: &BigDecimal, amount: &BigDecimal) -> Self {
        if *allocated == BigDecimal::from(0) {
            CashStatus::Pending
        } else if allocated < amount {
            CashStatus::Partial
        } else {
            CashStatus::Allocated
        }
    }
}

/// A deposit or withdrawal event belonging to one counterparty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashTransaction {
    pub id: Uuid,
    pub counterparty_id: Uuid,
    pub flow: CashFlow,
    pub date: NaiveDate,
    pub amount: BigDecimal,
    pub memo: Option<String>,
    pub source: CashSource,
    pub status: CashStatus,
    /// Overlay flag; set with a mandatory reason, cleared by unhold
    pub hold_reason: Option<String>,
    /// Overlay visibility flag, orthogonal to status
    pub hidden: bool,
    pub hide_reason: Option<String>,
    /// Optimistic-concurrency stamp, bumped on every write
    pub version: u64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl CashTransaction {
    /// Create a new pending transaction with no allocations
    pub fn new(
        counterparty_id: Uuid,
        flow: CashFlow,
        date: NaiveDate,
        amount: BigDecimal,
        memo: Option<String>,
        source: CashSource,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4(),
            counterparty_id,
            flow,
            date,
            amount,
            memo,
            source,
            status: CashStatus::Pending,
            hold_reason: None,
            hidden: false,
            hide_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == CashStatus::Cancelled
    }

    pub fn is_on_hold(&self) -> bool {
        self.hold_reason.is_some()
    }
}

/// The link between a cash transaction and a voucher; the only entity that
/// moves both derived balances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub voucher_id: Uuid,
    pub amount: BigDecimal,
    /// Position within the transaction's allocation list
    pub order: u32,
    /// Cancelled allocations no longer count toward either balance
    pub cancelled: bool,
    pub created_at: NaiveDateTime,
}

impl Allocation {
    pub fn new(transaction_id: Uuid, voucher_id: Uuid, amount: BigDecimal, order: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            voucher_id,
            amount,
            order,
            cancelled: false,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

/// Errors that can occur in the settlement engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("counterparty not found: {0}")]
    CounterpartyNotFound(Uuid),
    #[error("voucher not found: {0}")]
    VoucherNotFound(Uuid),
    #[error("cash transaction not found: {0}")]
    TransactionNotFound(Uuid),
    #[error("upload job not found: {0}")]
    JobNotFound(Uuid),
    #[error(
        "allocations for transaction {transaction_id} total {requested}, \
         exceeding the transaction amount {available}"
    )]
    OverAllocation {
        transaction_id: Uuid,
        requested: BigDecimal,
        available: BigDecimal,
    },
    #[error("allocation of {requested} to voucher {voucher_id} exceeds its balance {balance}")]
    InsufficientBalance {
        voucher_id: Uuid,
        requested: BigDecimal,
        balance: BigDecimal,
    },
    #[error("voucher {voucher_id} is locked and rejects new allocations")]
    VoucherLocked { voucher_id: Uuid },
    #[error("{entity} {id} was modified concurrently; re-read and retry")]
    StaleVersion { entity: &'static str, id: Uuid },
    #[error("upload job {0} is already confirmed")]
    AlreadyConfirmed(Uuid),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("commit failed at row {row}: {reason}")]
    CommitFailed { row: u32, reason: String },
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
