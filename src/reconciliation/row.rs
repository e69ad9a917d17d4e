//! Import row representations and field-level diffing

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::{Voucher, VoucherKind};

/// A row as read from the import file: the canonical input fields, untyped.
/// Kept on the preview so the operator sees exactly what was uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub counterparty_name: String,
    pub kind: String,
    pub trade_date: String,
    pub voucher_no: String,
    pub amount: String,
    pub cost_amount: Option<String>,
    pub memo: Option<String>,
}

/// A row with every field parsed and validated
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRow {
    pub counterparty_name: String,
    pub kind: VoucherKind,
    pub trade_date: NaiveDate,
    pub voucher_no: String,
    pub amount: BigDecimal,
    pub cost_amount: Option<BigDecimal>,
    pub memo: Option<String>,
}

impl RawRow {
    /// Validate and type the row's fields. The error string becomes the
    /// per-row message of an `error` classification; it never fails the job.
    pub fn typed(&self) -> Result<TypedRow, String> {
        let counterparty_name = self.counterparty_name.trim();
        if counterparty_name.is_empty() {
            return Err("counterparty_name is required".to_string());
        }
        let kind = VoucherKind::parse(&self.kind)
            .ok_or_else(|| format!("unknown voucher kind '{}'", self.kind))?;
        let trade_date = NaiveDate::parse_from_str(self.trade_date.trim(), "%Y-%m-%d")
            .map_err(|e| format!("trade_date '{}': {e}", self.trade_date))?;
        let voucher_no = self.voucher_no.trim();
        if voucher_no.is_empty() {
            return Err("voucher_no is required".to_string());
        }
        let amount: BigDecimal = self
            .amount
            .trim()
            .parse()
            .map_err(|_| format!("non-numeric amount '{}'", self.amount))?;
        if amount <= BigDecimal::from(0) {
            return Err(format!("amount must be positive, got '{}'", self.amount));
        }
        let cost_amount = match &self.cost_amount {
            Some(text) if !text.trim().is_empty() => Some(
                text.trim()
                    .parse()
                    .map_err(|_| format!("non-numeric cost_amount '{text}'"))?,
            ),
            _ => None,
        };

        Ok(TypedRow {
            counterparty_name: counterparty_name.to_string(),
            kind,
            trade_date,
            voucher_no: voucher_no.to_string(),
            amount,
            cost_amount,
            memo: self.memo.as_ref().map(|m| m.trim().to_string()).filter(|m| !m.is_empty()),
        })
    }
}

impl TypedRow {
    /// Profit derived from amount and cost, when cost is known
    pub fn profit(&self) -> Option<BigDecimal> {
        self.cost_amount.as_ref().map(|cost| &self.amount - cost)
    }
}

/// The fixed comparable field set used for update/conflict diffs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparableFields {
    pub total_amount: BigDecimal,
    pub cost_amount: Option<BigDecimal>,
    pub profit: Option<BigDecimal>,
    pub memo: Option<String>,
}

impl From<&Voucher> for ComparableFields {
    fn from(voucher: &Voucher) -> Self {
        Self {
            total_amount: voucher.total_amount.clone(),
            cost_amount: voucher.cost_amount.clone(),
            profit: voucher.profit(),
            memo: voucher.memo.clone(),
        }
    }
}

impl From<&TypedRow> for ComparableFields {
    fn from(row: &TypedRow) -> Self {
        Self {
            total_amount: row.amount.clone(),
            cost_amount: row.cost_amount.clone(),
            profit: row.profit(),
            memo: row.memo.clone(),
        }
    }
}

/// One changed field within a diff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: String,
    pub new: String,
}

/// Field-level diff between an existing voucher and an import row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDiff {
    pub before: ComparableFields,
    pub after: ComparableFields,
    pub changes: Vec<FieldChange>,
}

/// Compute the diff over the comparable field set. Returns `None` when
/// nothing differs.
pub fn diff(before: ComparableFields, after: ComparableFields) -> Option<RowDiff> {
    fn show<T: std::fmt::Display>(value: &Option<T>) -> String {
        value
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    let mut changes = Vec::new();
    if before.total_amount != after.total_amount {
        changes.push(FieldChange {
            field: "total_amount".to_string(),
            old: before.total_amount.to_string(),
            new: after.total_amount.to_string(),
        });
    }
    if before.cost_amount != after.cost_amount {
        changes.push(FieldChange {
            field: "cost_amount".to_string(),
            old: show(&before.cost_amount),
            new: show(&after.cost_amount),
        });
    }
    if before.profit != after.profit {
        changes.push(FieldChange {
            field: "profit".to_string(),
            old: show(&before.profit),
            new: show(&after.profit),
        });
    }
    if before.memo != after.memo {
        changes.push(FieldChange {
            field: "memo".to_string(),
            old: show(&before.memo),
            new: show(&after.memo),
        });
    }

    if changes.is_empty() {
        None
    } else {
        Some(RowDiff {
            before,
            after,
            changes,
        })
    }
}
