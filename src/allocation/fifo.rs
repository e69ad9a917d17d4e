//! Oldest-voucher-first automatic allocation
//!
//! Pure and deterministic: given the same amount and voucher set, repeated
//! calls return the same proposal. Never over-allocates by construction.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Voucher;

/// A proposed assignment of part of a transaction's amount to one voucher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationProposal {
    pub voucher_id: Uuid,
    pub amount: BigDecimal,
}

/// Propose a default allocation of `amount` across `vouchers`.
///
/// Vouchers are taken in `(trade_date, voucher_no)` ascending order, each
/// assigned `min(remaining, balance)` until the amount is consumed or the
/// vouchers run out. Locked and fully-allocated vouchers are skipped.
pub fn propose(amount: &BigDecimal, vouchers: &[Voucher]) -> Vec<AllocationProposal> {
    let zero = BigDecimal::from(0);

    let mut open: Vec<&Voucher> = vouchers
        .iter()
        .filter(|v| !v.is_locked() && v.balance() > zero)
        .collect();
    open.sort_by(|a, b| {
        a.trade_date
            .cmp(&b.trade_date)
            .then_with(|| a.voucher_no.cmp(&b.voucher_no))
    });

    let mut remaining = amount.clone();
    let mut proposals = Vec::new();
    for voucher in open {
        if remaining <= zero {
            break;
        }
        let take = remaining.clone().min(voucher.balance());
        remaining = &remaining - &take;
        proposals.push(AllocationProposal {
            voucher_id: voucher.id,
            amount: take,
        });
    }
    proposals
}
