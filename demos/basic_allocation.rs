//! Basic allocation walk-through: create a counterparty and two vouchers,
//! take a deposit, and settle it oldest-voucher-first.

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use settlement_core::{
    utils::MemoryStore, AllocationEngine, CashFlow, CashSource, CounterpartyDirectory,
    CounterpartyKind, LedgerBatch, LedgerStore, Voucher, VoucherKind,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = MemoryStore::new();

    let mut directory = CounterpartyDirectory::new(store.clone());
    let acme = directory
        .create("Acme Trading", CounterpartyKind::Both, "demo")
        .await?;

    let date = |d: u32| NaiveDate::from_ymd_opt(2024, 1, d).unwrap();
    let mut batch = LedgerBatch::default();
    batch.insert_vouchers.push(Voucher::new(
        acme.id,
        VoucherKind::Sales,
        date(1),
        "V1".to_string(),
        BigDecimal::from(500),
    ));
    batch.insert_vouchers.push(Voucher::new(
        acme.id,
        VoucherKind::Sales,
        date(5),
        "V2".to_string(),
        BigDecimal::from(300),
    ));
    store.apply_batch(batch).await?;

    let mut engine = AllocationEngine::new(store.clone());
    let tx = engine
        .create_transaction(
            acme.id,
            CashFlow::Deposit,
            date(10),
            BigDecimal::from(700),
            Some("January remittance".to_string()),
            CashSource::Manual,
            "demo",
        )
        .await?;
    println!("created {:?} transaction of {}", tx.flow, tx.amount);

    let proposal = engine.propose_allocation(tx.id).await?;
    for p in &proposal {
        println!("  propose {} -> voucher {}", p.amount, p.voucher_id);
    }

    let applied = engine.apply_allocations(tx.id, proposal, "demo").await?;
    println!("transaction status: {:?}", applied.status);

    for voucher in store.list_open_vouchers(acme.id, VoucherKind::Sales).await? {
        println!(
            "voucher {} balance remaining: {}",
            voucher.voucher_no,
            voucher.balance()
        );
    }

    Ok(())
}
