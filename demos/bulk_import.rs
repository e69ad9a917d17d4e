//! Bulk import walk-through: upload a trade file, resolve an unmatched
//! counterparty, approve a conflict, and confirm the job.

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use settlement_core::{
    utils::MemoryStore, ConflictDecision, CounterpartyDirectory, CounterpartyKind,
    JobConfirmation, LedgerBatch, LedgerStore, RowStatus, UnmatchedAction, UnmatchedResolution,
    UploadPipeline, Voucher, VoucherKind,
};

const FILE: &str = "\
counterparty_name,kind,trade_date,voucher_no,amount,cost_amount,memo
Acme Trading,sales,2024-02-01,U-1,450,,revised total
Acme Trading,sales,2024-02-05,N-1,500,,new trade
Fresh Farms,sales,2024-02-06,N-2,200,,first delivery
";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = MemoryStore::new();

    let mut directory = CounterpartyDirectory::new(store.clone());
    let acme = directory
        .create("Acme Trading", CounterpartyKind::Both, "demo")
        .await?;

    let mut batch = LedgerBatch::default();
    batch.insert_vouchers.push(Voucher::new(
        acme.id,
        VoucherKind::Sales,
        NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        "U-1".to_string(),
        BigDecimal::from(400),
    ));
    store.apply_batch(batch).await?;

    let mut pipeline = UploadPipeline::new(store.clone());
    let job = pipeline.create_job("trades.csv").await?;
    let status = pipeline.ingest(job.id, FILE.as_bytes()).await?;
    println!("job {:?} at {}%", status.state, status.progress);

    let job = pipeline.get_job(job.id).await?;
    for row in &job.rows {
        println!(
            "  row {}: {:?} ({})",
            row.index, row.status, row.raw.counterparty_name
        );
    }

    for name in job.unmatched_names() {
        println!("resolving unmatched name '{name}'");
        pipeline
            .resolve_unmatched(
                job.id,
                vec![UnmatchedResolution {
                    name,
                    action: UnmatchedAction::Create,
                }],
                "demo",
            )
            .await?;
    }

    let job = pipeline.get_job(job.id).await?;
    for row in &job.rows {
        if row.status == RowStatus::Conflict {
            pipeline
                .decide_conflict(job.id, row.index, ConflictDecision::Approve)
                .await?;
        }
    }

    let mut confirmation = JobConfirmation::new(store);
    let outcome = confirmation.confirm(job.id, "demo").await?;
    println!(
        "confirmed: {} created, {} updated, summary {:?}",
        outcome.created, outcome.updated, outcome.summary
    );

    Ok(())
}
