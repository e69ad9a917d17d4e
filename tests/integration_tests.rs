//! Integration tests for settlement-core

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use settlement_core::{
    utils::{MemoryAuditSink, MemoryStore},
    AllocationEngine, AllocationPolicy, AllocationProposal, CashFlow, CashSource, CashStatus,
    ConflictDecision, CounterpartyDirectory, CounterpartyKind, EngineError, JobConfirmation,
    JobState, LedgerBatch, LedgerStore, RowStatus, SettlementStatus, UnmatchedAction,
    UnmatchedResolution, UploadPipeline, Voucher, VoucherKind,
};
use uuid::Uuid;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

async fn seed_counterparty(store: &MemoryStore, name: &str) -> Uuid {
    let mut directory = CounterpartyDirectory::new(store.clone());
    directory
        .create(name, CounterpartyKind::Both, "seed")
        .await
        .unwrap()
        .id
}

async fn seed_voucher(
    store: &mut MemoryStore,
    counterparty_id: Uuid,
    kind: VoucherKind,
    trade_date: NaiveDate,
    voucher_no: &str,
    total: i64,
) -> Voucher {
    let voucher = Voucher::new(
        counterparty_id,
        kind,
        trade_date,
        voucher_no.to_string(),
        BigDecimal::from(total),
    );
    let mut batch = LedgerBatch::default();
    batch.insert_vouchers.push(voucher.clone());
    store.apply_batch(batch).await.unwrap();
    voucher
}

async fn balance_of(store: &MemoryStore, voucher_id: Uuid) -> BigDecimal {
    store
        .get_voucher(voucher_id)
        .await
        .unwrap()
        .unwrap()
        .balance()
}

#[tokio::test]
async fn fifo_proposal_and_apply_walkthrough() {
    let mut store = MemoryStore::new();
    let acme = seed_counterparty(&store, "Acme Trading").await;
    let v1 = seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 1, 1), "V1", 500).await;
    let v2 = seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 1, 5), "V2", 300).await;

    let mut engine = AllocationEngine::new(store.clone());
    let tx = engine
        .create_transaction(
            acme,
            CashFlow::Deposit,
            date(2024, 1, 10),
            BigDecimal::from(700),
            None,
            CashSource::Manual,
            "tester",
        )
        .await
        .unwrap();
    assert_eq!(tx.status, CashStatus::Pending);

    let proposal = engine.propose_allocation(tx.id).await.unwrap();
    assert_eq!(proposal.len(), 2);
    assert_eq!(proposal[0].voucher_id, v1.id);
    assert_eq!(proposal[0].amount, BigDecimal::from(500));
    assert_eq!(proposal[1].voucher_id, v2.id);
    assert_eq!(proposal[1].amount, BigDecimal::from(200));

    // proposing is a pure read: repeating it yields the same answer
    assert_eq!(engine.propose_allocation(tx.id).await.unwrap(), proposal);

    let applied = engine
        .apply_allocations(tx.id, proposal.clone(), "tester")
        .await
        .unwrap();
    assert_eq!(applied.status, CashStatus::Allocated);
    assert_eq!(balance_of(&store, v1.id).await, BigDecimal::from(0));
    assert_eq!(balance_of(&store, v2.id).await, BigDecimal::from(100));

    // re-running auto-allocate replaces rather than stacks: the plan is
    // computed as if this transaction's own allocations were released
    assert_eq!(engine.propose_allocation(tx.id).await.unwrap(), proposal);
}

#[tokio::test]
async fn reapplying_replaces_the_allocation_set() {
    let mut store = MemoryStore::new();
    let acme = seed_counterparty(&store, "Acme").await;
    let v1 = seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 1, 1), "V1", 400).await;
    let v2 = seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 1, 2), "V2", 400).await;

    let mut engine = AllocationEngine::new(store.clone());
    let tx = engine
        .create_transaction(
            acme,
            CashFlow::Deposit,
            date(2024, 1, 3),
            BigDecimal::from(300),
            None,
            CashSource::Manual,
            "tester",
        )
        .await
        .unwrap();

    engine
        .apply_allocations(
            tx.id,
            vec![AllocationProposal {
                voucher_id: v1.id,
                amount: BigDecimal::from(300),
            }],
            "tester",
        )
        .await
        .unwrap();
    assert_eq!(balance_of(&store, v1.id).await, BigDecimal::from(100));

    // moving the whole amount to v2 releases v1 in the same batch
    engine
        .apply_allocations(
            tx.id,
            vec![AllocationProposal {
                voucher_id: v2.id,
                amount: BigDecimal::from(250),
            }],
            "tester",
        )
        .await
        .unwrap();
    assert_eq!(balance_of(&store, v1.id).await, BigDecimal::from(400));
    assert_eq!(balance_of(&store, v2.id).await, BigDecimal::from(150));

    let tx = engine.get_transaction(tx.id).await.unwrap().unwrap();
    assert_eq!(tx.status, CashStatus::Partial);

    // conservation: active allocations never exceed the transaction amount
    let active: BigDecimal = engine
        .allocations(tx.id)
        .await
        .unwrap()
        .iter()
        .filter(|a| !a.cancelled)
        .map(|a| a.amount.clone())
        .sum();
    assert!(active <= tx.amount);
}

#[tokio::test]
async fn over_allocation_and_wrong_voucher_are_rejected() {
    let mut store = MemoryStore::new();
    let acme = seed_counterparty(&store, "Acme").await;
    let other = seed_counterparty(&store, "Other Partner").await;
    let v_sales =
        seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 1, 1), "S1", 500).await;
    let v_purchase =
        seed_voucher(&mut store, acme, VoucherKind::Purchase, date(2024, 1, 1), "P1", 500).await;
    let v_foreign =
        seed_voucher(&mut store, other, VoucherKind::Sales, date(2024, 1, 1), "F1", 500).await;

    let mut engine = AllocationEngine::new(store.clone());
    let tx = engine
        .create_transaction(
            acme,
            CashFlow::Deposit,
            date(2024, 1, 2),
            BigDecimal::from(200),
            None,
            CashSource::Manual,
            "tester",
        )
        .await
        .unwrap();

    let err = engine
        .apply_allocations(
            tx.id,
            vec![AllocationProposal {
                voucher_id: v_sales.id,
                amount: BigDecimal::from(201),
            }],
            "tester",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OverAllocation { .. }));

    let err = engine
        .apply_allocations(
            tx.id,
            vec![AllocationProposal {
                voucher_id: v_purchase.id,
                amount: BigDecimal::from(100),
            }],
            "tester",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = engine
        .apply_allocations(
            tx.id,
            vec![AllocationProposal {
                voucher_id: v_foreign.id,
                amount: BigDecimal::from(100),
            }],
            "tester",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    // a locked voucher rejects allocations outright
    let mut locked = store.get_voucher(v_sales.id).await.unwrap().unwrap();
    let version = locked.version;
    locked.settlement_status = SettlementStatus::Locked;
    let mut batch = LedgerBatch::default();
    batch
        .update_vouchers
        .push(settlement_core::VersionedWrite::new(locked, version));
    store.apply_batch(batch).await.unwrap();

    let err = engine
        .apply_allocations(
            tx.id,
            vec![AllocationProposal {
                voucher_id: v_sales.id,
                amount: BigDecimal::from(100),
            }],
            "tester",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::VoucherLocked { .. }));

    // nothing landed along the way
    let tx = engine.get_transaction(tx.id).await.unwrap().unwrap();
    assert_eq!(tx.status, CashStatus::Pending);
}

#[tokio::test]
async fn cancel_restores_balances_and_is_terminal() {
    let mut store = MemoryStore::new();
    let acme = seed_counterparty(&store, "Acme").await;
    let v1 = seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 1, 1), "V1", 500).await;
    let v2 = seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 1, 2), "V2", 300).await;

    let mut engine = AllocationEngine::new(store.clone());
    let tx = engine
        .create_transaction(
            acme,
            CashFlow::Deposit,
            date(2024, 1, 3),
            BigDecimal::from(700),
            None,
            CashSource::Manual,
            "tester",
        )
        .await
        .unwrap();
    let proposal = engine.propose_allocation(tx.id).await.unwrap();
    engine
        .apply_allocations(tx.id, proposal, "tester")
        .await
        .unwrap();

    let before: BigDecimal =
        balance_of(&store, v1.id).await + balance_of(&store, v2.id).await;
    let cancelled = engine.cancel(tx.id, "tester").await.unwrap();
    assert_eq!(cancelled.status, CashStatus::Cancelled);

    let after: BigDecimal = balance_of(&store, v1.id).await + balance_of(&store, v2.id).await;
    assert_eq!(after - before, BigDecimal::from(700));

    // terminal: everything but reads is rejected now
    assert!(engine.cancel(tx.id, "tester").await.is_err());
    assert!(engine.hold(tx.id, "too late", "tester").await.is_err());
    assert!(engine
        .apply_allocations(
            tx.id,
            vec![AllocationProposal {
                voucher_id: v1.id,
                amount: BigDecimal::from(1),
            }],
            "tester",
        )
        .await
        .is_err());
}

#[tokio::test]
async fn hold_requires_a_reason_and_blocks_apply_by_default() {
    let mut store = MemoryStore::new();
    let acme = seed_counterparty(&store, "Acme").await;
    let v1 = seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 1, 1), "V1", 500).await;

    let mut engine = AllocationEngine::new(store.clone());
    let tx = engine
        .create_transaction(
            acme,
            CashFlow::Deposit,
            date(2024, 1, 2),
            BigDecimal::from(100),
            None,
            CashSource::Manual,
            "tester",
        )
        .await
        .unwrap();

    assert!(engine.hold(tx.id, "  ", "tester").await.is_err());
    engine.hold(tx.id, "awaiting bank detail", "tester").await.unwrap();

    let err = engine
        .apply_allocations(
            tx.id,
            vec![AllocationProposal {
                voucher_id: v1.id,
                amount: BigDecimal::from(100),
            }],
            "tester",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    engine.unhold(tx.id, "tester").await.unwrap();
    engine
        .apply_allocations(
            tx.id,
            vec![AllocationProposal {
                voucher_id: v1.id,
                amount: BigDecimal::from(100),
            }],
            "tester",
        )
        .await
        .unwrap();

    // with the policy flag off, a held transaction still takes allocations
    let mut permissive = AllocationEngine::new(store.clone()).with_policy(AllocationPolicy {
        hold_blocks_apply: false,
    });
    let tx2 = permissive
        .create_transaction(
            acme,
            CashFlow::Deposit,
            date(2024, 1, 3),
            BigDecimal::from(50),
            None,
            CashSource::Manual,
            "tester",
        )
        .await
        .unwrap();
    permissive.hold(tx2.id, "review", "tester").await.unwrap();
    permissive
        .apply_allocations(
            tx2.id,
            vec![AllocationProposal {
                voucher_id: v1.id,
                amount: BigDecimal::from(50),
            }],
            "tester",
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn hide_is_orthogonal_to_status() {
    let store = MemoryStore::new();
    let acme = seed_counterparty(&store, "Acme").await;

    let mut engine = AllocationEngine::new(store.clone());
    let tx = engine
        .create_transaction(
            acme,
            CashFlow::Withdrawal,
            date(2024, 1, 2),
            BigDecimal::from(100),
            None,
            CashSource::BankImport,
            "tester",
        )
        .await
        .unwrap();

    let hidden = engine
        .hide(tx.id, Some("out of scope".to_string()), "tester")
        .await
        .unwrap();
    assert!(hidden.hidden);
    assert_eq!(hidden.status, CashStatus::Pending);

    let visible = engine.unhide(tx.id, "tester").await.unwrap();
    assert!(!visible.hidden);
}

const CSV_HEADER: &str = "counterparty_name,kind,trade_date,voucher_no,amount,cost_amount,memo\n";

#[tokio::test]
async fn upload_pipeline_end_to_end() {
    let mut store = MemoryStore::new();
    let acme = seed_counterparty(&store, "Acme Trading").await;

    // update target: no progress, amount changes 400 -> 450
    seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 2, 1), "U-1", 400).await;

    // conflict target: carries allocation progress
    let conflicted =
        seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 2, 2), "C-1", 400).await;
    let mut engine = AllocationEngine::new(store.clone());
    let tx = engine
        .create_transaction(
            acme,
            CashFlow::Deposit,
            date(2024, 2, 3),
            BigDecimal::from(100),
            None,
            CashSource::Manual,
            "seed",
        )
        .await
        .unwrap();
    engine
        .apply_allocations(
            tx.id,
            vec![AllocationProposal {
                voucher_id: conflicted.id,
                amount: BigDecimal::from(100),
            }],
            "seed",
        )
        .await
        .unwrap();

    // locked target
    let locked =
        seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 2, 4), "L-1", 400).await;
    let mut locked_v = store.get_voucher(locked.id).await.unwrap().unwrap();
    let version = locked_v.version;
    locked_v.settlement_status = SettlementStatus::Locked;
    let mut batch = LedgerBatch::default();
    batch
        .update_vouchers
        .push(settlement_core::VersionedWrite::new(locked_v, version));
    store.apply_batch(batch).await.unwrap();

    let file = format!(
        "{CSV_HEADER}\
         Acme Trading,sales,2024-02-05,N-1,500,,brand new\n\
         Acme Trading,sales,2024-02-01,U-1,450,,\n\
         Acme Trading,sales,2024-02-02,C-1,425,,\n\
         Fresh Farms,sales,2024-02-06,N-2,200,,\n\
         Acme Trading,sales,2024-02-04,L-1,999,,\n\
         Acme Trading,sales,2024-02-05,N-1,500,,dup of row 0\n\
         Acme Trading,sales,2024-02-07,E-1,not-a-number,,\n"
    );

    let sink = MemoryAuditSink::new();
    let mut pipeline = UploadPipeline::with_audit(store.clone(), Box::new(sink.clone()));
    let job = pipeline.create_job("trades.csv").await.unwrap();
    let status = pipeline.ingest(job.id, file.as_bytes()).await.unwrap();
    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.progress, 100);

    let job = pipeline.get_job(job.id).await.unwrap();
    let statuses: Vec<RowStatus> = job.rows.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            RowStatus::New,
            RowStatus::Update,
            RowStatus::Conflict,
            RowStatus::Unmatched,
            RowStatus::Locked,
            RowStatus::Excluded,
            RowStatus::Error,
        ]
    );

    let diff = job.rows[1].diff.as_ref().unwrap();
    assert_eq!(diff.changes.len(), 1);
    assert_eq!(diff.changes[0].field, "total_amount");
    assert_eq!(diff.changes[0].old, "400");
    assert_eq!(diff.changes[0].new, "450");

    let summary = job.result_summary.as_ref().unwrap();
    assert_eq!(summary.new_count, 1);
    assert_eq!(summary.update_count, 1);
    assert_eq!(summary.conflict_count, 1);
    assert_eq!(summary.unmatched_count, 1);
    assert_eq!(summary.locked_count, 1);
    assert_eq!(summary.excluded_count, 1);
    assert_eq!(summary.error_count, 1);

    // human step: create the missing counterparty, then rematch
    assert_eq!(job.unmatched_names(), vec!["Fresh Farms"]);
    let job = pipeline
        .resolve_unmatched(
            job.id,
            vec![UnmatchedResolution {
                name: "Fresh Farms".to_string(),
                action: UnmatchedAction::Create,
            }],
            "operator",
        )
        .await
        .unwrap();
    assert_eq!(job.rows[3].status, RowStatus::New);
    assert_eq!(job.result_summary.as_ref().unwrap().new_count, 2);
    assert_eq!(job.result_summary.as_ref().unwrap().unmatched_count, 0);
    // already-resolved rows were untouched by the rematch
    assert_eq!(job.rows[1].status, RowStatus::Update);

    // human step: approve the conflict
    let job = pipeline
        .decide_conflict(job.id, 2, ConflictDecision::Approve)
        .await
        .unwrap();
    assert_eq!(job.rows[2].status, RowStatus::Conflict);

    let mut confirmation = JobConfirmation::with_audit(store.clone(), Box::new(sink.clone()));
    let outcome = confirmation.confirm(job.id, "operator").await.unwrap();
    assert!(!outcome.already_confirmed);
    assert_eq!(outcome.created, 2);
    assert_eq!(outcome.updated, 2);

    // the new vouchers exist, the update landed, the locked voucher is untouched
    let updated = store
        .find_voucher_by_key(&settlement_core::VoucherKey {
            counterparty_id: acme,
            kind: VoucherKind::Sales,
            trade_date: date(2024, 2, 1),
            voucher_no: "U-1".to_string(),
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.total_amount, BigDecimal::from(450));

    let conflicted_after = store.get_voucher(conflicted.id).await.unwrap().unwrap();
    assert_eq!(conflicted_after.total_amount, BigDecimal::from(425));
    assert_eq!(conflicted_after.allocated_amount, BigDecimal::from(100));

    let locked_after = store.get_voucher(locked.id).await.unwrap().unwrap();
    assert_eq!(locked_after.total_amount, BigDecimal::from(400));

    let job = pipeline.get_job(job.id).await.unwrap();
    assert!(job.is_confirmed);
    assert_eq!(job.confirmed_by.as_deref(), Some("operator"));

    // second confirm: idempotent no-op with the same summary
    let again = confirmation.confirm(job.id, "operator").await.unwrap();
    assert!(again.already_confirmed);
    assert_eq!(again.created, 0);
    assert_eq!(again.updated, 0);
    assert_eq!(again.summary, outcome.summary);

    // a confirmed job is append-only: pipeline mutations are refused
    assert!(pipeline.rematch(job.id).await.is_err());
    assert!(pipeline
        .decide_conflict(job.id, 2, ConflictDecision::Reject)
        .await
        .is_err());

    // the human resolution and the commit both left an audit trail
    let actions: Vec<String> = sink.records().iter().map(|r| r.action.clone()).collect();
    assert!(actions.contains(&"counterparty.create".to_string()));
    assert!(actions.contains(&"upload_job.confirm".to_string()));
}

#[tokio::test]
async fn undecided_conflicts_and_unmatched_rows_stay_untouched() {
    let mut store = MemoryStore::new();
    let acme = seed_counterparty(&store, "Acme").await;
    seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 3, 1), "U-1", 100).await;
    seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 3, 2), "U-2", 100).await;

    let conflicted =
        seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 3, 3), "C-1", 100).await;
    let mut with_progress = store.get_voucher(conflicted.id).await.unwrap().unwrap();
    let version = with_progress.version;
    with_progress.settlement_status = SettlementStatus::Settling;
    let mut batch = LedgerBatch::default();
    batch
        .update_vouchers
        .push(settlement_core::VersionedWrite::new(with_progress, version));
    store.apply_batch(batch).await.unwrap();

    // 3 new, 2 update, 1 undecided conflict, 1 unmatched -> exactly 5 writes
    let file = format!(
        "{CSV_HEADER}\
         Acme,sales,2024-03-10,N-1,10,,\n\
         Acme,sales,2024-03-11,N-2,20,,\n\
         Acme,sales,2024-03-12,N-3,30,,\n\
         Acme,sales,2024-03-01,U-1,110,,\n\
         Acme,sales,2024-03-02,U-2,120,,\n\
         Acme,sales,2024-03-03,C-1,130,,\n\
         Stranger,sales,2024-03-13,X-1,40,,\n"
    );

    let mut pipeline = UploadPipeline::new(store.clone());
    let job = pipeline.create_job("batch.csv").await.unwrap();
    pipeline.ingest(job.id, file.as_bytes()).await.unwrap();

    let mut confirmation = JobConfirmation::new(store.clone());
    let outcome = confirmation.confirm(job.id, "operator").await.unwrap();
    assert_eq!(outcome.created, 3);
    assert_eq!(outcome.updated, 2);

    let untouched = store.get_voucher(conflicted.id).await.unwrap().unwrap();
    assert_eq!(untouched.total_amount, BigDecimal::from(100));

    let job = pipeline.get_job(job.id).await.unwrap();
    assert!(job.is_confirmed);
    assert_eq!(job.rows[6].status, RowStatus::Unmatched);
}

#[tokio::test]
async fn classification_is_pure_and_repeatable() {
    let mut store = MemoryStore::new();
    let acme = seed_counterparty(&store, "Acme").await;
    seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 4, 1), "V-1", 100).await;

    let file = format!(
        "{CSV_HEADER}\
         Acme,sales,2024-04-01,V-1,150,,\n\
         Acme,sales,2024-04-02,V-2,200,,\n\
         Ghost,sales,2024-04-03,V-3,300,,\n"
    );

    let mut pipeline = UploadPipeline::new(store.clone());
    let first = pipeline.create_job("a.csv").await.unwrap();
    pipeline.ingest(first.id, file.as_bytes()).await.unwrap();
    let second = pipeline.create_job("b.csv").await.unwrap();
    pipeline.ingest(second.id, file.as_bytes()).await.unwrap();

    let first = pipeline.get_job(first.id).await.unwrap();
    let second = pipeline.get_job(second.id).await.unwrap();
    let classify = |job: &settlement_core::UploadJob| -> Vec<RowStatus> {
        job.rows.iter().map(|r| r.status).collect()
    };
    assert_eq!(classify(&first), classify(&second));
    assert_eq!(first.result_summary, second.result_summary);
}

#[tokio::test]
async fn malformed_file_fails_the_job_and_blocks_confirm() {
    let store = MemoryStore::new();
    let mut pipeline = UploadPipeline::new(store.clone());
    let job = pipeline.create_job("broken.csv").await.unwrap();

    let file = format!("{CSV_HEADER}Acme,sales,2024-01-01,V-1,100,,\nAcme,sales\n");
    let status = pipeline.ingest(job.id, file.as_bytes()).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert!(status.error_message.is_some());

    let mut confirmation = JobConfirmation::new(store);
    let err = confirmation.confirm(job.id, "operator").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

#[tokio::test]
async fn concurrent_voucher_edit_fails_the_commit_atomically() {
    let mut store = MemoryStore::new();
    let acme = seed_counterparty(&store, "Acme").await;
    let target =
        seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 5, 1), "U-1", 100).await;

    let file = format!(
        "{CSV_HEADER}\
         Acme,sales,2024-05-01,U-1,150,,\n\
         Acme,sales,2024-05-02,N-1,200,,\n"
    );
    let mut pipeline = UploadPipeline::new(store.clone());
    let job = pipeline.create_job("c.csv").await.unwrap();
    pipeline.ingest(job.id, file.as_bytes()).await.unwrap();

    // someone edits the voucher between classification and confirm
    let mut edited = store.get_voucher(target.id).await.unwrap().unwrap();
    let version = edited.version;
    edited.memo = Some("edited elsewhere".to_string());
    let mut batch = LedgerBatch::default();
    batch
        .update_vouchers
        .push(settlement_core::VersionedWrite::new(edited, version));
    store.apply_batch(batch).await.unwrap();

    let mut confirmation = JobConfirmation::new(store.clone());
    let err = confirmation.confirm(job.id, "operator").await.unwrap_err();
    assert!(matches!(err, EngineError::StaleVersion { .. }));

    // all-or-nothing: the new row was rolled back with the rest
    let key = settlement_core::VoucherKey {
        counterparty_id: acme,
        kind: VoucherKind::Sales,
        trade_date: date(2024, 5, 2),
        voucher_no: "N-1".to_string(),
    };
    assert!(store.find_voucher_by_key(&key).await.unwrap().is_none());
    let job = pipeline.get_job(job.id).await.unwrap();
    assert!(!job.is_confirmed);
}

/// xorshift64, seeded: reproducible pseudo-random operation sequences
/// without pulling in a randomness crate
struct SeqRng(u64);

impl SeqRng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

#[tokio::test]
async fn random_apply_and_cancel_sequences_preserve_invariants() {
    let mut store = MemoryStore::new();
    let acme = seed_counterparty(&store, "Acme").await;
    let mut voucher_ids = Vec::new();
    for i in 0..4 {
        let v = seed_voucher(
            &mut store,
            acme,
            VoucherKind::Sales,
            date(2024, 7, i + 1),
            &format!("V-{i}"),
            200,
        )
        .await;
        voucher_ids.push(v.id);
    }

    let mut engine = AllocationEngine::new(store.clone());
    let mut rng = SeqRng(0x5eed_cafe);
    let mut transactions = Vec::new();

    for step in 0..60u64 {
        match rng.below(4) {
            0 => {
                let tx = engine
                    .create_transaction(
                        acme,
                        CashFlow::Deposit,
                        date(2024, 8, 1),
                        BigDecimal::from((rng.below(300) + 1) as i64),
                        None,
                        CashSource::Manual,
                        "fuzz",
                    )
                    .await
                    .unwrap();
                transactions.push(tx.id);
            }
            1 if !transactions.is_empty() => {
                let tx_id = transactions[rng.below(transactions.len() as u64) as usize];
                // a fresh FIFO proposal is always within the invariants
                if let Ok(proposal) = engine.propose_allocation(tx_id).await {
                    let _ = engine.apply_allocations(tx_id, proposal, "fuzz").await;
                }
            }
            2 if !transactions.is_empty() => {
                let tx_id = transactions[rng.below(transactions.len() as u64) as usize];
                let voucher_id = voucher_ids[rng.below(voucher_ids.len() as u64) as usize];
                // arbitrary manual edits may be rejected; they must never
                // leave a partially-applied state behind
                let _ = engine
                    .apply_allocations(
                        tx_id,
                        vec![AllocationProposal {
                            voucher_id,
                            amount: BigDecimal::from((rng.below(400) + 1) as i64),
                        }],
                        "fuzz",
                    )
                    .await;
            }
            _ if !transactions.is_empty() => {
                let tx_id = transactions[rng.below(transactions.len() as u64) as usize];
                let _ = engine.cancel(tx_id, "fuzz").await;
            }
            _ => {}
        }

        // conservation and balance bounds hold after every step
        for &tx_id in &transactions {
            let tx = engine.get_transaction(tx_id).await.unwrap().unwrap();
            let active: BigDecimal = engine
                .allocations(tx_id)
                .await
                .unwrap()
                .iter()
                .filter(|a| !a.cancelled)
                .map(|a| a.amount.clone())
                .sum();
            assert!(active <= tx.amount, "conservation violated at step {step}");
            if tx.status == CashStatus::Cancelled {
                assert_eq!(active, BigDecimal::from(0));
            }
        }
        for &voucher_id in &voucher_ids {
            let v = store.get_voucher(voucher_id).await.unwrap().unwrap();
            let balance = v.balance();
            assert!(balance >= BigDecimal::from(0), "negative balance at step {step}");
            assert!(balance <= v.total_amount, "balance overflow at step {step}");
        }
    }
}

#[tokio::test]
async fn state_changing_operations_emit_audit_records() {
    let mut store = MemoryStore::new();
    let sink = MemoryAuditSink::new();
    let acme = seed_counterparty(&store, "Acme").await;
    let v1 = seed_voucher(&mut store, acme, VoucherKind::Sales, date(2024, 6, 1), "V1", 100).await;

    let mut engine = AllocationEngine::with_audit(store.clone(), Box::new(sink.clone()));
    let tx = engine
        .create_transaction(
            acme,
            CashFlow::Deposit,
            date(2024, 6, 2),
            BigDecimal::from(100),
            None,
            CashSource::Manual,
            "alice",
        )
        .await
        .unwrap();
    engine
        .apply_allocations(
            tx.id,
            vec![AllocationProposal {
                voucher_id: v1.id,
                amount: BigDecimal::from(40),
            }],
            "alice",
        )
        .await
        .unwrap();
    engine.cancel(tx.id, "bob").await.unwrap();

    let actions: Vec<String> = sink.records().iter().map(|r| r.action.clone()).collect();
    assert_eq!(
        actions,
        vec![
            "cash_transaction.create",
            "cash_transaction.allocate",
            "cash_transaction.cancel",
        ]
    );
    assert_eq!(sink.records()[2].actor, "bob");
    assert_eq!(sink.records()[2].target, tx.id.to_string());
}
