//! End-to-end settlement scenarios driven through `EventProcessor::tick`
//! against the in-memory repositories, exercising the scenarios that no
//! inline unit test already covers: single-filament tray fallback,
//! idempotent operator resolution of a pending attribution, and a
//! cancellation reaching `settle_terminal` through the real lifecycle
//! transition rather than a hardcoded `cancelled: true` argument.

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use printfarm_ledger_engine::db::memory::MemoryRepos;
use printfarm_ledger_engine::db::models::{JobStatus, LedgerKind, MaterialStock, NormalizedEventType};
use printfarm_ledger_engine::db::repo::{ConsumptionRepo, JobRepo, LedgerRepo, NormalizedEventRepo, StockRepo};
use printfarm_ledger_engine::settlement::resolve::resolve_pending;
use printfarm_ledger_engine::settlement::snapshot::JobSnapshot;
use printfarm_ledger_engine::settlement::EventProcessor;

fn stock(material: &str, color: &str, brand: &str, remaining: i64) -> MaterialStock {
    let now = Utc::now();
    MaterialStock {
        id: Uuid::new_v4(),
        material: material.into(),
        color: color.into(),
        brand: brand.into(),
        roll_weight_grams: 1000,
        remaining_grams: remaining,
        is_archived: false,
        archived_at: None,
        created_at: now,
        updated_at: now,
    }
}

async fn push_event(repos: &MemoryRepos, printer_id: Uuid, kind: NormalizedEventType, payload: serde_json::Value, occurred_at: chrono::DateTime<Utc>) {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    payload.to_string().hash(&mut hasher);
    let hash = hasher.finish();
    repos
        .insert_if_absent(&format!("evt-{hash:x}"), printer_id, kind, occurred_at, payload, 1)
        .await
        .unwrap();
}

/// Scenario 4: a single-filament job whose filament entry carries no
/// `tray_id` falls back to `tray_now` for tray resolution, reserves
/// against that tray's stock, and settles one consumption record for
/// the `used_g` total at end.
#[tokio::test]
async fn single_filament_falls_back_to_tray_now() {
    let repos = MemoryRepos::new();
    let printer_id = Uuid::new_v4();
    let s = stock("PLA", "#FFFFFF", "official", 500);
    let stock_id = s.id;
    repos.seed_stock(s);

    let mut processor = EventProcessor::new(repos, false);
    let t0 = Utc::now();
    let ams = json!({"tray_now": "0", "tray": [{"id": 0, "tray_type": "PLA", "tray_color": "FFFFFF", "tag_uid": "X"}]});

    push_event(
        processor.repos(),
        printer_id,
        NormalizedEventType::PrintStarted,
        json!({"print": {"gcode_state": "RUNNING", "task_id": "job-4", "ams": ams.clone()}}),
        t0,
    )
    .await;
    push_event(
        processor.repos(),
        printer_id,
        NormalizedEventType::PrintProgress,
        // No `tray_id` on the filament entry: one filament item and a
        // single AMS tray make the fallback to `tray_now` unambiguous.
        json!({"print": {"gcode_state": "RUNNING", "task_id": "job-4", "filament": [{"total_g": 60}], "ams": ams.clone()}}),
        t0 + Duration::seconds(5),
    )
    .await;
    push_event(
        processor.repos(),
        printer_id,
        NormalizedEventType::PrintEnded,
        json!({"print": {"gcode_state": "FINISH", "task_id": "job-4", "filament": [{"used_g": 60}], "ams": ams}}),
        t0 + Duration::seconds(60),
    )
    .await;

    processor.tick().await.unwrap();

    let final_stock = StockRepo::find_by_id(processor.repos(), stock_id).await.unwrap().unwrap();
    assert_eq!(final_stock.remaining_grams, 440);

    let job = processor.repos().find_by_key(printer_id, &format!("{printer_id}:job-4")).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Ended);
    let consumptions = processor.repos().find_by_job(job.id).await.unwrap();
    assert_eq!(consumptions.len(), 1);
    assert_eq!(consumptions[0].grams, 60);
}

/// Scenario 5: two third-party stocks share `(material, color)` and
/// differ only by brand, so automatic resolution is ambiguous and the
/// job ends with a pending attribution. An operator resolving the same
/// `{tray -> stock}` mapping twice produces exactly one consumption
/// record; the unresolved stock is left untouched.
#[tokio::test]
async fn pending_resolution_is_idempotent() {
    let repos = MemoryRepos::new();
    let printer_id = Uuid::new_v4();
    let stock_a = stock("PLA", "#FF0000", "brand-a", 1000);
    let stock_b = stock("PLA", "#FF0000", "brand-b", 1000);
    let stock_a_id = stock_a.id;
    let stock_b_id = stock_b.id;
    repos.seed_stock(stock_a);
    repos.seed_stock(stock_b);

    let mut processor = EventProcessor::new(repos, false);
    let t0 = Utc::now();
    let ams = json!({"tray_now": "0", "tray": [{"id": 0, "tray_type": "PLA", "tray_color": "FF0000", "tag_uid": "X"}]});

    push_event(
        processor.repos(),
        printer_id,
        NormalizedEventType::PrintStarted,
        json!({"print": {"gcode_state": "RUNNING", "task_id": "job-5", "ams": ams.clone()}}),
        t0,
    )
    .await;
    push_event(
        processor.repos(),
        printer_id,
        NormalizedEventType::PrintEnded,
        json!({"print": {"gcode_state": "FINISH", "task_id": "job-5", "filament": [{"tray_id": 0, "used_g": 80}], "ams": ams}}),
        t0 + Duration::seconds(60),
    )
    .await;

    processor.tick().await.unwrap();

    let job = processor.repos().find_by_key(printer_id, &format!("{printer_id}:job-5")).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Ended);
    assert!(processor.repos().find_by_job(job.id).await.unwrap().is_empty(), "ambiguous tray must not auto-settle");

    let mut snapshot = JobSnapshot::from_json(&job.snapshot);
    assert_eq!(snapshot.pending_consumptions.len(), 1);
    assert_eq!(snapshot.pending_consumptions[0].tray_id, 0);

    resolve_pending(processor.repos(), processor.repos(), processor.repos(), job.id, &mut snapshot, 0, stock_a_id)
        .await
        .unwrap();
    resolve_pending(processor.repos(), processor.repos(), processor.repos(), job.id, &mut snapshot, 0, stock_a_id)
        .await
        .unwrap();

    let consumptions = processor.repos().find_by_job(job.id).await.unwrap();
    assert_eq!(consumptions.len(), 1, "resolving the same tray twice must not duplicate the consumption");
    assert_eq!(consumptions[0].stock_id, Some(stock_a_id));
    assert_eq!(consumptions[0].grams, 80);

    let final_a = StockRepo::find_by_id(processor.repos(), stock_a_id).await.unwrap().unwrap();
    let final_b = StockRepo::find_by_id(processor.repos(), stock_b_id).await.unwrap().unwrap();
    assert_eq!(final_a.remaining_grams, 920);
    assert_eq!(final_b.remaining_grams, 1000);
    assert!(snapshot.pending_consumptions.is_empty());
    assert!(!snapshot.pending_trays.contains(&0));
}

/// A `CANCELED` gcode frame is normalized as `NormalizedEventType::PrintFailed`
/// (there is no distinct canceled event kind), so the job lifecycle must
/// recover the cancellation from `gcode_state` itself rather than from
/// `kind`. Driven through `tick()` end to end rather than calling
/// `settle_terminal` directly, since that is the path the ordering bug
/// between the CANCELED and FAILED branches of `next_status` hid behind.
#[tokio::test]
async fn canceled_frame_ends_the_job_cancelled_and_refunds_the_unused_reservation() {
    let repos = MemoryRepos::new();
    let printer_id = Uuid::new_v4();
    let s = stock("PLA", "#FFFFFF", "official", 2000);
    let stock_id = s.id;
    repos.seed_stock(s);

    let mut processor = EventProcessor::new(repos, false);
    let t0 = Utc::now();
    let ams = json!({"tray_now": "0", "tray": [{"id": 0, "tray_type": "PLA", "tray_color": "FFFFFF", "tag_uid": "X"}]});

    push_event(
        processor.repos(),
        printer_id,
        NormalizedEventType::PrintStarted,
        json!({"print": {"gcode_state": "RUNNING", "task_id": "job-6", "ams": ams.clone()}}),
        t0,
    )
    .await;
    push_event(
        processor.repos(),
        printer_id,
        NormalizedEventType::PrintProgress,
        json!({"print": {"gcode_state": "RUNNING", "task_id": "job-6", "filament": [{"total_g": 100}], "ams": ams.clone()}}),
        t0 + Duration::seconds(5),
    )
    .await;
    // What the real Ingestor actually emits for a canceled print: the
    // derived `kind` collapses to `PrintFailed`, only `gcode_state`
    // carries the cancellation.
    push_event(
        processor.repos(),
        printer_id,
        NormalizedEventType::PrintFailed,
        json!({"print": {"gcode_state": "CANCELED", "task_id": "job-6", "filament": [{"used_g": 30}], "ams": ams}}),
        t0 + Duration::seconds(20),
    )
    .await;

    processor.tick().await.unwrap();

    let job = processor.repos().find_by_key(printer_id, &format!("{printer_id}:job-6")).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    let final_stock = StockRepo::find_by_id(processor.repos(), stock_id).await.unwrap().unwrap();
    assert_eq!(final_stock.remaining_grams, 1970);

    let ledger = LedgerRepo::find_by_stock(processor.repos(), stock_id).await.unwrap();
    assert!(ledger.iter().any(|row| row.kind == LedgerKind::Reservation && row.delta_grams == -100));
    assert!(ledger.iter().any(|row| row.kind == LedgerKind::ReservationRelease && row.delta_grams == 100));
    assert!(ledger.iter().any(|row| row.kind == LedgerKind::Consumption && row.delta_grams == -30));
}
