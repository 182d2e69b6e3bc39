//! Pre-deduct reservation and terminal settlement (spec §4.6.5/§4.6.6).
//! Grounded in
//! `original_source/backend/app/services/event_processor.py`'s
//! `_maybe_reserve`/`_settle_job` pair, generalized over the repository
//! traits instead of a live ORM session.

use std::collections::BTreeSet;

use chrono::Utc;
use uuid::Uuid;

use crate::db::models::LedgerKind;
use crate::db::repo::{ConsumptionRepo, LedgerRepo, StockRepo};
use crate::db::models::ConsumptionRecord;
use crate::error::Result;
use crate::ledger::apply_stock_delta;
use crate::normalize::{NormalizedData, NormalizedFilament};

use super::snapshot::JobSnapshot;

/// Resolves a filament estimate entry to a tray id (spec §4.6.5): the
/// entry's own `tray_id` wins; failing that, a unique `(material,
/// color_hex)` match against the event's AMS trays; failing that, a
/// single-filament job may fall back to the currently active tray.
fn resolve_filament_tray(data: &NormalizedData, f: &NormalizedFilament) -> Option<i32> {
    if let Some(t) = f.tray_id {
        return Some(t);
    }
    let matches: Vec<_> = data
        .ams_trays
        .iter()
        .filter(|t| t.material.is_some() && t.material == f.material && t.color_hex.is_some() && t.color_hex == f.color_hex)
        .collect();
    if matches.len() == 1 {
        return Some(matches[0].id);
    }
    if data.filament.len() == 1 {
        return data.tray_now;
    }
    None
}

/// Reserves estimated grams against each resolvable tray's stock the
/// first time a filament total arrives for this job. Idempotent per
/// `(job, tray)`.
pub async fn try_reserve<S, L>(stocks: &S, ledger: &L, job_id: Uuid, data: &NormalizedData, snapshot: &mut JobSnapshot) -> Result<()>
where
    S: StockRepo,
    L: LedgerRepo,
{
    if snapshot.reserved_at.is_some() {
        return Ok(());
    }

    let mut saw_total = false;
    for f in &data.filament {
        let Some(total_g) = f.total_g else { continue };
        saw_total = true;

        let Some(tray_id) = resolve_filament_tray(data, f) else { continue };
        let Some(stock_id) = snapshot.tray_to_stock.get(&tray_id.to_string()).copied() else { continue };

        let needle = format!("tray={tray_id}");
        let existing = ledger.find_by_job_and_reason_substr(job_id, &needle).await?;
        if existing.iter().any(|r| r.kind == LedgerKind::Reservation) {
            continue;
        }

        let Some(stock) = stocks.find_by_id(stock_id).await? else { continue };
        let reserve_grams = (total_g.round() as i64).clamp(0, stock.remaining_grams);
        if reserve_grams <= 0 {
            continue;
        }

        apply_stock_delta(
            stocks,
            ledger,
            stock_id,
            -reserve_grams,
            LedgerKind::Reservation,
            Some(format!("reservation job={job_id} tray={tray_id} source=progress_estimate")),
            Some(job_id),
            None,
        )
        .await?;

        snapshot.reserved_by_tray.insert(tray_id.to_string(), reserve_grams);
        snapshot.reserved_stock_by_tray.insert(tray_id.to_string(), stock_id);
    }

    if saw_total && !snapshot.reserved_by_tray.is_empty() {
        snapshot.reserved_source = Some("progress_estimate".to_string());
        snapshot.reserved_confidence = Some("medium".to_string());
        snapshot.reserved_at = Some(Utc::now());
    }

    Ok(())
}

fn final_grams_for_tray(tray_id: i32, data: &NormalizedData, snapshot: &JobSnapshot, ams_calibration_enabled: bool, cancelled: bool) -> Option<(f64, &'static str, &'static str)> {
    for f in &data.filament {
        if resolve_filament_tray(data, f) != Some(tray_id) {
            continue;
        }
        if let Some(g) = f.used_g {
            if g > 0.0 {
                return Some((g, "filament_used_g", "high"));
            }
        }
        if let Some(g) = f.total_g {
            if g > 0.0 {
                return Some((g, "filament_total_g", "medium"));
            }
        }
    }

    // A cancellation with no explicit usage signal means the print was
    // interrupted before producing one; assuming the whole reservation
    // was consumed would defeat the reservation_release already applied
    // below, so this tier is skipped rather than guessed at.
    if !cancelled {
        if let Some(reserved) = snapshot.reserved_by_tray.get(&tray_id.to_string()) {
            if *reserved > 0 {
                return Some((*reserved as f64, "reservation_estimate", "low"));
            }
        }
    }

    // Percent/fraction remain needs the stock's roll weight to convert to
    // grams, which this pure helper has no access to; only the grams-unit
    // case (remain already reported in grams) is handled here.
    if ams_calibration_enabled {
        if let Some(meta) = snapshot.tray_meta_by_tray.get(&tray_id.to_string()) {
            if meta.start_remain_unit.as_deref() == Some("grams") {
                if let Some(start) = meta.start_remain {
                    let current = data.ams_trays.iter().find(|t| t.id == tray_id).and_then(|t| t.remain);
                    if let Some(current) = current {
                        let diff = start - current;
                        if diff > 0.0 {
                            return Some((diff, "remain_diff", "low"));
                        }
                    }
                }
            }
        }
    }

    None
}

/// Releases any open reservation and settles final consumption per
/// tray (spec §4.6.6). On cancellation, `final_grams_for_tray` refuses
/// to guess at the reservation_estimate tier, so an unconfirmed
/// cancelled tray draws no consumption at all and the full release
/// above is its only ledger effect — releasing the reservation and then
/// drawing the confirmed amount nets to the same balance a dedicated
/// refund row would, without double-crediting it. Idempotent: guarded
/// by `snapshot.settled_at`.
pub async fn settle_terminal<S, L, C>(
    stocks: &S,
    ledger: &L,
    consumptions: &C,
    job_id: Uuid,
    data: &NormalizedData,
    snapshot: &mut JobSnapshot,
    cancelled: bool,
    ams_calibration_enabled: bool,
) -> Result<()>
where
    S: StockRepo,
    L: LedgerRepo,
    C: ConsumptionRepo,
{
    if snapshot.settled_at.is_some() {
        return Ok(());
    }

    if snapshot.reservation_release_at.is_none() {
        let reserved: Vec<(String, i64)> = snapshot.reserved_by_tray.iter().map(|(k, v)| (k.clone(), *v)).collect();
        for (tray_str, grams_reserved) in reserved {
            let Some(stock_id) = snapshot.reserved_stock_by_tray.get(&tray_str).copied() else { continue };
            let needle = format!("tray={tray_str}");
            let existing = ledger.find_by_job_and_reason_substr(job_id, &needle).await?;
            if existing.iter().any(|r| r.kind == LedgerKind::ReservationRelease) {
                continue;
            }
            apply_stock_delta(
                stocks,
                ledger,
                stock_id,
                grams_reserved,
                LedgerKind::ReservationRelease,
                Some(format!("reservation_release job={job_id} tray={tray_str}")),
                Some(job_id),
                None,
            )
            .await?;
        }
        snapshot.reservation_release_at = Some(Utc::now());
    }

    let mut tray_ids: BTreeSet<i32> = BTreeSet::new();
    for f in &data.filament {
        if let Some(t) = resolve_filament_tray(data, f) {
            tray_ids.insert(t);
        }
    }
    for k in snapshot.reserved_by_tray.keys() {
        if let Ok(t) = k.parse() {
            tray_ids.insert(t);
        }
    }

    for tray_id in &tray_ids {
        let Some((grams_final, source, confidence)) = final_grams_for_tray(*tray_id, data, snapshot, ams_calibration_enabled, cancelled) else {
            continue;
        };
        if grams_final <= 0.0 {
            continue;
        }

        if consumptions.find_by_job_tray_segment(job_id, *tray_id, 0).await?.is_some() {
            continue;
        }

        let Some(stock_id) = snapshot.tray_to_stock.get(&tray_id.to_string()).copied() else {
            snapshot.pending_consumptions.push(super::snapshot::PendingConsumption {
                tray_id: *tray_id,
                segment_idx: 0,
                unit: "grams".to_string(),
                grams_requested: grams_final,
                source: source.to_string(),
                confidence: confidence.to_string(),
                metadata: serde_json::json!({}),
            });
            if !snapshot.pending_trays.contains(tray_id) {
                snapshot.pending_trays.push(*tray_id);
            }
            continue;
        };

        let Some(stock) = stocks.find_by_id(stock_id).await? else { continue };
        let grams_requested_i = grams_final.round() as i64;
        let grams_effective = grams_requested_i.min(stock.remaining_grams).max(0);

        apply_stock_delta(
            stocks,
            ledger,
            stock_id,
            -grams_effective,
            LedgerKind::Consumption,
            Some(format!("consumption job={job_id} tray={tray_id} segment=0 source={source}")),
            Some(job_id),
            None,
        )
        .await?;

        consumptions
            .insert(ConsumptionRecord {
                id: Uuid::new_v4(),
                job_id: Some(job_id),
                stock_id: Some(stock_id),
                tray_id: Some(*tray_id),
                segment_idx: Some(0),
                grams: grams_effective,
                grams_requested: grams_requested_i,
                grams_effective,
                source: source.to_string(),
                confidence: confidence.to_string(),
                created_at: Utc::now(),
                voided_at: None,
                void_reason: None,
            })
            .await?;
    }

    snapshot.settled_at = Some(Utc::now());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryRepos;
    use crate::db::models::MaterialStock;
    use crate::normalize::NormalizedFilament;

    fn stock(remaining: i64) -> MaterialStock {
        let now = Utc::now();
        MaterialStock {
            id: Uuid::new_v4(),
            material: "PLA".into(),
            color: "#FFFFFF".into(),
            brand: "official".into(),
            roll_weight_grams: 1000,
            remaining_grams: remaining,
            is_archived: false,
            archived_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn progress_with_total(tray_id: Option<i32>, total_g: f64) -> NormalizedData {
        NormalizedData {
            gcode_state: Some("RUNNING".into()),
            progress: Some(10),
            mc_remaining_time: None,
            gcode_file: None,
            gcode_start_time: None,
            task_id: None,
            subtask_id: None,
            subtask_name: None,
            tray_now: Some(0),
            ams_trays: Vec::new(),
            filament: vec![NormalizedFilament {
                tray_id,
                material: Some("PLA".into()),
                color_hex: Some("#FFFFFF".into()),
                used_mm: None,
                total_mm: None,
                used_g: None,
                total_g: Some(total_g),
            }],
        }
    }

    #[tokio::test]
    async fn reserve_then_settle_converts_to_consumption() {
        let repos = MemoryRepos::new();
        let s = stock(2000);
        let id = s.id;
        repos.seed_stock(s);

        let job_id = Uuid::new_v4();
        let mut snap = JobSnapshot::new();
        snap.tray_to_stock.insert("0".to_string(), id);

        let data = progress_with_total(Some(0), 120.0);
        try_reserve(&repos, &repos, job_id, &data, &mut snap).await.unwrap();
        assert_eq!(snap.reserved_by_tray.get("0"), Some(&120));
        let after_reserve = repos.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(after_reserve.remaining_grams, 1880);

        let end_data = progress_with_total(Some(0), 120.0);
        settle_terminal(&repos, &repos, &repos, job_id, &end_data, &mut snap, false, false).await.unwrap();

        let after_settle = repos.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(after_settle.remaining_grams, 1880);
        let consumptions = repos.find_by_job(job_id).await.unwrap();
        assert_eq!(consumptions.len(), 1);
        assert_eq!(consumptions[0].grams, 120);
    }

    #[tokio::test]
    async fn repeated_settle_is_idempotent() {
        let repos = MemoryRepos::new();
        let s = stock(2000);
        let id = s.id;
        repos.seed_stock(s);

        let job_id = Uuid::new_v4();
        let mut snap = JobSnapshot::new();
        snap.tray_to_stock.insert("0".to_string(), id);

        let data = progress_with_total(Some(0), 120.0);
        try_reserve(&repos, &repos, job_id, &data, &mut snap).await.unwrap();
        settle_terminal(&repos, &repos, &repos, job_id, &data, &mut snap, false, false).await.unwrap();
        assert!(snap.settled_at.is_some());

        // A second settle call on an already-settled snapshot is a no-op.
        settle_terminal(&repos, &repos, &repos, job_id, &data, &mut snap, false, false).await.unwrap();
        let after = repos.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(after.remaining_grams, 1880);
        assert_eq!(repos.find_by_job(job_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_refunds_unused_reservation() {
        let repos = MemoryRepos::new();
        let s = stock(2000);
        let id = s.id;
        repos.seed_stock(s);

        let job_id = Uuid::new_v4();
        let mut snap = JobSnapshot::new();
        snap.tray_to_stock.insert("0".to_string(), id);

        let reserve_data = progress_with_total(Some(0), 100.0);
        try_reserve(&repos, &repos, job_id, &reserve_data, &mut snap).await.unwrap();

        // 30% progress -> 30g used at cancel time, data carries used_g.
        let mut cancel_data = progress_with_total(Some(0), 100.0);
        cancel_data.filament[0].used_g = Some(30.0);
        cancel_data.filament[0].total_g = None;

        settle_terminal(&repos, &repos, &repos, job_id, &cancel_data, &mut snap, true, false).await.unwrap();

        let after = repos.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(after.remaining_grams, 1970);
    }

    #[tokio::test]
    async fn cancel_with_no_usage_signal_refunds_the_full_reservation() {
        let repos = MemoryRepos::new();
        let s = stock(2000);
        let id = s.id;
        repos.seed_stock(s);

        let job_id = Uuid::new_v4();
        let mut snap = JobSnapshot::new();
        snap.tray_to_stock.insert("0".to_string(), id);

        let reserve_data = progress_with_total(Some(0), 100.0);
        try_reserve(&repos, &repos, job_id, &reserve_data, &mut snap).await.unwrap();

        // Cancelled before any used_g/total_g reading ever arrived: the
        // reservation_estimate tier must not assume the full reservation
        // was consumed, or the full reservation_release above would be
        // immediately clawed back by a fabricated consumption.
        let mut cancel_data = progress_with_total(Some(0), 100.0);
        cancel_data.filament[0].total_g = None;

        settle_terminal(&repos, &repos, &repos, job_id, &cancel_data, &mut snap, true, false).await.unwrap();

        let after = repos.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(after.remaining_grams, 2000);
        assert!(repos.find_by_job(job_id).await.unwrap().is_empty());
    }
}
