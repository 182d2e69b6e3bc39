//! Tray → stock resolution (spec §4.6.4) and pending-attribution resolve
//! (spec §4.6.7). Grounded in
//! `original_source/backend/app/services/tray_service.py`'s official vs
//! third-party bay matching and
//! `original_source/backend/app/services/event_processor.py`'s resolve
//! endpoint handler.

use uuid::Uuid;

use crate::db::models::ConsumptionRecord;
use crate::db::repo::{AmsColorMappingRepo, ConsumptionRepo, LedgerRepo, StockRepo};
use crate::error::Result;
use crate::ledger::apply_stock_delta;
use crate::normalize::NormalizedTray;

use super::snapshot::{JobSnapshot, PendingConsumption, TrayMeta};

pub const OFFICIAL_BRAND: &str = "official";

/// Builds tray metadata and attempts to resolve a concrete stock. Returns
/// `None` for the stock when the tray is ambiguous or missing identity —
/// the caller is responsible for recording it in `pending_trays`.
pub async fn resolve_tray<S, M>(stocks: &S, mappings: &M, tray: &NormalizedTray) -> Result<(TrayMeta, Option<Uuid>)>
where
    S: StockRepo,
    M: AmsColorMappingRepo,
{
    let is_official = tray.is_official();
    let mut meta = TrayMeta {
        material: tray.material.clone(),
        color: tray.color_hex.clone(),
        color_hex: tray.color_hex.clone(),
        color_hex_raw: tray.color_hex_raw.clone(),
        is_official,
        start_remain: tray.remain,
        start_remain_unit: tray.remain_unit.map(|u| format!("{u:?}").to_lowercase()),
    };

    let (Some(material), Some(color_hex)) = (tray.material.as_deref(), tray.color_hex.as_deref()) else {
        return Ok((meta, None));
    };

    if let Some(mapping) = mappings.find_by_hex(color_hex).await? {
        meta.color = Some(mapping.color_name);
    }

    let candidates = if is_official {
        stocks.find_active_by_key(material, color_hex, OFFICIAL_BRAND).await?
    } else {
        stocks.find_active_by_material_color_excluding_brand(material, color_hex, OFFICIAL_BRAND).await?
    };

    match candidates.as_slice() {
        [single] => Ok((meta, Some(single.id))),
        _ => Ok((meta, None)),
    }
}

/// Applies an operator-submitted `{tray -> stock}` attribution to every
/// still-pending item for that tray, idempotently (spec §4.6.7).
pub async fn resolve_pending<S, L, C>(
    stocks: &S,
    ledger: &L,
    consumptions: &C,
    job_id: Uuid,
    snapshot: &mut JobSnapshot,
    tray_id: i32,
    stock_id: Uuid,
) -> Result<()>
where
    S: StockRepo,
    L: LedgerRepo,
    C: ConsumptionRepo,
{
    let (matching, rest): (Vec<PendingConsumption>, Vec<PendingConsumption>) =
        snapshot.pending_consumptions.drain(..).partition(|p| p.tray_id == tray_id);
    snapshot.pending_consumptions = rest;

    let Some(stock) = stocks.find_by_id(stock_id).await? else {
        // Stock vanished since the pending item was recorded; put it back
        // rather than silently dropping operator-visible state.
        snapshot.pending_consumptions.extend(matching);
        return Ok(());
    };

    for item in matching {
        if consumptions.find_by_job_tray_segment(job_id, item.tray_id, item.segment_idx).await?.is_some() {
            continue;
        }

        let grams_requested = match item.unit.as_str() {
            "percent" => (item.grams_requested / 100.0) * stock.roll_weight_grams as f64,
            "fraction" => item.grams_requested * stock.roll_weight_grams as f64,
            _ => item.grams_requested,
        };
        let grams_requested_i = grams_requested.round() as i64;
        let stock_now = stocks.find_by_id(stock_id).await?.unwrap_or(stock.clone());
        let grams_effective = grams_requested_i.min(stock_now.remaining_grams).max(0);

        let applied = apply_stock_delta(
            stocks,
            ledger,
            stock_id,
            -grams_effective,
            crate::db::models::LedgerKind::Consumption,
            Some(format!("consumption job={job_id} tray={tray_id} segment={} (resolved)", item.segment_idx)),
            Some(job_id),
            None,
        )
        .await?;
        let effective = applied.ledger_row.delta_grams.unsigned_abs() as i64;

        consumptions
            .insert(ConsumptionRecord {
                id: Uuid::new_v4(),
                job_id: Some(job_id),
                stock_id: Some(stock_id),
                tray_id: Some(item.tray_id),
                segment_idx: Some(item.segment_idx),
                grams: effective,
                grams_requested: grams_requested_i,
                grams_effective: effective,
                source: item.source,
                confidence: item.confidence,
                created_at: chrono::Utc::now(),
                voided_at: None,
                void_reason: None,
            })
            .await?;
    }

    snapshot.tray_to_stock.insert(tray_id.to_string(), stock_id);
    snapshot.pending_trays.retain(|t| *t != tray_id);
    Ok(())
}
