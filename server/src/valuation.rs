//! Read-only weighted-average stock valuation (spec §4.7). Grounded in
//! `original_source/backend/app/services/valuation_service.py`, which
//! replays a stock's ledger chronologically rather than keeping a
//! running average column, so a void/reversal naturally corrects later
//! valuations without a backfill pass.

use uuid::Uuid;

use crate::db::models::LedgerKind;
use crate::db::repo::LedgerRepo;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StockValuation {
    /// Weighted-average price per gram across all non-voided purchases,
    /// `None` when no purchase has ever been recorded for this stock.
    pub avg_price_per_gram: Option<f64>,
    /// `avg_price_per_gram * remaining_grams`, `None` under the same
    /// condition as `avg_price_per_gram`.
    pub remaining_value: Option<f64>,
    pub purchased_grams: i64,
    pub purchased_cost: f64,
}

/// Replays `stock_id`'s ledger in creation order. Purchases accumulate
/// `(grams, cost)` into a running weighted average; consumptions and
/// reservations draw against that average without changing it. A
/// purchase that lands at the exact same instant as a consumption is
/// ties broken purchase-first by stable sort on `created_at` (ledger
/// rows are fetched already ordered by `created_at` per
/// [`LedgerRepo::find_by_stock`]).
pub async fn value_stock<L: LedgerRepo>(ledger: &L, stock_id: Uuid) -> Result<StockValuation> {
    let rows = ledger.find_by_stock(stock_id).await?;

    let mut purchased_grams: i64 = 0;
    let mut purchased_cost: f64 = 0.0;
    let mut remaining_grams: i64 = 0;

    for row in &rows {
        if row.voided_at.is_some() {
            continue;
        }
        match row.kind {
            LedgerKind::Purchase => {
                let grams = row.delta_grams.max(0);
                let cost = row.price_total.unwrap_or(0.0);
                purchased_grams += grams;
                purchased_cost += cost;
                remaining_grams += row.delta_grams;
            }
            _ => {
                remaining_grams = (remaining_grams + row.delta_grams).max(0);
            }
        }
    }

    let avg_price_per_gram = if purchased_grams > 0 {
        Some(purchased_cost / purchased_grams as f64)
    } else {
        None
    };

    let remaining_value = avg_price_per_gram.map(|avg| avg * remaining_grams as f64);

    Ok(StockValuation {
        avg_price_per_gram,
        remaining_value,
        purchased_grams,
        purchased_cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryRepos;
    use crate::db::models::MaterialLedger;
    use chrono::{Duration, Utc};

    fn row(
        stock_id: Uuid,
        kind: LedgerKind,
        delta: i64,
        price_total: Option<f64>,
        created_at: chrono::DateTime<Utc>,
    ) -> MaterialLedger {
        MaterialLedger {
            id: Uuid::new_v4(),
            stock_id: Some(stock_id),
            job_id: None,
            delta_grams: delta,
            kind,
            rolls_count: None,
            price_per_roll: None,
            price_total,
            reason: None,
            created_at,
            voided_at: None,
            void_reason: None,
            reversal_of_id: None,
        }
    }

    #[tokio::test]
    async fn averages_across_two_purchases_at_different_prices() {
        let repos = MemoryRepos::new();
        let stock_id = Uuid::new_v4();
        let t0 = Utc::now();

        repos.insert(row(stock_id, LedgerKind::Purchase, 1000, Some(100.0), t0)).await.unwrap();
        repos
            .insert(row(stock_id, LedgerKind::Purchase, 1000, Some(140.0), t0 + Duration::seconds(1)))
            .await
            .unwrap();
        repos
            .insert(row(stock_id, LedgerKind::Consumption, -500, None, t0 + Duration::seconds(2)))
            .await
            .unwrap();

        let v = value_stock(&repos, stock_id).await.unwrap();
        assert_eq!(v.purchased_grams, 2000);
        assert!((v.avg_price_per_gram.unwrap() - 0.12).abs() < 1e-9);
        assert!((v.remaining_value.unwrap() - 1500.0 * 0.12).abs() < 1e-6);
    }

    #[tokio::test]
    async fn voided_purchase_is_excluded() {
        let repos = MemoryRepos::new();
        let stock_id = Uuid::new_v4();
        let t0 = Utc::now();

        let mut voided = row(stock_id, LedgerKind::Purchase, 1000, Some(500.0), t0);
        voided.voided_at = Some(t0 + Duration::seconds(1));
        repos.insert(voided).await.unwrap();
        repos
            .insert(row(stock_id, LedgerKind::Purchase, 1000, Some(100.0), t0 + Duration::seconds(2)))
            .await
            .unwrap();

        let v = value_stock(&repos, stock_id).await.unwrap();
        assert_eq!(v.purchased_grams, 1000);
        assert!((v.avg_price_per_gram.unwrap() - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn no_purchases_yields_no_valuation() {
        let repos = MemoryRepos::new();
        let stock_id = Uuid::new_v4();
        repos
            .insert(row(stock_id, LedgerKind::Adjustment, 200, None, Utc::now()))
            .await
            .unwrap();

        let v = value_stock(&repos, stock_id).await.unwrap();
        assert!(v.avg_price_per_gram.is_none());
        assert!(v.remaining_value.is_none());
    }
}
