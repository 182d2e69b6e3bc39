//! Purchase pricing derivation/conflict rules (spec §7 "Pricing
//! conflict"). Grounded in
//! `original_source/backend/app/services/pricing_service.py`.

use crate::error::{EngineError, Result};

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Derives whichever of `price_per_roll`/`price_total` is missing, or
/// validates the two are consistent within a cent. Returns
/// `(price_per_roll, price_total)`, both `None` when no price was given.
pub fn derive_purchase_prices(
    rolls_count: Option<i32>,
    price_per_roll: Option<f64>,
    price_total: Option<f64>,
) -> Result<(Option<f64>, Option<f64>)> {
    let any_price = price_per_roll.is_some() || price_total.is_some();
    if any_price && rolls_count.is_none_or(|n| n <= 0) {
        return Err(EngineError::PricingConflict {
            rolls_count,
            price_per_roll,
            price_total,
            expected_total: 0.0,
        });
    }

    let (Some(ppr), Some(pt)) = (price_per_roll, price_total) else {
        return match (price_per_roll, price_total) {
            (Some(ppr), None) => {
                let n = rolls_count.unwrap() as f64;
                Ok((Some(round2(ppr)), Some(round2(ppr * n))))
            }
            (None, Some(pt)) => {
                let n = rolls_count.unwrap() as f64;
                Ok((Some(round2(pt / n)), Some(round2(pt))))
            }
            _ => Ok((None, None)),
        };
    };

    let n = rolls_count.unwrap() as f64;
    let expected_total = round2(ppr * n);
    if (round2(pt) - expected_total).abs() > 0.01 {
        return Err(EngineError::PricingConflict {
            rolls_count,
            price_per_roll: Some(round2(ppr)),
            price_total: Some(round2(pt)),
            expected_total,
        });
    }
    Ok((Some(round2(ppr)), Some(round2(pt))))
}

/// Response-layer helper: only fills `price_total` when derivable,
/// never raises.
pub fn derive_missing_price_total(
    rolls_count: Option<i32>,
    price_per_roll: Option<f64>,
    price_total: Option<f64>,
) -> Option<f64> {
    if let Some(pt) = price_total {
        return Some(pt);
    }
    let ppr = price_per_roll?;
    let n = rolls_count.filter(|n| *n > 0)? as f64;
    Some(round2(ppr * n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_total_from_per_roll() {
        let (ppr, pt) = derive_purchase_prices(Some(3), Some(25.5), None).unwrap();
        assert_eq!(ppr, Some(25.5));
        assert_eq!(pt, Some(76.5));
    }

    #[test]
    fn derives_per_roll_from_total() {
        let (ppr, pt) = derive_purchase_prices(Some(4), None, Some(100.0)).unwrap();
        assert_eq!(ppr, Some(25.0));
        assert_eq!(pt, Some(100.0));
    }

    #[test]
    fn consistent_both_given_ok() {
        let (ppr, pt) = derive_purchase_prices(Some(2), Some(10.0), Some(20.0)).unwrap();
        assert_eq!(ppr, Some(10.0));
        assert_eq!(pt, Some(20.0));
    }

    #[test]
    fn inconsistent_both_given_rejected() {
        let err = derive_purchase_prices(Some(2), Some(10.0), Some(25.0));
        assert!(matches!(err, Err(EngineError::PricingConflict { .. })));
    }

    #[test]
    fn price_without_rolls_count_rejected() {
        let err = derive_purchase_prices(None, Some(10.0), None);
        assert!(err.is_err());
    }
}
