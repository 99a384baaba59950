// src/portfolio.rs
//
// Pure aggregation over a user's assets: valuation, composition buckets,
// weighted-average cost basis, the daily history snapshot policy, and the
// trailing performance windows. Nothing here touches the store or the
// network, which is what keeps the invariants testable.
use crate::models::{Asset, Composition, HistoryPoint, Performance, Portfolio, Transaction, TransactionKind};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;

pub const HISTORY_CAP: usize = 365;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub asset_id: String,
    pub symbol: String,
    pub name: String,
    #[serde(rename = "type")]
    pub asset_type: crate::models::AssetType,
    pub quantity: f64,
    pub price: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Valuation {
    pub total_value: f64,
    pub composition: Composition,
    pub cost_basis: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub positions: Vec<Position>,
}

/// Resolution order: live quote, then the asset's newest transaction price,
/// then its reference purchase price.
pub fn resolve_price(asset: &Asset, quote: Option<f64>) -> f64 {
    quote.unwrap_or_else(|| asset.fallback_price())
}

pub fn value_assets(assets: &[Asset], quotes: &HashMap<String, f64>) -> Valuation {
    let mut total_value = 0.0;
    let mut composition = Composition::default();
    let mut total_cost = 0.0;
    let mut positions = Vec::with_capacity(assets.len());

    for asset in assets {
        let price = resolve_price(asset, quotes.get(&asset.symbol).copied());
        let value = asset.quantity * price;
        total_value += value;
        *composition.bucket_mut(asset.asset_type) += value;
        total_cost += cost_basis(&asset.transactions);
        positions.push(Position {
            asset_id: asset.id.clone(),
            symbol: asset.symbol.clone(),
            name: asset.name.clone(),
            asset_type: asset.asset_type,
            quantity: asset.quantity,
            price,
            value,
        });
    }

    let unrealized_pnl = total_value - total_cost;
    let unrealized_pnl_pct = if total_cost > 0.0 {
        unrealized_pnl / total_cost * 100.0
    } else {
        0.0
    };

    Valuation {
        total_value,
        composition,
        cost_basis: total_cost,
        unrealized_pnl,
        unrealized_pnl_pct,
        positions,
    }
}

/// Weighted-average cost of the currently held quantity. Buys add cost,
/// outflows remove a proportional share of it, transfers-in and staking
/// rewards add quantity at zero cost. Input is newest-first, replay is
/// chronological.
pub fn cost_basis(transactions_newest_first: &[Transaction]) -> f64 {
    let mut quantity = 0.0_f64;
    let mut cost = 0.0_f64;

    for tx in transactions_newest_first.iter().rev() {
        match tx.kind {
            TransactionKind::Buy => {
                cost += tx.quantity * tx.price;
                quantity += tx.quantity;
            }
            TransactionKind::Sell | TransactionKind::TransferOut => {
                if quantity > 0.0 {
                    let share = (tx.quantity / quantity).min(1.0);
                    cost -= cost * share;
                }
                quantity = (quantity - tx.quantity).max(0.0);
            }
            TransactionKind::TransferIn | TransactionKind::StakingReward => {
                quantity += tx.quantity;
            }
        }
    }

    cost.max(0.0)
}

/// At most one snapshot per calendar day: a same-day recomputation rewrites
/// the latest entry, otherwise a new entry is appended at the tail. The log
/// stays chronological (oldest first) and capped, dropping from the front.
pub fn record_snapshot(
    portfolio: &mut Portfolio,
    now: DateTime<Utc>,
    total_value: f64,
    composition: Composition,
) {
    let today = now.date_naive();
    match portfolio.history.last_mut() {
        Some(last) if last.date.date_naive() == today => {
            last.date = now;
            last.total_value = total_value;
            last.composition = composition;
        }
        _ => {
            portfolio.history.push(HistoryPoint {
                date: now,
                total_value,
                composition,
            });
        }
    }

    if portfolio.history.len() > HISTORY_CAP {
        let excess = portfolio.history.len() - HISTORY_CAP;
        portfolio.history.drain(..excess);
    }
    portfolio.updated_at = now;
}

fn closest_value(history: &[HistoryPoint], target: DateTime<Utc>) -> f64 {
    history
        .iter()
        .min_by_key(|point| (point.date - target).num_seconds().abs())
        .map(|point| point.total_value)
        .unwrap_or(0.0)
}

fn percent_change(current: f64, reference: f64) -> f64 {
    if reference > 0.0 {
        (current - reference) / reference * 100.0
    } else {
        0.0
    }
}

/// Trailing deltas over 1/7/30/365 days plus all-time. History is captured at
/// most once a day and only when the app is used, so window lookups take the
/// nearest snapshot rather than requiring an exact match.
pub fn trailing_performance(history: &[HistoryPoint], now: DateTime<Utc>) -> Performance {
    if history.len() < 2 {
        return Performance::default();
    }

    let current = match history.last() {
        Some(point) => point.total_value,
        None => return Performance::default(),
    };

    let window = |days: i64| closest_value(history, now - Duration::days(days));
    let initial = history[0].total_value;

    Performance {
        daily_change: percent_change(current, window(1)),
        weekly_change: percent_change(current, window(7)),
        monthly_change: percent_change(current, window(30)),
        yearly_change: percent_change(current, window(365)),
        total_change: percent_change(current, initial),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetType;
    use chrono::TimeZone;

    fn tx(kind: TransactionKind, quantity: f64, price: f64) -> Transaction {
        Transaction::new(kind, quantity, price, Utc::now(), None)
    }

    fn point(days_ago: i64, total_value: f64) -> HistoryPoint {
        HistoryPoint {
            date: Utc::now() - Duration::days(days_ago),
            total_value,
            composition: Composition::default(),
        }
    }

    fn asset_with(symbol: &str, asset_type: AssetType, quantity: f64, txs: Vec<Transaction>) -> Asset {
        let mut asset = Asset::new("u1", symbol, symbol, asset_type, 50.0, Utc::now());
        asset.quantity = quantity;
        asset.transactions = txs;
        asset
    }

    #[test]
    fn cost_basis_weighted_average_example() {
        // Buy 1.0 BTC at 30k, sell 0.4 at 40k: basis falls to 0.6 * 30k.
        let txs = vec![
            tx(TransactionKind::Sell, 0.4, 40_000.0),
            tx(TransactionKind::Buy, 1.0, 30_000.0),
        ];
        let basis = cost_basis(&txs);
        assert!((basis - 18_000.0).abs() < 1e-9);
    }

    #[test]
    fn cost_basis_ignores_zero_cost_inflows() {
        let txs = vec![
            tx(TransactionKind::StakingReward, 0.5, 100.0),
            tx(TransactionKind::TransferIn, 1.0, 100.0),
            tx(TransactionKind::Buy, 2.0, 10.0),
        ];
        assert!((cost_basis(&txs) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn cost_basis_transfer_out_reduces_proportionally() {
        let txs = vec![
            tx(TransactionKind::TransferOut, 1.0, 0.0),
            tx(TransactionKind::Buy, 2.0, 10.0),
        ];
        assert!((cost_basis(&txs) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn cost_basis_never_negative() {
        let txs = vec![
            tx(TransactionKind::Sell, 5.0, 1.0),
            tx(TransactionKind::Buy, 2.0, 10.0),
        ];
        assert_eq!(cost_basis(&txs), 0.0);
        assert_eq!(cost_basis(&[]), 0.0);
    }

    #[test]
    fn total_value_sums_resolved_prices() {
        let assets = vec![
            asset_with("AAPL", AssetType::Stock, 2.0, vec![tx(TransactionKind::Buy, 2.0, 100.0)]),
            asset_with("BTC", AssetType::Crypto, 0.5, vec![tx(TransactionKind::Buy, 0.5, 30_000.0)]),
        ];
        let mut quotes = HashMap::new();
        quotes.insert("AAPL".to_string(), 110.0);
        // No quote for BTC: falls back to its latest transaction price.
        let valuation = value_assets(&assets, &quotes);
        assert!((valuation.total_value - (2.0 * 110.0 + 0.5 * 30_000.0)).abs() < 1e-9);
        assert!((valuation.composition.stocks - 220.0).abs() < 1e-9);
        assert!((valuation.composition.crypto - 15_000.0).abs() < 1e-9);
        assert_eq!(valuation.positions.len(), 2);
    }

    #[test]
    fn valuation_falls_back_to_purchase_price() {
        // No transactions and no quote: purchase price carries the valuation.
        let mut asset = Asset::new("u1", "VT", "Vanguard Total", AssetType::Etf, 80.0, Utc::now());
        asset.quantity = 3.0;
        let valuation = value_assets(&[asset], &HashMap::new());
        assert!((valuation.total_value - 240.0).abs() < 1e-9);
        assert!((valuation.composition.etfs - 240.0).abs() < 1e-9);
    }

    #[test]
    fn pnl_pct_is_zero_on_zero_cost_basis() {
        let assets = vec![asset_with("BTC", AssetType::Crypto, 1.0, vec![
            tx(TransactionKind::TransferIn, 1.0, 100.0),
        ])];
        let valuation = value_assets(&assets, &HashMap::new());
        assert_eq!(valuation.cost_basis, 0.0);
        assert_eq!(valuation.unrealized_pnl_pct, 0.0);
        assert!(valuation.unrealized_pnl > 0.0);
    }

    #[test]
    fn snapshot_same_day_updates_in_place() {
        let mut portfolio = Portfolio::new("u1");
        let morning = Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2026, 3, 5, 21, 0, 0).unwrap();
        record_snapshot(&mut portfolio, morning, 100.0, Composition::default());
        record_snapshot(&mut portfolio, evening, 150.0, Composition::default());
        assert_eq!(portfolio.history.len(), 1);
        assert_eq!(portfolio.history[0].total_value, 150.0);
        assert_eq!(portfolio.history[0].date, evening);
    }

    #[test]
    fn snapshot_new_day_appends_at_tail() {
        let mut portfolio = Portfolio::new("u1");
        let day1 = Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 3, 6, 12, 0, 0).unwrap();
        record_snapshot(&mut portfolio, day1, 100.0, Composition::default());
        record_snapshot(&mut portfolio, day2, 110.0, Composition::default());
        assert_eq!(portfolio.history.len(), 2);
        assert_eq!(portfolio.history[0].total_value, 100.0);
        assert_eq!(portfolio.history[1].total_value, 110.0);
    }

    #[test]
    fn history_cap_drops_oldest() {
        let mut portfolio = Portfolio::new("u1");
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        for day in 0..400 {
            let when = start + Duration::days(day);
            record_snapshot(&mut portfolio, when, day as f64, Composition::default());
        }
        assert_eq!(portfolio.history.len(), HISTORY_CAP);
        // Entries 0..=34 were evicted.
        assert_eq!(portfolio.history[0].total_value, 35.0);
        assert_eq!(portfolio.history.last().unwrap().total_value, 399.0);
    }

    #[test]
    fn performance_requires_two_snapshots() {
        let now = Utc::now();
        let perf = trailing_performance(&[], now);
        assert_eq!(perf.daily_change, 0.0);
        let perf = trailing_performance(&[point(0, 100.0)], now);
        assert_eq!(perf.total_change, 0.0);
    }

    #[test]
    fn performance_zero_reference_yields_zero() {
        let history = vec![point(7, 0.0), point(0, 100.0)];
        let perf = trailing_performance(&history, Utc::now());
        assert_eq!(perf.weekly_change, 0.0);
        assert_eq!(perf.total_change, 0.0);
    }

    #[test]
    fn performance_uses_nearest_snapshot() {
        // Nothing exactly 7 days back; the 6-day point is nearest.
        let history = vec![point(20, 50.0), point(6, 80.0), point(0, 100.0)];
        let perf = trailing_performance(&history, Utc::now());
        assert!((perf.weekly_change - 25.0).abs() < 1e-6);
        assert!((perf.total_change - 100.0).abs() < 1e-6);
        // The monthly window lands nearest the 20-day point.
        assert!((perf.monthly_change - 100.0).abs() < 1e-6);
    }
}
