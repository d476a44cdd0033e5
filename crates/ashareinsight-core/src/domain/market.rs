//! Market-data master data: daily quotes and the derived current-value view.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One trading day's quote for a company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MarketDataDaily {
    pub company_id: uuid::Uuid,
    pub trade_date: NaiveDate,
    pub close_price: f64,
    pub turnover_amount: i64,
    pub market_cap: i64,
    pub circulating_cap: i64,
    pub volume: i64,
}

/// Derived view: latest quote plus a trailing 5-day rolling average,
/// computed in Rust over the 7-day lookback window per spec §4.2 (SQLite
/// has no convenient bespoke window function for the exact "up to 5 most
/// recent sessions within 7 calendar days" rule, so this is computed here
/// rather than in a SQL view).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MarketDataCurrent {
    pub company_id: uuid::Uuid,
    pub as_of: NaiveDate,
    pub close_price: f64,
    pub market_cap: i64,
    pub current_circulating_cap: i64,
    pub today_volume: i64,
    pub avg_5day_volume: f64,
    pub sample_count: usize,
}

/// Builds the rolling-average view from the raw daily rows.
///
/// `rows` must already be restricted to the 7-calendar-day lookback window
/// and sorted descending by `trade_date`. The average is taken over up to
/// five sessions STRICTLY OLDER than the latest available date (spec §4.2);
/// the latest row itself is "today" and never enters its own average. If no
/// prior session falls in the window, `avg_5day_volume` defaults to today's
/// volume.
pub fn compute_market_data_current(
    company_id: uuid::Uuid,
    rows: &[MarketDataDaily],
) -> Option<MarketDataCurrent> {
    let latest = rows.first()?;
    let prior = &rows[1..rows.len().min(6)];
    let (avg_5day_volume, sample_count) = if prior.is_empty() {
        (latest.volume as f64, 0)
    } else {
        (
            prior.iter().map(|r| r.volume as f64).sum::<f64>() / prior.len() as f64,
            prior.len(),
        )
    };

    Some(MarketDataCurrent {
        company_id,
        as_of: latest.trade_date,
        close_price: latest.close_price,
        market_cap: latest.market_cap,
        current_circulating_cap: latest.circulating_cap,
        today_volume: latest.volume,
        avg_5day_volume,
        sample_count,
    })
}

/// A single row of a company's market-data sync job outcome, used by the
/// `sync-market-data` CLI verb to report progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSyncOutcome {
    pub company_id: uuid::Uuid,
    pub rows_upserted: usize,
    pub synced_at: DateTime<Utc>,
}
