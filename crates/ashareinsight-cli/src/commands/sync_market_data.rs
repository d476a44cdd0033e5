//! `sync-market-data [--init] <path>` (spec §6.4): feeds a market-data
//! provider's daily quote snapshot into the Market-Data Store (C3). The
//! provider itself is out of scope (spec §1); this reads its output from a
//! JSON file keyed by company code, since a snapshot predates any
//! `company_id` assignment.

use std::path::Path;

use ashareinsight_core::{MarketDataDaily, MarketSyncOutcome, Storage};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;

/// Only the trailing 7-day lookback feeds the rolling average (spec §4.2);
/// a wide retention window just bounds how long `market_data_daily` grows.
const MARKET_DATA_RETENTION_DAYS: i64 = 400;

/// One company's quote for one trading day, as the provider reports it.
#[derive(Debug, Clone, Deserialize)]
struct DailyQuote {
    company_code: String,
    trade_date: NaiveDate,
    close_price: f64,
    turnover_amount: i64,
    market_cap: i64,
    circulating_cap: i64,
    volume: i64,
}

#[derive(Debug, Default, Clone)]
pub struct SyncSummary {
    pub companies_synced: usize,
    pub rows_upserted: usize,
    pub unknown_companies: usize,
}

impl SyncSummary {
    pub fn exit_code(&self) -> i32 {
        if self.unknown_companies > 0 {
            1
        } else {
            0
        }
    }
}

/// `init` backfills historical rows without pruning; a regular run also
/// prunes rows older than the store's retention window (spec §4.2).
pub fn run(storage: &Storage, path: &Path, init: bool) -> SyncSummary {
    let mut summary = SyncSummary::default();

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to read snapshot file");
            summary.unknown_companies = 1;
            return summary;
        }
    };
    let quotes: Vec<DailyQuote> = match serde_json::from_str(&raw) {
        Ok(quotes) => quotes,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to parse snapshot file");
            summary.unknown_companies = 1;
            return summary;
        }
    };

    let mut resolved = Vec::with_capacity(quotes.len());
    let mut unknown_codes = std::collections::HashSet::new();
    for quote in quotes {
        match storage.get_company(&quote.company_code) {
            Ok(Some(company)) => resolved.push(MarketDataDaily {
                company_id: company.company_id,
                trade_date: quote.trade_date,
                close_price: quote.close_price,
                turnover_amount: quote.turnover_amount,
                market_cap: quote.market_cap,
                circulating_cap: quote.circulating_cap,
                volume: quote.volume,
            }),
            Ok(None) => {
                unknown_codes.insert(quote.company_code.clone());
            }
            Err(e) => {
                tracing::error!(code = %quote.company_code, error = %e, "failed to resolve company");
                unknown_codes.insert(quote.company_code.clone());
            }
        }
    }
    for code in &unknown_codes {
        tracing::warn!(code, "skipping quote for unknown company");
    }
    summary.unknown_companies = unknown_codes.len();

    let company_ids: std::collections::HashSet<_> = resolved.iter().map(|r| r.company_id).collect();
    summary.companies_synced = company_ids.len();

    match storage.save_daily_snapshot(&resolved) {
        Ok(n) => summary.rows_upserted = n,
        Err(e) => {
            tracing::error!(error = %e, "failed to save market-data snapshot");
            summary.unknown_companies += 1;
            return summary;
        }
    }

    if !init {
        match storage.prune_market_data(MARKET_DATA_RETENTION_DAYS) {
            Ok(pruned) => tracing::info!(pruned, "pruned stale market-data rows"),
            Err(e) => tracing::warn!(error = %e, "failed to prune market-data rows"),
        }
    }

    let outcomes: Vec<MarketSyncOutcome> = company_ids
        .into_iter()
        .map(|company_id| MarketSyncOutcome {
            company_id,
            rows_upserted: resolved.iter().filter(|r| r.company_id == company_id).count(),
            synced_at: Utc::now(),
        })
        .collect();
    tracing::info!(
        companies = summary.companies_synced,
        rows = summary.rows_upserted,
        unknown = summary.unknown_companies,
        "market-data sync complete"
    );
    for outcome in &outcomes {
        tracing::debug!(company_id = %outcome.company_id, rows = outcome.rows_upserted, "synced");
    }

    summary
}
