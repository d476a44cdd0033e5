//! Market Filter Service (C10): the optional post-aggregation stage that
//! excludes companies by market-cap/volume thresholds and re-ranks the
//! survivors by a relevance-weighted tiered score `L = X * (S + V)`
//! (spec §4.9). Degrades gracefully: if no market-data row exists for a
//! company once a threshold is active, the company is conservatively
//! excluded rather than silently kept; if no filter was requested at all,
//! this stage is a no-op and the pre-filter ordering is preserved.

use std::collections::HashMap;

use uuid::Uuid;

use crate::config::{MarketFilterConfig, ScoreTier};
use crate::domain::{AggregatedCompany, MarketDataCurrent};

/// Caller-supplied overrides for one retrieval request; `None` fields fall
/// back to [`MarketFilterConfig`]'s defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestedMarketFilters {
    pub max_market_cap_cny: Option<f64>,
    pub max_avg_volume_5d: Option<f64>,
}

impl RequestedMarketFilters {
    pub fn is_empty(&self) -> bool {
        self.max_market_cap_cny.is_none() && self.max_avg_volume_5d.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct MarketFilterOutcome {
    pub companies: Vec<AggregatedCompany>,
    /// `true` when a filter was actually evaluated — `false` means no
    /// threshold was requested, so `companies` is the unmodified input.
    pub applied: bool,
    pub excluded_over_threshold: usize,
    /// Companies dropped for lacking a market-data row while a threshold
    /// was active (the conservative-exclusion rule).
    pub excluded_missing_data: usize,
}

fn tier_score(tiers: &[ScoreTier], value: f64) -> u32 {
    tiers.iter().find(|t| t.contains(value)).map(|t| t.score).unwrap_or(0)
}

/// Applies the market filter to an already-aggregated, already-sorted list
/// of companies. If `requested` names no threshold, or no market data was
/// supplied at all, the input passes through unchanged (graceful
/// degradation per spec §4.9 — a market-data outage never fails retrieval).
pub fn apply_market_filter(
    companies: Vec<AggregatedCompany>,
    market_data: &HashMap<Uuid, MarketDataCurrent>,
    requested: &RequestedMarketFilters,
    config: &MarketFilterConfig,
    relevance_mapping_enabled: bool,
) -> MarketFilterOutcome {
    if requested.is_empty() {
        return MarketFilterOutcome {
            companies,
            applied: false,
            excluded_over_threshold: 0,
            excluded_missing_data: 0,
        };
    }
    if market_data.is_empty() {
        tracing::warn!("market filter requested but no market data is available, skipping filter");
        return MarketFilterOutcome {
            companies,
            applied: false,
            excluded_over_threshold: 0,
            excluded_missing_data: 0,
        };
    }

    let max_cap = requested.max_market_cap_cny.or(config.max_market_cap);
    let max_vol = requested.max_avg_volume_5d.or(config.max_avg_volume_5d);

    let mut excluded_over = 0usize;
    let mut excluded_missing = 0usize;
    let mut scored: Vec<(AggregatedCompany, f32)> = Vec::with_capacity(companies.len());

    for company in companies {
        let Some(data) = market_data.get(&company.company_id) else {
            excluded_missing += 1;
            continue;
        };

        if let Some(cap_limit) = max_cap {
            if data.market_cap as f64 > cap_limit {
                excluded_over += 1;
                continue;
            }
        }
        if let Some(vol_limit) = max_vol {
            if data.avg_5day_volume > vol_limit {
                excluded_over += 1;
                continue;
            }
        }

        let s = tier_score(&config.market_cap_tiers, data.market_cap as f64);
        let v = tier_score(&config.volume_tiers, data.avg_5day_volume);
        let x = if relevance_mapping_enabled {
            config
                .relevance_tiers
                .as_ref()
                .map(|tiers| tier_score(tiers, company.company_score as f64) as f32)
                .unwrap_or(company.company_score)
        } else {
            company.company_score
        };
        let l_score = x * (s + v) as f32;
        scored.push((company, l_score));
    }

    scored.sort_by(|(a, la), (b, lb)| lb.total_cmp(la).then_with(|| a.code.cmp(&b.code)));

    MarketFilterOutcome {
        companies: scored.into_iter().map(|(c, _)| c).collect(),
        applied: true,
        excluded_over_threshold: excluded_over,
        excluded_missing_data: excluded_missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn company(code: &str, score: f32) -> AggregatedCompany {
        AggregatedCompany {
            company_id: Uuid::new_v4(),
            code: code.into(),
            name: format!("{code} Inc"),
            company_score: score,
            matched_concepts: vec![],
        }
    }

    fn market(company_id: Uuid, market_cap: i64, avg_5day_volume: f64) -> MarketDataCurrent {
        MarketDataCurrent {
            company_id,
            as_of: NaiveDate::from_ymd_opt(2026, 7, 28).unwrap(),
            close_price: 10.0,
            market_cap,
            current_circulating_cap: market_cap / 2,
            today_volume: avg_5day_volume as i64,
            avg_5day_volume,
            sample_count: 5,
        }
    }

    #[test]
    fn no_requested_filter_is_a_no_op() {
        let companies = vec![company("600519", 0.9)];
        let outcome = apply_market_filter(
            companies.clone(),
            &HashMap::new(),
            &RequestedMarketFilters::default(),
            &MarketFilterConfig::default(),
            false,
        );
        assert!(!outcome.applied);
        assert_eq!(outcome.companies, companies);
    }

    #[test]
    fn excludes_companies_over_market_cap_threshold() {
        let big = company("600519", 0.9);
        let small = company("300257", 0.7);
        let mut data = HashMap::new();
        data.insert(big.company_id, market(big.company_id, 200_000_000_000, 1e8));
        data.insert(small.company_id, market(small.company_id, 3_000_000_000, 1e8));

        let requested = RequestedMarketFilters {
            max_market_cap_cny: Some(85e8),
            max_avg_volume_5d: None,
        };
        let outcome = apply_market_filter(
            vec![big.clone(), small.clone()],
            &data,
            &requested,
            &MarketFilterConfig::default(),
            false,
        );
        assert!(outcome.applied);
        assert_eq!(outcome.excluded_over_threshold, 1);
        assert_eq!(outcome.companies.len(), 1);
        assert_eq!(outcome.companies[0].code, "300257");
    }

    #[test]
    fn companies_without_market_data_are_conservatively_excluded() {
        let known = company("600519", 0.9);
        let unknown = company("300257", 0.95);
        let mut data = HashMap::new();
        data.insert(known.company_id, market(known.company_id, 3_000_000_000, 1e8));

        let requested = RequestedMarketFilters {
            max_market_cap_cny: Some(85e8),
            max_avg_volume_5d: None,
        };
        let outcome = apply_market_filter(
            vec![known.clone(), unknown],
            &data,
            &requested,
            &MarketFilterConfig::default(),
            false,
        );
        assert_eq!(outcome.excluded_missing_data, 1);
        assert_eq!(outcome.companies.len(), 1);
        assert_eq!(outcome.companies[0].code, "600519");
    }

    #[test]
    fn surviving_companies_are_reordered_by_tiered_score() {
        let a = company("300257", 0.5); // lower relevance, smaller cap -> higher tier score
        let b = company("600519", 0.9); // higher relevance, larger cap -> lower tier score
        let mut data = HashMap::new();
        data.insert(a.company_id, market(a.company_id, 2_000_000_000, 0.3e8));
        data.insert(b.company_id, market(b.company_id, 5_000_000_000, 0.3e8));

        let requested = RequestedMarketFilters {
            max_market_cap_cny: Some(85e8),
            max_avg_volume_5d: None,
        };
        let outcome = apply_market_filter(
            vec![b.clone(), a.clone()],
            &data,
            &requested,
            &MarketFilterConfig::default(),
            false,
        );
        // a: tiers S=3 (cap < 40e8) + V=3 (vol < 0.5e8) = 6, L = 0.5*6 = 3.0
        // b: tiers S=2 (40e8<=cap<60e8) + V=3 = 5, L = 0.9*5 = 4.5
        assert_eq!(outcome.companies[0].code, "600519");
    }

    #[test]
    fn missing_market_data_entirely_skips_filtering() {
        let companies = vec![company("600519", 0.9)];
        let requested = RequestedMarketFilters {
            max_market_cap_cny: Some(85e8),
            max_avg_volume_5d: None,
        };
        let outcome = apply_market_filter(
            companies.clone(),
            &HashMap::new(),
            &requested,
            &MarketFilterConfig::default(),
            false,
        );
        assert!(!outcome.applied);
        assert_eq!(outcome.companies, companies);
    }
}
