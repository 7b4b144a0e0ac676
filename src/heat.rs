//! Per-cell heat statistics
//!
//! The heat engine folds every ingested event into the rolling stats of
//! its cell, and derives a read-only `HeatIndex` snapshot on demand.
//! Stats are windowed (default 24 h); expired entries are pruned lazily
//! on the next write or read for that cell, never by a background sweep.
//!
//! Each cell's stats live in one `DashMap` entry, so writes to a single
//! cell are serialized by the entry lock while different cells update in
//! parallel. An unknown cell reads as a zero-valued index, not an error.

use std::collections::VecDeque;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::events::{FeedEvent, FeedEventType};
use crate::geo::Cell;

/// Score weights for the heat formula.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeatWeights {
    /// Per save-per-hour.
    pub save: f64,
    /// Per message-per-hour (trade requests and completions).
    pub message: f64,
    /// Per listing-per-hour.
    pub listing: f64,
    /// Per active listing currently in the window.
    pub volume: f64,
}

impl Default for HeatWeights {
    fn default() -> Self {
        Self {
            save: 25.0,
            message: 30.0,
            listing: 15.0,
            volume: 0.5,
        }
    }
}

/// Score cut points for the heat levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeatThresholds {
    pub warm: f64,
    pub hot: f64,
    pub fire: f64,
}

impl Default for HeatThresholds {
    fn default() -> Self {
        Self {
            warm: 30.0,
            hot: 60.0,
            fire: 80.0,
        }
    }
}

/// Heat engine tuning.
#[derive(Debug, Clone)]
pub struct HeatConfig {
    /// Rolling window, in hours.
    pub window_hours: i64,
    pub weights: HeatWeights,
    pub thresholds: HeatThresholds,
    /// Leaderboard size for trending brands and SKUs.
    pub trending_top_k: usize,
}

impl Default for HeatConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            weights: HeatWeights::default(),
            thresholds: HeatThresholds::default(),
            trending_top_k: 5,
        }
    }
}

/// Categorized heat of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeatLevel {
    Cold,
    Warm,
    Hot,
    Fire,
}

impl HeatLevel {
    fn for_score(score: f64, thresholds: &HeatThresholds) -> Self {
        if score >= thresholds.fire {
            HeatLevel::Fire
        } else if score >= thresholds.hot {
            HeatLevel::Hot
        } else if score >= thresholds.warm {
            HeatLevel::Warm
        } else {
            HeatLevel::Cold
        }
    }
}

/// Windowed event rates, per hour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Velocities {
    pub saves_per_hour: f64,
    pub messages_per_hour: f64,
    pub listings_per_hour: f64,
    pub sales_per_hour: f64,
}

/// Windowed volume counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Listings created minus sold within the window, floored at zero.
    pub active_listings: u64,
    pub total_events: u64,
}

/// Direction of the windowed listing-price average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceTrend {
    Rising,
    Falling,
    Stable,
}

/// Listing-price summary for a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSummary {
    /// Average listing price within the window, if any prices were seen.
    pub average: Option<Decimal>,
    pub trend: PriceTrend,
    /// Percent change of the newer half of the window vs the older half.
    pub change_percent: f64,
}

/// One trending-leaderboard row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendingEntry {
    pub name: String,
    /// Recency-decayed score.
    pub score: f64,
    /// Raw windowed event count.
    pub count: u64,
}

/// Read-only heat snapshot of a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatIndex {
    pub cell: Cell,
    pub heat_score: f64,
    pub heat_level: HeatLevel,
    pub velocities: Velocities,
    pub volume: Volume,
    pub trending_brands: Vec<TrendingEntry>,
    pub trending_skus: Vec<TrendingEntry>,
    pub price: PriceSummary,
    pub window_hours: i64,
}

impl HeatIndex {
    /// Zero-valued index for a cell with no recorded activity.
    fn empty(cell: Cell, window_hours: i64) -> Self {
        Self {
            cell,
            heat_score: 0.0,
            heat_level: HeatLevel::Cold,
            velocities: Velocities {
                saves_per_hour: 0.0,
                messages_per_hour: 0.0,
                listings_per_hour: 0.0,
                sales_per_hour: 0.0,
            },
            volume: Volume {
                active_listings: 0,
                total_events: 0,
            },
            trending_brands: Vec::new(),
            trending_skus: Vec::new(),
            price: PriceSummary {
                average: None,
                trend: PriceTrend::Stable,
                change_percent: 0.0,
            },
            window_hours,
        }
    }
}

/// Timestamp log for one signal, pruned against the window.
#[derive(Debug, Default)]
struct SignalLog(VecDeque<i64>);

impl SignalLog {
    fn record(&mut self, at: i64) {
        self.0.push_back(at);
    }

    fn prune(&mut self, cutoff: i64) {
        while self.0.front().is_some_and(|&t| t < cutoff) {
            self.0.pop_front();
        }
    }

    fn count(&self) -> u64 {
        self.0.len() as u64
    }
}

/// Timestamped key log (brands, SKUs).
#[derive(Debug, Default)]
struct KeyLog(VecDeque<(i64, String)>);

impl KeyLog {
    fn record(&mut self, at: i64, key: &str) {
        self.0.push_back((at, key.to_string()));
    }

    fn prune(&mut self, cutoff: i64) {
        while self.0.front().is_some_and(|(t, _)| *t < cutoff) {
            self.0.pop_front();
        }
    }

    /// Top-K by recency-decayed score; ties broken by most-recent event,
    /// then name, so equal inputs always rank identically.
    fn top_k(&self, now: i64, window_millis: i64, k: usize) -> Vec<TrendingEntry> {
        use std::collections::BTreeMap;

        // name -> (decayed score, windowed count, last seen)
        let mut scores: BTreeMap<&str, (f64, u64, i64)> = BTreeMap::new();
        for (at, key) in &self.0 {
            let age = (now - at).max(0) as f64;
            let weight = (1.0 - age / window_millis as f64).max(0.0);
            let entry = scores.entry(key.as_str()).or_insert((0.0, 0, *at));
            entry.0 += weight;
            entry.1 += 1;
            entry.2 = entry.2.max(*at);
        }

        let mut ranked: Vec<(TrendingEntry, i64)> = scores
            .into_iter()
            .map(|(name, (score, count, last))| {
                (
                    TrendingEntry {
                        name: name.to_string(),
                        score: (score * 100.0).round() / 100.0,
                        count,
                    },
                    last,
                )
            })
            .collect();
        ranked.sort_by(|(a, a_last), (b, b_last)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b_last.cmp(a_last))
                .then_with(|| a.name.cmp(&b.name))
        });
        ranked.truncate(k);
        ranked.into_iter().map(|(entry, _)| entry).collect()
    }
}

/// Rolling statistics for one cell.
#[derive(Debug, Default)]
struct CellStats {
    saves: SignalLog,
    messages: SignalLog,
    listings: SignalLog,
    sales: SignalLog,
    all_events: SignalLog,
    brands: KeyLog,
    skus: KeyLog,
    prices: VecDeque<(i64, Decimal)>,
}

impl CellStats {
    fn prune(&mut self, cutoff: i64) {
        self.saves.prune(cutoff);
        self.messages.prune(cutoff);
        self.listings.prune(cutoff);
        self.sales.prune(cutoff);
        self.all_events.prune(cutoff);
        self.brands.prune(cutoff);
        self.skus.prune(cutoff);
        while self.prices.front().is_some_and(|(t, _)| *t < cutoff) {
            self.prices.pop_front();
        }
    }

    fn apply(&mut self, event: &FeedEvent) {
        let at = event.created_at;
        self.all_events.record(at);

        match event.event_type {
            FeedEventType::NewListing | FeedEventType::Restock => {
                self.listings.record(at);
            }
            FeedEventType::PriceDrop => {
                self.listings.record(at);
            }
            FeedEventType::ItemSold => {
                self.sales.record(at);
            }
            FeedEventType::TradeRequest | FeedEventType::TradeCompleted => {
                self.messages.record(at);
            }
        }

        if let Some(brand) = event.payload_str("brand") {
            self.brands.record(at, brand);
        }
        if let Some(sku) = event.payload_str("sku") {
            self.skus.record(at, sku);
        }

        let price_key = match event.event_type {
            FeedEventType::PriceDrop => Some("new_price"),
            FeedEventType::NewListing => Some("price"),
            _ => None,
        };
        if let Some(key) = price_key {
            if let Some(price) = event.payload_f64(key).and_then(Decimal::from_f64_retain) {
                self.prices.push_back((at, price));
            }
        }
    }

    fn price_summary(&self, now: i64, window_millis: i64) -> PriceSummary {
        if self.prices.is_empty() {
            return PriceSummary {
                average: None,
                trend: PriceTrend::Stable,
                change_percent: 0.0,
            };
        }

        let sum: Decimal = self.prices.iter().map(|(_, p)| *p).sum();
        let average = (sum / Decimal::from(self.prices.len())).round_dp(2);

        // Newer half of the window against the older half.
        let midpoint = now - window_millis / 2;
        let mut older = Vec::new();
        let mut newer = Vec::new();
        for (at, price) in &self.prices {
            if *at < midpoint {
                older.push(*price);
            } else {
                newer.push(*price);
            }
        }

        let (trend, change_percent) = if older.is_empty() || newer.is_empty() {
            (PriceTrend::Stable, 0.0)
        } else {
            let old_avg: Decimal = older.iter().sum::<Decimal>() / Decimal::from(older.len());
            let new_avg: Decimal = newer.iter().sum::<Decimal>() / Decimal::from(newer.len());
            if old_avg.is_zero() {
                (PriceTrend::Stable, 0.0)
            } else {
                let change = ((new_avg - old_avg) / old_avg * Decimal::from(100)).round_dp(1);
                let change = change.to_f64().unwrap_or(0.0);
                let trend = if change > 1.0 {
                    PriceTrend::Rising
                } else if change < -1.0 {
                    PriceTrend::Falling
                } else {
                    PriceTrend::Stable
                };
                (trend, change)
            }
        };

        PriceSummary {
            average: Some(average),
            trend,
            change_percent,
        }
    }
}

/// Owns every cell's rolling stats and derives heat indexes.
pub struct HeatEngine {
    config: HeatConfig,
    cells: DashMap<Cell, CellStats>,
}

impl HeatEngine {
    pub fn new(config: HeatConfig) -> Self {
        Self {
            config,
            cells: DashMap::new(),
        }
    }

    fn window_millis(&self) -> i64 {
        self.config.window_hours * 3_600_000
    }

    /// Fold an event into its cell's stats.
    pub fn record_event(&self, event: &FeedEvent) {
        let cutoff = Utc::now().timestamp_millis() - self.window_millis();
        let mut stats = self.cells.entry(event.cell.clone()).or_default();
        stats.prune(cutoff);
        stats.apply(event);
        trace!(cell = %event.cell, event_type = event.event_type.as_str(), "stats updated");
    }

    /// Record a save engagement tick for a cell. Saves reach the engine
    /// directly from the marketplace layer, not as feed events.
    pub fn record_save(&self, cell: &Cell, at: i64) {
        let cutoff = Utc::now().timestamp_millis() - self.window_millis();
        let mut stats = self.cells.entry(cell.clone()).or_default();
        stats.prune(cutoff);
        stats.saves.record(at);
        stats.all_events.record(at);
    }

    /// Heat snapshot for a cell. Unknown cells read as cold and empty.
    pub fn heat_index(&self, cell: &Cell) -> HeatIndex {
        let now = Utc::now().timestamp_millis();
        let window_millis = self.window_millis();
        let window_hours = self.config.window_hours as f64;

        let Some(mut stats) = self.cells.get_mut(cell) else {
            return HeatIndex::empty(cell.clone(), self.config.window_hours);
        };
        stats.prune(now - window_millis);

        let velocities = Velocities {
            saves_per_hour: round2(stats.saves.count() as f64 / window_hours),
            messages_per_hour: round2(stats.messages.count() as f64 / window_hours),
            listings_per_hour: round2(stats.listings.count() as f64 / window_hours),
            sales_per_hour: round2(stats.sales.count() as f64 / window_hours),
        };
        let active_listings = stats.listings.count().saturating_sub(stats.sales.count());
        let volume = Volume {
            active_listings,
            total_events: stats.all_events.count(),
        };

        let w = &self.config.weights;
        let raw_score = velocities.saves_per_hour * w.save
            + velocities.messages_per_hour * w.message
            + velocities.listings_per_hour * w.listing
            + active_listings as f64 * w.volume;
        let heat_score = round2(raw_score.clamp(0.0, 100.0));

        HeatIndex {
            cell: cell.clone(),
            heat_score,
            heat_level: HeatLevel::for_score(heat_score, &self.config.thresholds),
            velocities,
            volume,
            trending_brands: stats.brands.top_k(now, window_millis, self.config.trending_top_k),
            trending_skus: stats.skus.top_k(now, window_millis, self.config.trending_top_k),
            price: stats.price_summary(now, window_millis),
            window_hours: self.config.window_hours,
        }
    }

    /// Number of cells with recorded stats.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
