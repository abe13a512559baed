// =============================================================================
// DataStore — market state owned by the opportunity core
// =============================================================================
//
// The opportunity core is the only writer. Readers outside it (dashboard,
// status API) receive cloned snapshots, never references into the map.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Comparison, MetricType};

/// Price points retained per market.
const PRICE_HISTORY_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub at: DateTime<Utc>,
    pub yes_price: f64,
    pub no_price: f64,
}

/// One tracked prediction market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketState {
    pub market_id: String,
    pub question: String,
    pub city_id: String,
    pub metric: MetricType,
    /// Threshold in market units (°F for temperature, mm for precipitation).
    pub threshold: f64,
    pub comparison: Comparison,
    pub yes_price: f64,
    pub no_price: f64,
    pub target_date: DateTime<Utc>,
    /// Last forecast value seen for this market, market units.
    #[serde(default)]
    pub last_forecast: Option<f64>,
    #[serde(default)]
    pub price_history: VecDeque<PricePoint>,
}

pub struct DataStore {
    markets: RwLock<HashMap<String, MarketState>>,
}

impl DataStore {
    pub fn new() -> Self {
        Self {
            markets: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a tracked market (from the discovery collaborator).
    pub fn upsert_market(&self, market: MarketState) {
        debug!(market = %market.market_id, question = %market.question, "market upserted");
        self.markets
            .write()
            .insert(market.market_id.clone(), market);
    }

    pub fn remove_market(&self, market_id: &str) -> Option<MarketState> {
        self.markets.write().remove(market_id)
    }

    /// Apply a venue price update.
    pub fn update_price(&self, market_id: &str, yes_price: f64, no_price: f64) {
        let mut markets = self.markets.write();
        if let Some(m) = markets.get_mut(market_id) {
            m.yes_price = yes_price;
            m.no_price = no_price;
            m.price_history.push_back(PricePoint {
                at: Utc::now(),
                yes_price,
                no_price,
            });
            while m.price_history.len() > PRICE_HISTORY_CAP {
                m.price_history.pop_front();
            }
        }
    }

    pub fn set_last_forecast(&self, market_id: &str, value: f64) {
        let mut markets = self.markets.write();
        if let Some(m) = markets.get_mut(market_id) {
            m.last_forecast = Some(value);
        }
    }

    pub fn get(&self, market_id: &str) -> Option<MarketState> {
        self.markets.read().get(market_id).cloned()
    }

    /// Markets keyed on a (city, metric) pair, cloned.
    pub fn markets_for(&self, city_id: &str, metric: MetricType) -> Vec<MarketState> {
        let markets = self.markets.read();
        let mut out: Vec<MarketState> = markets
            .values()
            .filter(|m| m.city_id == city_id && m.metric == metric)
            .cloned()
            .collect();
        // Deterministic processing order.
        out.sort_by(|a, b| a.market_id.cmp(&b.market_id));
        out
    }

    /// Immutable snapshot of every tracked market.
    pub fn snapshot(&self) -> Vec<MarketState> {
        let markets = self.markets.read();
        let mut out: Vec<MarketState> = markets.values().cloned().collect();
        out.sort_by(|a, b| a.market_id.cmp(&b.market_id));
        out
    }

    pub fn len(&self) -> usize {
        self.markets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.read().is_empty()
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}
