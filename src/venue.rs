// =============================================================================
// Trading venue — interface, order book shape, paper venue, price stream
// =============================================================================
//
// Market discovery and order placement proper live outside the core; this
// module defines the surface the core consumes. The paper venue backs demo
// mode and tests with a synthetic in-memory book.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::datastore::DataStore;
use crate::error::{EngineError, Result};
use crate::types::TradeSide;

/// Venue order submission budget.
pub const SUBMIT_TIMEOUT_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Book & receipts
// ---------------------------------------------------------------------------

/// Top-of-book snapshot for a binary market, quoted on the YES side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketBook {
    pub market_id: String,
    pub yes_bid: f64,
    pub yes_ask: f64,
    /// USD depth resting at the best bid / best ask.
    pub bid_depth: f64,
    pub ask_depth: f64,
}

impl MarketBook {
    /// Price paid to take the given side right now.
    pub fn taker_price(&self, side: TradeSide) -> f64 {
        match side {
            TradeSide::Yes => self.yes_ask,
            // Buying NO consumes the YES bid.
            TradeSide::No => 1.0 - self.yes_bid,
        }
    }

    /// Absolute YES spread.
    pub fn spread(&self) -> f64 {
        (self.yes_ask - self.yes_bid).max(0.0)
    }

    /// Smaller of the two best-level depths.
    pub fn min_depth(&self) -> f64 {
        self.bid_depth.min(self.ask_depth)
    }
}

/// Result of a successful order submission.
#[derive(Debug, Clone, Serialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub market_id: String,
    pub side: TradeSide,
    pub size_usd: f64,
    pub fill_price: f64,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TradingVenue: Send + Sync {
    fn name(&self) -> &'static str;

    async fn market_book(&self, market_id: &str) -> Result<MarketBook>;

    async fn submit_order(
        &self,
        market_id: &str,
        side: TradeSide,
        size_usd: f64,
        price_limit: f64,
    ) -> Result<OrderReceipt>;
}

// ---------------------------------------------------------------------------
// Paper venue
// ---------------------------------------------------------------------------

/// In-memory venue for demo mode and tests. Fills at the taker price when it
/// is within the limit; otherwise rejects.
pub struct PaperVenue {
    books: Mutex<HashMap<String, MarketBook>>,
    submissions: Mutex<Vec<OrderReceipt>>,
    next_order_id: AtomicU64,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self {
            books: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            next_order_id: AtomicU64::new(1),
        }
    }

    pub fn set_book(&self, book: MarketBook) {
        self.books.lock().insert(book.market_id.clone(), book);
    }

    pub fn submissions(&self) -> Vec<OrderReceipt> {
        self.submissions.lock().clone()
    }
}

impl Default for PaperVenue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradingVenue for PaperVenue {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn market_book(&self, market_id: &str) -> Result<MarketBook> {
        self.books
            .lock()
            .get(market_id)
            .cloned()
            .ok_or_else(|| EngineError::Transient(format!("no book for market {market_id}")))
    }

    async fn submit_order(
        &self,
        market_id: &str,
        side: TradeSide,
        size_usd: f64,
        price_limit: f64,
    ) -> Result<OrderReceipt> {
        let book = self.market_book(market_id).await?;
        let taker = book.taker_price(side);
        if taker > price_limit {
            return Err(EngineError::Transient(format!(
                "paper fill rejected: taker {taker:.3} above limit {price_limit:.3}"
            )));
        }

        let receipt = OrderReceipt {
            order_id: format!("paper-{}", self.next_order_id.fetch_add(1, Ordering::Relaxed)),
            market_id: market_id.to_string(),
            side,
            size_usd,
            fill_price: taker,
        };
        info!(
            market = market_id,
            side = %side,
            size_usd,
            fill_price = taker,
            "paper order filled"
        );
        self.submissions.lock().push(receipt.clone());
        Ok(receipt)
    }
}

// ---------------------------------------------------------------------------
// Price stream
// ---------------------------------------------------------------------------

/// Wire shape of a venue price update.
#[derive(Debug, Deserialize)]
struct PriceUpdateMsg {
    market_id: String,
    yes_price: f64,
    no_price: f64,
}

/// Consume the venue's WebSocket price feed, pushing updates into the
/// DataStore. Returns on stream end or error; callers reconnect with a
/// backoff loop.
pub async fn run_price_stream(
    ws_url: &str,
    store: Arc<DataStore>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(url = ws_url, "connecting to venue price stream");
    let (ws_stream, _response) = connect_async(ws_url)
        .await
        .map_err(|e| EngineError::Transient(format!("venue WebSocket connect failed: {e}")))?;
    info!("venue price stream connected");

    let (_write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        match serde_json::from_str::<PriceUpdateMsg>(&text) {
                            Ok(update) => {
                                debug!(
                                    market = %update.market_id,
                                    yes = update.yes_price,
                                    "price update"
                                );
                                store.update_price(
                                    &update.market_id,
                                    update.yes_price,
                                    update.no_price,
                                );
                            }
                            Err(e) => {
                                warn!(error = %e, "unparseable price update");
                            }
                        }
                    }
                    // Ping/pong handled by tungstenite; ignore other frames.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(EngineError::Transient(format!("price stream read error: {e}")));
                    }
                    None => {
                        warn!("venue price stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(bid: f64, ask: f64) -> MarketBook {
        MarketBook {
            market_id: "m1".into(),
            yes_bid: bid,
            yes_ask: ask,
            bid_depth: 500.0,
            ask_depth: 300.0,
        }
    }

    #[test]
    fn taker_prices_complement() {
        let b = book(0.44, 0.46);
        assert!((b.taker_price(TradeSide::Yes) - 0.46).abs() < 1e-9);
        assert!((b.taker_price(TradeSide::No) - 0.56).abs() < 1e-9);
        assert!((b.spread() - 0.02).abs() < 1e-9);
        assert!((b.min_depth() - 300.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn paper_venue_fills_within_limit() {
        let venue = PaperVenue::new();
        venue.set_book(book(0.44, 0.46));

        let receipt = venue
            .submit_order("m1", TradeSide::Yes, 25.0, 0.47)
            .await
            .unwrap();
        assert!((receipt.fill_price - 0.46).abs() < 1e-9);
        assert_eq!(venue.submissions().len(), 1);
    }

    #[tokio::test]
    async fn paper_venue_rejects_above_limit() {
        let venue = PaperVenue::new();
        venue.set_book(book(0.44, 0.46));
        assert!(venue
            .submit_order("m1", TradeSide::Yes, 25.0, 0.45)
            .await
            .is_err());
        assert!(venue.submissions().is_empty());
    }
}
