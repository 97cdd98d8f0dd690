use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_derive::Serialize;
use tokio::sync::mpsc;

use crate::exchanges::Exchange;

pub mod status;

use self::status::StatusSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueStatus {
    Connected,
    Disconnected,
    Stopped,
}

/// The most recent top of book reported by one venue.
///
/// Prices are only present once the venue's client has published at least one
/// best bid/ask pair. `last_update` is monotonic and drives the staleness
/// policy, `timestamp` is wall clock and only feeds the status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub timestamp: Option<f64>,
    pub status: VenueStatus,
    #[serde(skip)]
    pub last_update: Option<Instant>,
}

impl Quote {
    fn empty(status: VenueStatus) -> Self {
        Quote {
            bid: None,
            ask: None,
            timestamp: None,
            status,
            last_update: None,
        }
    }
}

/// One side of a detected spread, as returned by `get_best_opportunity`.
#[derive(Debug, Clone, Copy)]
pub struct BestQuote {
    pub exchange: Exchange,
    pub price: f64,
    pub last_update: Instant,
}

/// Shared per-symbol price aggregator.
///
/// Each venue client is the only writer of its own entry, the opportunity
/// loop additionally writes statuses. Entries keep their insertion order so
/// that ties in `get_best_opportunity` resolve to the first seen venue.
/// Mutations never suspend, the status snapshot is handed to the publisher
/// task over a channel instead of being written inline.
#[derive(Debug)]
pub struct LivePriceWatcher {
    symbol: String,
    prices: RwLock<Vec<(Exchange, Quote)>>,
    status_tx: Option<mpsc::Sender<StatusSnapshot>>,
}

impl LivePriceWatcher {
    pub fn new(symbol: &str, status_tx: Option<mpsc::Sender<StatusSnapshot>>) -> Self {
        LivePriceWatcher {
            symbol: symbol.to_owned(),
            prices: RwLock::new(Vec::new()),
            status_tx,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Publishes a new best pair for the venue and marks it Connected.
    pub fn update_price(&self, exchange: Exchange, bid: f64, ask: f64) {
        {
            let mut prices = self.write_prices();
            let quote = entry(&mut prices, exchange);
            quote.bid = Some(bid);
            quote.ask = Some(ask);
            quote.timestamp = Some(unix_now());
            quote.last_update = Some(Instant::now());
            quote.status = VenueStatus::Connected;
        }

        self.publish_status();
    }

    /// Transitions the venue's status without touching its prices.
    pub fn set_status(&self, exchange: Exchange, status: VenueStatus) {
        {
            let mut prices = self.write_prices();
            entry(&mut prices, exchange).status = status;
        }

        self.publish_status();
    }

    pub fn get_status(&self, exchange: Exchange) -> Option<VenueStatus> {
        self.read_prices()
            .iter()
            .find(|(venue, _)| *venue == exchange)
            .map(|(_, quote)| quote.status)
    }

    pub fn get_quote(&self, exchange: Exchange) -> Option<Quote> {
        self.read_prices()
            .iter()
            .find(|(venue, _)| *venue == exchange)
            .map(|(_, quote)| quote.clone())
    }

    /// Drops the venue's entry entirely, used when a client has to restart
    /// from scratch and its previous quote must not linger.
    pub fn remove_venue(&self, exchange: Exchange) {
        {
            let mut prices = self.write_prices();
            prices.retain(|(venue, _)| *venue != exchange);
        }

        self.publish_status();
    }

    pub fn connected_count(&self) -> usize {
        self.read_prices()
            .iter()
            .filter(|(_, quote)| quote.status == VenueStatus::Connected)
            .count()
    }

    /// The venue with the highest bid and the venue with the lowest ask,
    /// considering only Connected entries with both prices present. Strict
    /// comparisons keep the first seen venue on ties. Returns `None` unless
    /// both sides are available.
    pub fn get_best_opportunity(&self) -> Option<(BestQuote, BestQuote)> {
        let prices = self.read_prices();

        let mut best_bid: Option<BestQuote> = None;
        let mut best_ask: Option<BestQuote> = None;

        for (exchange, quote) in prices.iter() {
            if quote.status != VenueStatus::Connected {
                continue;
            }
            let (Some(bid), Some(ask), Some(last_update)) =
                (quote.bid, quote.ask, quote.last_update)
            else {
                continue;
            };

            if bid > 0.0 && best_bid.map_or(true, |best| bid > best.price) {
                best_bid = Some(BestQuote {
                    exchange: *exchange,
                    price: bid,
                    last_update,
                });
            }
            if ask > 0.0 && best_ask.map_or(true, |best| ask < best.price) {
                best_ask = Some(BestQuote {
                    exchange: *exchange,
                    price: ask,
                    last_update,
                });
            }
        }

        match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => Some((bid, ask)),
            _ => None,
        }
    }

    /// Serializable view of the current state for the status publisher and
    /// the opportunity log.
    pub fn snapshot(&self) -> StatusSnapshot {
        let exchanges = self
            .read_prices()
            .iter()
            .map(|(exchange, quote)| (exchange.id().to_owned(), quote.clone()))
            .collect::<BTreeMap<String, Quote>>();

        StatusSnapshot {
            symbol: self.symbol.clone(),
            last_update: unix_now(),
            last_update_readable: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            exchanges,
        }
    }

    fn publish_status(&self) {
        if let Some(status_tx) = &self.status_tx {
            // The publisher lagging must never stall a venue client, a full
            // channel just drops this snapshot.
            let _ = status_tx.try_send(self.snapshot());
        }
    }

    fn read_prices(&self) -> RwLockReadGuard<'_, Vec<(Exchange, Quote)>> {
        match self.prices.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_prices(&self) -> RwLockWriteGuard<'_, Vec<(Exchange, Quote)>> {
        match self.prices.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn entry<'a>(
    prices: &'a mut Vec<(Exchange, Quote)>,
    exchange: Exchange,
) -> &'a mut Quote {
    let position = match prices.iter().position(|(venue, _)| *venue == exchange) {
        Some(position) => position,
        None => {
            prices.push((exchange, Quote::empty(VenueStatus::Disconnected)));
            prices.len() - 1
        }
    };
    &mut prices[position].1
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::{LivePriceWatcher, VenueStatus};
    use crate::exchanges::Exchange;

    #[test]
    fn test_update_price_marks_connected() {
        let watcher = LivePriceWatcher::new("BTC", None);
        watcher.update_price(Exchange::Binance, 100.0, 100.1);

        let quote = watcher.get_quote(Exchange::Binance).unwrap();
        assert_eq!(quote.status, VenueStatus::Connected);
        assert_eq!(quote.bid, Some(100.0));
        assert_eq!(quote.ask, Some(100.1));
        assert!(quote.last_update.is_some());
    }

    #[test]
    fn test_set_status_preserves_prices() {
        let watcher = LivePriceWatcher::new("BTC", None);
        watcher.update_price(Exchange::Binance, 100.0, 100.1);
        watcher.set_status(Exchange::Binance, VenueStatus::Disconnected);

        let quote = watcher.get_quote(Exchange::Binance).unwrap();
        assert_eq!(quote.status, VenueStatus::Disconnected);
        assert_eq!(quote.bid, Some(100.0));
        assert_eq!(quote.ask, Some(100.1));
    }

    #[test]
    fn test_set_status_creates_empty_entry() {
        let watcher = LivePriceWatcher::new("BTC", None);
        watcher.set_status(Exchange::Kraken, VenueStatus::Disconnected);

        let quote = watcher.get_quote(Exchange::Kraken).unwrap();
        assert_eq!(quote.status, VenueStatus::Disconnected);
        assert_eq!(quote.bid, None);
        assert_eq!(quote.ask, None);
    }

    #[test]
    fn test_best_opportunity_skips_disconnected_venues() {
        let watcher = LivePriceWatcher::new("BTC", None);
        watcher.update_price(Exchange::Binance, 100.0, 100.1);
        watcher.update_price(Exchange::Kraken, 101.0, 101.1);
        watcher.set_status(Exchange::Kraken, VenueStatus::Stopped);

        let (best_bid, best_ask) = watcher.get_best_opportunity().unwrap();
        assert_eq!(best_bid.exchange, Exchange::Binance);
        assert_eq!(best_ask.exchange, Exchange::Binance);
    }

    #[test]
    fn test_best_opportunity_requires_both_sides() {
        let watcher = LivePriceWatcher::new("BTC", None);
        watcher.set_status(Exchange::Binance, VenueStatus::Connected);

        assert!(watcher.get_best_opportunity().is_none());
    }

    #[test]
    fn test_best_opportunity_tie_goes_to_first_seen() {
        let watcher = LivePriceWatcher::new("BTC", None);
        watcher.update_price(Exchange::Binance, 100.0, 100.2);
        watcher.update_price(Exchange::Kraken, 100.0, 100.2);

        let (best_bid, best_ask) = watcher.get_best_opportunity().unwrap();
        assert_eq!(best_bid.exchange, Exchange::Binance);
        assert_eq!(best_ask.exchange, Exchange::Binance);
    }

    #[test]
    fn test_best_opportunity_picks_extremes() {
        let watcher = LivePriceWatcher::new("BTC", None);
        watcher.update_price(Exchange::Binance, 100.0, 100.1);
        watcher.update_price(Exchange::Bybit, 100.3, 100.4);
        watcher.update_price(Exchange::Kraken, 99.9, 100.05);

        let (best_bid, best_ask) = watcher.get_best_opportunity().unwrap();
        assert_eq!(best_bid.exchange, Exchange::Bybit);
        assert_eq!(best_bid.price, 100.3);
        assert_eq!(best_ask.exchange, Exchange::Kraken);
        assert_eq!(best_ask.price, 100.05);
    }

    #[test]
    fn test_remove_venue_clears_entry() {
        let watcher = LivePriceWatcher::new("BTC", None);
        watcher.update_price(Exchange::Coinbase, 100.0, 100.1);
        watcher.remove_venue(Exchange::Coinbase);

        assert!(watcher.get_quote(Exchange::Coinbase).is_none());
        assert_eq!(watcher.connected_count(), 0);
    }
}
