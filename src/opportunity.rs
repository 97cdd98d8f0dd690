use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::error::ArbServiceError;
use crate::exchanges::Exchange;
use crate::watcher::{BestQuote, LivePriceWatcher, VenueStatus};

const TICK_PERIOD: Duration = Duration::from_millis(500);

/// A positive fee-adjusted spread between two venues.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub buy_venue: Exchange,
    pub buy_price: f64,
    pub buy_ts: Instant,
    pub sell_venue: Exchange,
    pub sell_price: f64,
    pub sell_ts: Instant,
    pub fee_adj_profit: f64,
    pub detected_at: Instant,
}

/// What one evaluation of the aggregator produced.
#[derive(Debug)]
pub(crate) enum TickDecision {
    NoProfit,
    /// The detection relies on a quote older than the stale window, the
    /// older venue must be reconnected instead of emitting.
    Stale { venue: Exchange },
    Emit(Opportunity),
}

/// Periodic evaluator over the shared watcher. Emits opportunity records to
/// the log and the CSV sink, disconnects venues whose quotes went stale, and
/// tracks whether a detection is the same venue pair persisting or a new
/// one.
pub struct OpportunityMonitor {
    watcher: Arc<LivePriceWatcher>,
    taker_fee: f64,
    stale_time: Duration,
    opportunities_file: PathBuf,
    first_opportunity: Option<(Exchange, Exchange)>,
}

impl OpportunityMonitor {
    pub fn new(watcher: Arc<LivePriceWatcher>, settings: &Settings) -> Self {
        OpportunityMonitor {
            watcher,
            taker_fee: settings.taker_fee,
            stale_time: settings.stale_time,
            opportunities_file: settings.opportunities_file.clone(),
            first_opportunity: None,
        }
    }

    pub fn spawn(mut self) -> JoinHandle<Result<(), ArbServiceError>> {
        tokio::spawn(async move {
            tracing::info!(
                symbol = self.watcher.symbol(),
                taker_fee = self.taker_fee,
                "starting opportunity monitor"
            );

            let mut ticker = tokio::time::interval(TICK_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.check_once(Instant::now());
            }
        })
    }

    fn check_once(&mut self, now: Instant) {
        // Nothing to arbitrage until at least two venues are live.
        if self.watcher.connected_count() < 2 {
            return;
        }
        let Some((best_bid, best_ask)) = self.watcher.get_best_opportunity() else {
            return;
        };

        match evaluate(&best_bid, &best_ask, self.taker_fee, self.stale_time, now) {
            TickDecision::NoProfit => {
                self.first_opportunity = None;
            }
            TickDecision::Stale { venue } => {
                tracing::warn!(
                    symbol = self.watcher.symbol(),
                    %venue,
                    "opportunity is stale, disconnecting the older venue"
                );
                self.watcher.set_status(venue, VenueStatus::Disconnected);
            }
            TickDecision::Emit(opportunity) => {
                let persistent = self.classify(&opportunity);
                self.emit(&opportunity, persistent);
            }
        }
    }

    /// Whether the current detection is the first seen venue pair
    /// persisting. A changed pair resets the tracker.
    fn classify(&mut self, opportunity: &Opportunity) -> bool {
        let pair = (opportunity.buy_venue, opportunity.sell_venue);

        match self.first_opportunity {
            None => {
                self.first_opportunity = Some(pair);
                false
            }
            Some(first) if first == pair => true,
            Some(_) => {
                self.first_opportunity = None;
                false
            }
        }
    }

    fn emit(&self, opportunity: &Opportunity, persistent: bool) {
        let snapshot = self.watcher.snapshot();
        let prices = serde_json::to_string(&snapshot.exchanges).unwrap_or_default();

        tracing::info!(
            symbol = self.watcher.symbol(),
            profit = opportunity.fee_adj_profit,
            buy_venue = %opportunity.buy_venue,
            buy_price = opportunity.buy_price,
            sell_venue = %opportunity.sell_venue,
            sell_price = opportunity.sell_price,
            persistent,
            prices = %prices,
            "arbitrage opportunity"
        );

        if let Err(e) =
            append_opportunity_row(&self.opportunities_file, self.watcher.symbol(), opportunity)
        {
            tracing::warn!(
                error = %e,
                path = %self.opportunities_file.display(),
                "failed to append opportunity row"
            );
        }
    }
}

/// Computes the fee-adjusted spread between the best bid and the best ask
/// and applies the staleness policy. Prices are rounded to cents before
/// differencing.
pub(crate) fn evaluate(
    best_bid: &BestQuote,
    best_ask: &BestQuote,
    taker_fee: f64,
    stale_time: Duration,
    now: Instant,
) -> TickDecision {
    let adj_bid = round_cents(best_bid.price * (1.0 - taker_fee));
    let adj_ask = round_cents(best_ask.price * (1.0 + taker_fee));
    let profit = adj_bid - adj_ask;

    if profit <= 0.0 {
        return TickDecision::NoProfit;
    }

    let skew = best_bid
        .last_update
        .max(best_ask.last_update)
        .duration_since(best_bid.last_update.min(best_ask.last_update));
    let bid_age = now.saturating_duration_since(best_bid.last_update);
    let ask_age = now.saturating_duration_since(best_ask.last_update);

    if skew > stale_time || bid_age > stale_time || ask_age > stale_time {
        // Reconnect whichever side stopped moving first.
        let venue = if best_ask.last_update > best_bid.last_update {
            best_bid.exchange
        } else {
            best_ask.exchange
        };
        return TickDecision::Stale { venue };
    }

    TickDecision::Emit(Opportunity {
        buy_venue: best_ask.exchange,
        buy_price: best_ask.price,
        buy_ts: best_ask.last_update,
        sell_venue: best_bid.exchange,
        sell_price: best_bid.price,
        sell_ts: best_bid.last_update,
        fee_adj_profit: profit,
        detected_at: now,
    })
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn append_opportunity_row(
    path: &Path,
    symbol: &str,
    opportunity: &Opportunity,
) -> Result<(), ArbServiceError> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record([
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        symbol.to_owned(),
        opportunity.buy_venue.to_string(),
        opportunity.buy_price.to_string(),
        opportunity.sell_venue.to_string(),
        opportunity.sell_price.to_string(),
        opportunity.fee_adj_profit.to_string(),
    ])?;
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::{evaluate, OpportunityMonitor, TickDecision};
    use crate::config::Settings;
    use crate::exchanges::Exchange;
    use crate::watcher::{BestQuote, LivePriceWatcher, VenueStatus};

    const STALE_TIME: Duration = Duration::from_secs(30);

    fn quote(exchange: Exchange, price: f64, last_update: Instant) -> BestQuote {
        BestQuote {
            exchange,
            price,
            last_update,
        }
    }

    fn settings() -> Settings {
        Settings {
            symbol: "BTC".to_owned(),
            exchanges: vec![Exchange::Binance, Exchange::Bybit],
            taker_fee: 0.001,
            stale_time: STALE_TIME,
            max_ws_reconnects: 10,
            redis_url: None,
            status_file: std::path::PathBuf::from("logs/status_BTC.json"),
            opportunities_file: std::path::PathBuf::from("/nonexistent/opportunities.csv"),
            kucoin: None,
        }
    }

    #[test]
    fn test_fee_eats_the_spread() {
        let now = Instant::now();
        // A: 100.00/100.10, B: 100.30/100.40, fee 0.001. The adjusted bid
        // and ask both round to 100.20, no profit.
        let best_bid = quote(Exchange::Bybit, 100.30, now);
        let best_ask = quote(Exchange::Binance, 100.10, now);

        let decision = evaluate(&best_bid, &best_ask, 0.001, STALE_TIME, now);
        assert!(matches!(decision, TickDecision::NoProfit));
    }

    #[test]
    fn test_positive_spread_is_emitted() {
        let now = Instant::now();
        let best_bid = quote(Exchange::Bybit, 100.50, now);
        let best_ask = quote(Exchange::Binance, 100.10, now);

        let decision = evaluate(&best_bid, &best_ask, 0.001, STALE_TIME, now);
        let TickDecision::Emit(opportunity) = decision else {
            panic!("expected an emission, got {decision:?}");
        };

        assert_eq!(opportunity.buy_venue, Exchange::Binance);
        assert_eq!(opportunity.buy_price, 100.10);
        assert_eq!(opportunity.sell_venue, Exchange::Bybit);
        assert_eq!(opportunity.sell_price, 100.50);
        assert!((opportunity.fee_adj_profit - 0.20).abs() < 1e-9);
    }

    #[test]
    fn test_skewed_quotes_disconnect_the_older_venue() {
        let now = Instant::now();
        let bid_ts = now - Duration::from_secs(45);
        let best_bid = quote(Exchange::Bybit, 100.50, bid_ts);
        let best_ask = quote(Exchange::Binance, 100.10, now);

        let decision = evaluate(&best_bid, &best_ask, 0.001, STALE_TIME, now);
        assert!(
            matches!(decision, TickDecision::Stale { venue } if venue == Exchange::Bybit),
            "the older bid side should be disconnected"
        );
    }

    #[test]
    fn test_aged_quotes_are_stale_even_without_skew() {
        let now = Instant::now();
        let past = now - Duration::from_secs(40);
        let best_bid = quote(Exchange::Bybit, 100.50, past);
        let best_ask = quote(Exchange::Binance, 100.10, past);

        let decision = evaluate(&best_bid, &best_ask, 0.001, STALE_TIME, now);
        assert!(matches!(decision, TickDecision::Stale { .. }));
    }

    #[test]
    fn test_check_once_disconnects_exactly_one_stale_venue() {
        let watcher = Arc::new(LivePriceWatcher::new("BTC", None));
        watcher.update_price(Exchange::Binance, 100.0, 100.10);
        watcher.update_price(Exchange::Bybit, 100.50, 100.60);

        let mut monitor = OpportunityMonitor::new(watcher.clone(), &settings());
        // Evaluate as if both quotes were taken 40 seconds ago.
        monitor.check_once(Instant::now() + Duration::from_secs(40));

        let disconnected = [Exchange::Binance, Exchange::Bybit]
            .iter()
            .filter(|exchange| {
                watcher.get_status(**exchange) == Some(VenueStatus::Disconnected)
            })
            .count();
        assert_eq!(disconnected, 1);
    }

    #[test]
    fn test_check_once_requires_two_connected_venues() {
        let watcher = Arc::new(LivePriceWatcher::new("BTC", None));
        watcher.update_price(Exchange::Binance, 100.0, 100.10);

        let mut monitor = OpportunityMonitor::new(watcher.clone(), &settings());
        monitor.check_once(Instant::now());

        assert_eq!(
            watcher.get_status(Exchange::Binance),
            Some(VenueStatus::Connected)
        );
    }

    #[test]
    fn test_persistence_classification() {
        let watcher = Arc::new(LivePriceWatcher::new("BTC", None));
        let mut monitor = OpportunityMonitor::new(watcher, &settings());

        let now = Instant::now();
        let opportunity = |buy: Exchange, sell: Exchange| super::Opportunity {
            buy_venue: buy,
            buy_price: 100.10,
            buy_ts: now,
            sell_venue: sell,
            sell_price: 100.50,
            sell_ts: now,
            fee_adj_profit: 0.2,
            detected_at: now,
        };

        // First sighting, then the same pair persisting, then a new pair.
        assert!(!monitor.classify(&opportunity(Exchange::Binance, Exchange::Bybit)));
        assert!(monitor.classify(&opportunity(Exchange::Binance, Exchange::Bybit)));
        assert!(!monitor.classify(&opportunity(Exchange::Kraken, Exchange::Bybit)));
        // The tracker restarts after the reset.
        assert!(!monitor.classify(&opportunity(Exchange::Kraken, Exchange::Bybit)));
        assert!(monitor.classify(&opportunity(Exchange::Kraken, Exchange::Bybit)));
    }
}
