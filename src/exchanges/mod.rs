pub mod binance;
pub mod bybit;
pub mod coinbase;
pub mod exchange_utils;
pub mod kraken;
pub mod kucoin;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tungstenite::Message;

use crate::{
    config::{ConfigError, Settings},
    error::ArbServiceError,
    order_book::{error::OrderBookError, LocalOrderBook},
    watcher::LivePriceWatcher,
};

use self::{
    binance::Binance, bybit::Bybit, coinbase::Coinbase, kraken::Kraken, kucoin::Kucoin,
};

const BINANCE: &str = "binance";
const COINBASE: &str = "coinbase";
const BYBIT: &str = "bybit";
const KRAKEN: &str = "kraken";
const KUCOIN: &str = "kucoin";

/// Interval between reconnect attempts after a failed session.
pub(crate) const RECONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(5);
/// Throttle applied when the opportunity loop forced a disconnect.
pub(crate) const EXTERNAL_DISCONNECT_BACKOFF: std::time::Duration =
    std::time::Duration::from_secs(60);

#[async_trait]
pub trait OrderBookService {
    /// Spawns the venue's order book synchronizer as a supervised task which
    /// publishes best bid/ask updates into the shared watcher. The task only
    /// returns once the venue's retry budget is saturated.
    async fn spawn_order_book_service(
        watcher: Arc<LivePriceWatcher>,
        settings: Arc<Settings>,
    ) -> JoinHandle<Result<(), ArbServiceError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    Binance,
    Coinbase,
    Bybit,
    Kraken,
    Kucoin,
}

impl Exchange {
    pub fn id(&self) -> &'static str {
        match self {
            Exchange::Binance => BINANCE,
            Exchange::Coinbase => COINBASE,
            Exchange::Bybit => BYBIT,
            Exchange::Kraken => KRAKEN,
            Exchange::Kucoin => KUCOIN,
        }
    }

    pub fn all_exchanges() -> Vec<Exchange> {
        vec![
            Exchange::Binance,
            Exchange::Coinbase,
            Exchange::Bybit,
            Exchange::Kraken,
            Exchange::Kucoin,
        ]
    }

    /// Parses a comma separated exchange set, ie. "binance,kraken".
    pub fn parse_exchanges(value: &str) -> Result<Vec<Exchange>, ConfigError> {
        let mut exchanges = vec![];

        for part in value.split(',') {
            let name = part.trim().to_lowercase();
            if name.is_empty() {
                continue;
            }

            let exchange = match name.as_str() {
                BINANCE => Exchange::Binance,
                COINBASE => Exchange::Coinbase,
                BYBIT => Exchange::Bybit,
                KRAKEN => Exchange::Kraken,
                KUCOIN => Exchange::Kucoin,
                _ => return Err(ConfigError::UnknownExchange(name)),
            };

            if !exchanges.contains(&exchange) {
                exchanges.push(exchange);
            }
        }

        Ok(exchanges)
    }

    /// The venue specific ticker for a base symbol, all venues are quoted
    /// against USD stables.
    pub fn venue_symbol(&self, symbol: &str) -> String {
        match self {
            Exchange::Binance => format!("{}usdt", symbol.to_lowercase()),
            Exchange::Coinbase => format!("{symbol}-USD"),
            Exchange::Bybit => format!("{symbol}USDT"),
            Exchange::Kraken => format!("{symbol}/USDT"),
            Exchange::Kucoin => format!("{symbol}-USDT"),
        }
    }

    pub async fn spawn_order_book_service(
        &self,
        watcher: Arc<LivePriceWatcher>,
        settings: Arc<Settings>,
    ) -> JoinHandle<Result<(), ArbServiceError>> {
        match self {
            Exchange::Binance => Binance::spawn_order_book_service(watcher, settings).await,
            Exchange::Coinbase => Coinbase::spawn_order_book_service(watcher, settings).await,
            Exchange::Bybit => Bybit::spawn_order_book_service(watcher, settings).await,
            Exchange::Kraken => Kraken::spawn_order_book_service(watcher, settings).await,
            Exchange::Kucoin => Kucoin::spawn_order_book_service(watcher, settings).await,
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What a bounded receive produced. Pings are answered and close frames are
/// folded into `Closed` so venue sessions only ever deal with text frames.
#[derive(Debug)]
pub(crate) enum RecvOutcome {
    Text(String),
    Timeout,
    Closed,
}

pub(crate) async fn recv_text(ws: &mut WsStream, wait: Duration) -> RecvOutcome {
    loop {
        match tokio::time::timeout(wait, ws.next()).await {
            Err(_elapsed) => return RecvOutcome::Timeout,
            Ok(None) => return RecvOutcome::Closed,
            Ok(Some(Err(e))) => {
                tracing::error!(error = %e, "ws receive error");
                return RecvOutcome::Closed;
            }
            Ok(Some(Ok(message))) => match message {
                Message::Text(text) => return RecvOutcome::Text(text),
                Message::Ping(payload) => {
                    ws.send(Message::Pong(payload)).await.ok();
                }
                Message::Close(_) => return RecvOutcome::Closed,
                other => {
                    tracing::warn!("{other:?}");
                }
            },
        }
    }
}

/// Why a streaming session ended, decided inside the session so the outer
/// reconnect loop only has to pick the right backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// No frame within the stale window, the venue was marked Disconnected.
    Stale,
    /// The opportunity loop marked the venue Disconnected, throttle before
    /// reconnecting.
    ExternalDisconnect,
    /// The peer closed the socket or the transport failed.
    Closed,
    /// A snapshot fetch failed, already counted against the snapshot budget.
    SnapshotFailed,
    /// An in-session protocol failure, already counted against the update
    /// budget.
    UpdateFailed,
    /// The session must restart from scratch without consuming any budget,
    /// ie. a Coinbase sequence break.
    Resync,
}

/// What applying one streaming delta did to the local book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeltaOutcome {
    Applied,
    /// The delta's cursor is not past `last_seq`, already covered.
    Skipped,
    /// The delta starts beyond `last_seq + 1`, the book missed events and
    /// must be rebuilt from a snapshot.
    Gap,
}

/// The two nested retry counters of a venue client plus the snapshot one.
/// Hitting any bound transitions the venue to Stopped.
#[derive(Debug, Default)]
pub(crate) struct RetryCounters {
    pub connect: u32,
    pub snapshot: u32,
    pub update: u32,
}

impl RetryCounters {
    pub fn new() -> Self {
        RetryCounters::default()
    }

    pub fn exhausted(&self, max: u32) -> bool {
        self.connect >= max || self.snapshot >= max || self.update >= max
    }
}

/// Publishes the book's best levels to the watcher when they changed since
/// the last publication. Returns whether an update went out. A crossed book
/// is refused so the caller can reset from a snapshot.
pub(crate) fn publish_best_levels(
    watcher: &LivePriceWatcher,
    exchange: Exchange,
    book: &LocalOrderBook,
    last_published: &mut Option<(f64, f64)>,
    force: bool,
) -> Result<bool, OrderBookError> {
    let Some((bid, ask)) = book.best_levels() else {
        return Ok(false);
    };

    if bid >= ask {
        return Err(OrderBookError::CrossedBook { bid, ask });
    }

    if !force && *last_published == Some((bid, ask)) {
        return Ok(false);
    }

    watcher.update_price(exchange, bid, ask);
    *last_published = Some((bid, ask));
    tracing::debug!(%exchange, bid, ask, "best levels updated");

    Ok(true)
}
