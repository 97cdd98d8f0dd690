use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use ordered_float::OrderedFloat;
use serde_derive::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tungstenite::Message;

use crate::config::Settings;
use crate::exchanges::kraken::error::KrakenError;
use crate::exchanges::{
    recv_text, Exchange, RecvOutcome, RetryCounters, SessionEnd, WsStream,
    EXTERNAL_DISCONNECT_BACKOFF, RECONNECT_BACKOFF,
};
use crate::watcher::{LivePriceWatcher, VenueStatus};

const WS_ENDPOINT: &str = "wss://ws.kraken.com/v2";
const REST_DEPTH_ENDPOINT: &str = "https://api.kraken.com/0/public/Depth";
pub const SUBSCRIBE: &str = "subscribe";
pub const BOOK: &str = "book";
const PING: &str = "ping";
const PONG: &str = "pong";
const SNAPSHOT_TYPE: &str = "snapshot";
const UPDATE_TYPE: &str = "update";
const BOOK_DEPTH: usize = 25;
const CHECKSUM_DEPTH: usize = 10;
//The kraken docs ask clients to probe an idle connection instead of waiting
//for the transport to notice
const KEEPALIVE_IDLE: Duration = Duration::from_secs(10);
const PONG_TIMEOUT: Duration = Duration::from_secs(5);

// Kraken's v2 book channel delivers the snapshot in-band and a CRC32
// checksum with every update. The checksum input needs the exact decimal
// strings from the wire, so this client keeps its own book representation
// with the raw price/qty text next to the numeric key instead of the plain
// float book the other venues use.

pub(crate) async fn run_order_book_stream(
    watcher: Arc<LivePriceWatcher>,
    settings: Arc<Settings>,
) -> Result<(), KrakenError> {
    let venue_symbol = Exchange::Kraken.venue_symbol(&settings.symbol);

    let mut counters = RetryCounters::new();

    while !counters.exhausted(settings.max_ws_reconnects) {
        let mut ws = match tokio_tungstenite::connect_async(WS_ENDPOINT).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                counters.connect += 1;
                tracing::warn!(
                    error = %e,
                    attempt = counters.connect,
                    "failed to connect to Kraken ws"
                );
                watcher.set_status(Exchange::Kraken, VenueStatus::Disconnected);
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };
        tracing::info!("Kraken ws connection established");

        let end = run_session(&watcher, &mut ws, &venue_symbol, &mut counters).await;
        let _ = ws.close(None).await;

        match end {
            SessionEnd::ExternalDisconnect => {
                tracing::warn!("Kraken marked disconnected externally, throttling reconnect");
                tokio::time::sleep(EXTERNAL_DISCONNECT_BACKOFF).await;
            }
            SessionEnd::Stale | SessionEnd::Resync => {}
            SessionEnd::Closed | SessionEnd::SnapshotFailed | SessionEnd::UpdateFailed => {
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }

    tracing::error!(
        max_ws_reconnects = settings.max_ws_reconnects,
        "max reconnect attempts reached, stopping Kraken order book listener"
    );
    watcher.set_status(Exchange::Kraken, VenueStatus::Stopped);

    Ok(())
}

async fn run_session(
    watcher: &LivePriceWatcher,
    ws: &mut WsStream,
    venue_symbol: &str,
    counters: &mut RetryCounters,
) -> SessionEnd {
    let subscribe = SubscribeMessage::new(venue_symbol, BOOK_DEPTH);
    let subscribe_message = match serde_json::to_string(&subscribe) {
        Ok(message) => message,
        Err(e) => {
            counters.update += 1;
            tracing::error!(error = %e, "failed to serialize Kraken subscription");
            return SessionEnd::UpdateFailed;
        }
    };
    if let Err(e) = ws.send(Message::Text(subscribe_message)).await {
        counters.connect += 1;
        tracing::warn!(error = %e, "failed to subscribe to Kraken book");
        watcher.set_status(Exchange::Kraken, VenueStatus::Disconnected);
        return SessionEnd::Closed;
    }

    let mut book: Option<KrakenBook> = None;
    let mut last_published = None;
    let mut subscribed = false;
    let mut ping_id: u64 = 1;
    let mut awaiting_pong: Option<u64> = None;

    loop {
        if book.is_some()
            && watcher.get_status(Exchange::Kraken) == Some(VenueStatus::Disconnected)
        {
            return SessionEnd::ExternalDisconnect;
        }

        let wait = if awaiting_pong.is_some() {
            PONG_TIMEOUT
        } else {
            KEEPALIVE_IDLE
        };

        let text = match recv_text(ws, wait).await {
            RecvOutcome::Text(text) => text,
            RecvOutcome::Timeout => {
                if let Some(req_id) = awaiting_pong {
                    tracing::warn!(req_id, "no pong from Kraken, reconnecting");
                    counters.update += 1;
                    watcher.set_status(Exchange::Kraken, VenueStatus::Disconnected);
                    return SessionEnd::UpdateFailed;
                }

                let ping = PingMessage {
                    method: PING,
                    req_id: ping_id,
                };
                let ping_message = match serde_json::to_string(&ping) {
                    Ok(message) => message,
                    Err(e) => {
                        counters.update += 1;
                        tracing::error!(error = %e, "failed to serialize Kraken ping");
                        return SessionEnd::UpdateFailed;
                    }
                };
                if let Err(e) = ws.send(Message::Text(ping_message)).await {
                    counters.connect += 1;
                    tracing::warn!(error = %e, "failed to ping Kraken");
                    watcher.set_status(Exchange::Kraken, VenueStatus::Disconnected);
                    return SessionEnd::Closed;
                }
                tracing::info!(req_id = ping_id, "sent ping to Kraken after idle window");
                awaiting_pong = Some(ping_id);
                ping_id += 1;
                continue;
            }
            RecvOutcome::Closed => {
                counters.connect += 1;
                tracing::warn!("Kraken ws connection closed");
                watcher.set_status(Exchange::Kraken, VenueStatus::Disconnected);
                return SessionEnd::Closed;
            }
        };

        let message = match serde_json::from_str::<WsMessage>(&text) {
            Ok(message) => message,
            Err(e) => {
                counters.update += 1;
                tracing::error!(
                    error = %e,
                    attempt = counters.update,
                    "failed to parse Kraken message"
                );
                watcher.set_status(Exchange::Kraken, VenueStatus::Disconnected);
                return SessionEnd::UpdateFailed;
            }
        };

        if message.method.as_deref() == Some(PONG) {
            if awaiting_pong.is_some() && message.req_id == awaiting_pong {
                tracing::info!(req_id = ?message.req_id, "received pong from Kraken");
                awaiting_pong = None;
            }
            continue;
        }

        if !subscribed {
            let ack_channel = message
                .result
                .as_ref()
                .and_then(|result| result.channel.as_deref());
            if ack_channel == Some(BOOK) && message.success == Some(true) {
                tracing::info!(symbol = venue_symbol, "subscribed to Kraken book");
                subscribed = true;
                counters.connect = 0;
            }
            continue;
        }

        if message.channel.as_deref() != Some(BOOK) {
            continue;
        }

        match message.kind.as_deref() {
            Some(SNAPSHOT_TYPE) => {
                let Some(data) = message.data.first() else {
                    continue;
                };
                let mut new_book = KrakenBook::new();
                if let Err(e) = apply_book_rows(&mut new_book, data) {
                    counters.update += 1;
                    tracing::error!(error = %e, "failed to apply Kraken snapshot");
                    watcher.set_status(Exchange::Kraken, VenueStatus::Disconnected);
                    return SessionEnd::UpdateFailed;
                }
                tracing::info!(checksum = ?data.checksum, "Kraken snapshot received");

                if watcher.get_status(Exchange::Kraken) == Some(VenueStatus::Disconnected) {
                    tracing::info!("Kraken reconnected after disconnect");
                }
                if !publish_book(watcher, &new_book, &mut last_published, true) {
                    watcher.set_status(Exchange::Kraken, VenueStatus::Disconnected);
                    if let Err(end) =
                        resync_from_rest(watcher, venue_symbol, &mut book, &mut last_published, counters)
                            .await
                    {
                        return end;
                    }
                    continue;
                }
                book = Some(new_book);
            }
            Some(UPDATE_TYPE) => {
                let mut resync_needed = false;
                {
                    let Some(active) = book.as_mut() else {
                        continue;
                    };
                    let Some(data) = message.data.first() else {
                        continue;
                    };
                    if let Err(e) = apply_book_rows(active, data) {
                        counters.update += 1;
                        tracing::error!(error = %e, "failed to apply Kraken update");
                        watcher.set_status(Exchange::Kraken, VenueStatus::Disconnected);
                        return SessionEnd::UpdateFailed;
                    }
                    active.truncate_depth(BOOK_DEPTH);

                    let checksum_ok = match data.checksum {
                        Some(expected) => {
                            let computed = active.checksum();
                            if computed != expected {
                                tracing::warn!(
                                    computed,
                                    expected,
                                    "Kraken checksum mismatch, refetching snapshot"
                                );
                            }
                            computed == expected
                        }
                        None => true,
                    };

                    if !checksum_ok {
                        resync_needed = true;
                    } else if publish_book(watcher, active, &mut last_published, false) {
                        counters.update = 0;
                    } else if active.is_crossed() {
                        tracing::warn!("Kraken book crossed, refetching snapshot");
                        resync_needed = true;
                    }
                }

                if resync_needed {
                    watcher.set_status(Exchange::Kraken, VenueStatus::Disconnected);
                    if let Err(end) = resync_from_rest(
                        watcher,
                        venue_symbol,
                        &mut book,
                        &mut last_published,
                        counters,
                    )
                    .await
                    {
                        return end;
                    }
                }
            }
            _ => {}
        }
    }
}

/// Publishes the book's best levels unless they are crossed or unchanged.
/// Returns false when nothing was published and the caller should check for
/// a cross.
fn publish_book(
    watcher: &LivePriceWatcher,
    book: &KrakenBook,
    last_published: &mut Option<(f64, f64)>,
    force: bool,
) -> bool {
    let Some((bid, ask)) = book.best_levels() else {
        return false;
    };
    if bid >= ask {
        return false;
    }
    if !force && *last_published == Some((bid, ask)) {
        return true;
    }

    watcher.update_price(Exchange::Kraken, bid, ask);
    *last_published = Some((bid, ask));
    tracing::debug!(bid, ask, "Kraken best levels updated");

    true
}

async fn resync_from_rest(
    watcher: &LivePriceWatcher,
    venue_symbol: &str,
    book: &mut Option<KrakenBook>,
    last_published: &mut Option<(f64, f64)>,
    counters: &mut RetryCounters,
) -> Result<(), SessionEnd> {
    let fresh = match fetch_depth_snapshot(venue_symbol).await {
        Ok(fresh) => fresh,
        Err(e) => {
            counters.snapshot += 1;
            tracing::error!(
                error = %e,
                attempt = counters.snapshot,
                "failed to fetch Kraken depth snapshot"
            );
            return Err(SessionEnd::SnapshotFailed);
        }
    };

    tracing::info!("Kraken order book reset from REST snapshot");
    if !publish_book(watcher, &fresh, last_published, true) {
        counters.snapshot += 1;
        tracing::error!("Kraken REST snapshot is unusable");
        return Err(SessionEnd::SnapshotFailed);
    }
    *book = Some(fresh);

    Ok(())
}

/// Order book replica that keeps the wire's decimal strings per level. The
/// checksum is CRC32 over the cleaned strings of the top 10 asks (price
/// ascending) followed by the top 10 bids (price descending).
#[derive(Debug, Default)]
pub(crate) struct KrakenBook {
    bids: BTreeMap<OrderedFloat<f64>, BookEntry>,
    asks: BTreeMap<OrderedFloat<f64>, BookEntry>,
}

#[derive(Debug, Clone)]
struct BookEntry {
    price_repr: String,
    qty_repr: String,
}

impl KrakenBook {
    pub fn new() -> Self {
        KrakenBook::default()
    }

    pub fn apply_bid(&mut self, price_repr: &str, qty_repr: &str) -> Result<(), KrakenError> {
        apply_entry(&mut self.bids, price_repr, qty_repr)
    }

    pub fn apply_ask(&mut self, price_repr: &str, qty_repr: &str) -> Result<(), KrakenError> {
        apply_entry(&mut self.asks, price_repr, qty_repr)
    }

    pub fn truncate_depth(&mut self, depth: usize) {
        while self.bids.len() > depth {
            self.bids.pop_first();
        }
        while self.asks.len() > depth {
            self.asks.pop_last();
        }
    }

    pub fn best_levels(&self) -> Option<(f64, f64)> {
        let bid = self.bids.keys().next_back()?;
        let ask = self.asks.keys().next()?;
        Some((bid.0, ask.0))
    }

    pub fn is_crossed(&self) -> bool {
        match self.best_levels() {
            Some((bid, ask)) => bid >= ask,
            None => false,
        }
    }

    pub fn checksum(&self) -> u32 {
        let mut input = String::new();
        for entry in self.asks.values().take(CHECKSUM_DEPTH) {
            input.push_str(&clean_decimal(&entry.price_repr));
            input.push_str(&clean_decimal(&entry.qty_repr));
        }
        for entry in self.bids.values().rev().take(CHECKSUM_DEPTH) {
            input.push_str(&clean_decimal(&entry.price_repr));
            input.push_str(&clean_decimal(&entry.qty_repr));
        }

        crc32fast::hash(input.as_bytes())
    }
}

fn apply_entry(
    side: &mut BTreeMap<OrderedFloat<f64>, BookEntry>,
    price_repr: &str,
    qty_repr: &str,
) -> Result<(), KrakenError> {
    let price = price_repr
        .parse::<f64>()
        .map_err(|_| KrakenError::InvalidLevel(price_repr.to_owned()))?;
    let qty = qty_repr
        .parse::<f64>()
        .map_err(|_| KrakenError::InvalidLevel(qty_repr.to_owned()))?;

    if qty == 0.0 {
        side.remove(&OrderedFloat(price));
    } else {
        side.insert(
            OrderedFloat(price),
            BookEntry {
                price_repr: price_repr.to_owned(),
                qty_repr: qty_repr.to_owned(),
            },
        );
    }

    Ok(())
}

/// Strips the decimal point and leading zeros, the form Kraken feeds into
/// its CRC32.
fn clean_decimal(value: &str) -> String {
    let digits: String = value.chars().filter(|c| *c != '.').collect();
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_owned()
    } else {
        trimmed.to_owned()
    }
}

fn apply_book_rows(book: &mut KrakenBook, data: &BookData) -> Result<(), KrakenError> {
    for level in &data.bids {
        book.apply_bid(raw_decimal(&level.price), raw_decimal(&level.qty))?;
    }
    for level in &data.asks {
        book.apply_ask(raw_decimal(&level.price), raw_decimal(&level.qty))?;
    }

    Ok(())
}

/// The raw JSON text of a price or qty, with quotes stripped should the
/// venue ever send them as strings.
fn raw_decimal(value: &RawValue) -> &str {
    value.get().trim_matches('"')
}

async fn fetch_depth_snapshot(venue_symbol: &str) -> Result<KrakenBook, KrakenError> {
    let pair = venue_symbol.replace('/', "");
    let endpoint = format!("{REST_DEPTH_ENDPOINT}?pair={pair}&count={BOOK_DEPTH}");

    let response = reqwest::get(endpoint)
        .await?
        .json::<RestDepthResponse>()
        .await?;

    if !response.error.is_empty() {
        return Err(KrakenError::RestError(response.error.join(", ")));
    }
    let rest_book = response
        .result
        .and_then(|result| result.into_values().next())
        .ok_or_else(|| KrakenError::RestError("empty Depth result".to_owned()))?;

    let mut book = KrakenBook::new();
    for (price, qty, _timestamp) in &rest_book.bids {
        book.apply_bid(price, qty)?;
    }
    for (price, qty, _timestamp) in &rest_book.asks {
        book.apply_ask(price, qty)?;
    }

    Ok(book)
}

#[derive(Serialize, Debug)]
pub struct PingMessage {
    method: &'static str,
    req_id: u64,
}

#[derive(Serialize, Debug)]
pub struct SubscribeMessage {
    method: String,
    params: Subscription,
}

#[derive(Serialize, Debug)]
pub struct Subscription {
    channel: String,
    symbol: Vec<String>,
    depth: usize,
    snapshot: bool,
}

impl SubscribeMessage {
    pub fn new(symbol: &str, depth: usize) -> Self {
        SubscribeMessage {
            method: SUBSCRIBE.to_string(),
            params: Subscription {
                channel: BOOK.to_string(),
                symbol: vec![symbol.to_owned()],
                depth,
                snapshot: true,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsMessage {
    pub method: Option<String>,
    pub req_id: Option<u64>,
    pub success: Option<bool>,
    pub result: Option<SubscribeResult>,
    pub channel: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: Vec<BookData>,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeResult {
    pub channel: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BookData {
    pub symbol: Option<String>,
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    #[serde(default)]
    pub asks: Vec<BookLevel>,
    pub checksum: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct BookLevel {
    pub price: Box<RawValue>,
    pub qty: Box<RawValue>,
}

#[derive(Debug, Deserialize)]
struct RestDepthResponse {
    #[serde(default)]
    error: Vec<String>,
    result: Option<HashMap<String, RestDepthBook>>,
}

#[derive(Debug, Deserialize)]
struct RestDepthBook {
    bids: Vec<(String, String, serde_json::Value)>,
    asks: Vec<(String, String, serde_json::Value)>,
}

#[cfg(test)]
mod tests {
    use super::{apply_book_rows, clean_decimal, KrakenBook, WsMessage};

    // Snapshot captured from the live v2 book channel together with the
    // checksum Kraken published for it.
    const SNAPSHOT_FIXTURE: &str = r#"{
        "channel": "book",
        "type": "snapshot",
        "data": [{
            "symbol": "BTC/USD",
            "bids": [
                {"price": "45283.5", "qty": "0.10000000"},
                {"price": "45283.4", "qty": "1.54582015"},
                {"price": "45282.1", "qty": "0.10000000"},
                {"price": "45281.0", "qty": "0.10000000"},
                {"price": "45280.3", "qty": "1.54592586"},
                {"price": "45279.0", "qty": "0.07990000"},
                {"price": "45277.6", "qty": "0.03310103"},
                {"price": "45277.5", "qty": "0.30000000"},
                {"price": "45277.3", "qty": "1.54602737"},
                {"price": "45276.6", "qty": "0.15445238"}
            ],
            "asks": [
                {"price": "45285.2", "qty": "0.00100000"},
                {"price": "45286.4", "qty": "1.54571953"},
                {"price": "45286.6", "qty": "1.54571109"},
                {"price": "45289.6", "qty": "1.54560911"},
                {"price": "45290.2", "qty": "0.15890660"},
                {"price": "45291.8", "qty": "1.54553491"},
                {"price": "45294.7", "qty": "0.04454749"},
                {"price": "45296.1", "qty": "0.35380000"},
                {"price": "45297.5", "qty": "0.09945542"},
                {"price": "45299.5", "qty": "0.18772827"}
            ],
            "checksum": 3310070434
        }]
    }"#;

    fn book_from_fixture(fixture: &str) -> (KrakenBook, u32) {
        let message: WsMessage = serde_json::from_str(fixture).expect("fixture should parse");
        let data = &message.data[0];
        let mut book = KrakenBook::new();
        apply_book_rows(&mut book, data).expect("rows should apply");
        (book, data.checksum.expect("fixture carries a checksum"))
    }

    #[test]
    fn test_clean_decimal() {
        assert_eq!(clean_decimal("45283.5"), "452835");
        assert_eq!(clean_decimal("0.10000000"), "10000000");
        assert_eq!(clean_decimal("0.00100000"), "100000");
        assert_eq!(clean_decimal("0.0"), "0");
    }

    #[test]
    fn test_checksum_matches_published_value() {
        let (book, expected) = book_from_fixture(SNAPSHOT_FIXTURE);
        assert_eq!(book.checksum(), expected);
    }

    #[test]
    fn test_checksum_detects_divergence() {
        let (mut book, expected) = book_from_fixture(SNAPSHOT_FIXTURE);
        book.apply_bid("45283.5", "0.20000000").unwrap();
        assert_ne!(book.checksum(), expected);
    }

    #[test]
    fn test_best_levels_and_zero_qty_removal() {
        let (mut book, _) = book_from_fixture(SNAPSHOT_FIXTURE);
        assert_eq!(book.best_levels(), Some((45283.5, 45285.2)));

        book.apply_bid("45283.5", "0.00000000").unwrap();
        book.apply_ask("45285.2", "0").unwrap();
        assert_eq!(book.best_levels(), Some((45283.4, 45286.4)));
    }

    #[test]
    fn test_truncate_keeps_top_of_book() {
        let mut book = KrakenBook::new();
        for i in 0..30 {
            book.apply_bid(&format!("{}", 1000 - i), "1.0").unwrap();
            book.apply_ask(&format!("{}", 2000 + i), "1.0").unwrap();
        }

        book.truncate_depth(25);
        assert_eq!(book.best_levels(), Some((1000.0, 2000.0)));
    }

    #[test]
    fn test_update_frame_parses() {
        let message: WsMessage = serde_json::from_str(
            r#"{
                "channel": "book",
                "type": "update",
                "data": [{
                    "symbol": "BTC/USDT",
                    "bids": [{"price": 105906.7, "qty": 0.0}],
                    "asks": [],
                    "checksum": 4162058887,
                    "timestamp": "2025-06-09T14:00:00.000000Z"
                }]
            }"#,
        )
        .expect("update frame should parse");

        assert_eq!(message.kind.as_deref(), Some("update"));
        let data = &message.data[0];
        assert_eq!(data.checksum, Some(4162058887));
        assert_eq!(super::raw_decimal(&data.bids[0].price), "105906.7");
        assert_eq!(super::raw_decimal(&data.bids[0].qty), "0.0");
    }
}
