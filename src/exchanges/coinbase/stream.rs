use std::sync::Arc;

use futures::SinkExt;
use serde_derive::{Deserialize, Serialize};
use tungstenite::Message;

use crate::config::Settings;
use crate::exchanges::coinbase::error::CoinbaseError;
use crate::exchanges::{
    publish_best_levels, recv_text, Exchange, RecvOutcome, RetryCounters, SessionEnd, WsStream,
    EXTERNAL_DISCONNECT_BACKOFF, RECONNECT_BACKOFF,
};
use crate::order_book::{LocalOrderBook, Side};
use crate::watcher::{LivePriceWatcher, VenueStatus};

const WS_ENDPOINT: &str = "wss://advanced-trade-ws.coinbase.com";
const SUBSCRIBE: &str = "subscribe";
const LEVEL2_CHANNEL: &str = "level2";
const HEARTBEATS_CHANNEL: &str = "heartbeats";
const L2_DATA_CHANNEL: &str = "l2_data";
const SUBSCRIPTIONS_CHANNEL: &str = "subscriptions";
const SNAPSHOT_EVENT: &str = "snapshot";
const UPDATE_EVENT: &str = "update";
const BID_SIDE: &str = "bid";
const ASK_SIDE: &str = "ask";
const OFFER_SIDE: &str = "offer";

// Advanced Trade delivers the snapshot in-band and numbers every message of
// the connection with a single sequence_num shared across channels. Any hole
// in that numbering invalidates the whole connection, there is nothing to
// replay against, so the client throws its state away and subscribes again.

pub(crate) async fn run_order_book_stream(
    watcher: Arc<LivePriceWatcher>,
    settings: Arc<Settings>,
) -> Result<(), CoinbaseError> {
    let venue_symbol = Exchange::Coinbase.venue_symbol(&settings.symbol);

    let mut counters = RetryCounters::new();

    while !counters.exhausted(settings.max_ws_reconnects) {
        let mut ws = match tokio_tungstenite::connect_async(WS_ENDPOINT).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                counters.connect += 1;
                tracing::warn!(
                    error = %e,
                    attempt = counters.connect,
                    "failed to connect to Coinbase ws"
                );
                watcher.set_status(Exchange::Coinbase, VenueStatus::Disconnected);
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };
        tracing::info!("Coinbase ws connection established");

        let end = run_session(&watcher, &mut ws, &venue_symbol, &settings, &mut counters).await;
        let _ = ws.close(None).await;

        match end {
            SessionEnd::ExternalDisconnect => {
                tracing::warn!("Coinbase marked disconnected externally, throttling reconnect");
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
        "max reconnect attempts reached, stopping Coinbase order book listener"
    );
    watcher.set_status(Exchange::Coinbase, VenueStatus::Stopped);

    Ok(())
}

async fn run_session(
    watcher: &LivePriceWatcher,
    ws: &mut WsStream,
    venue_symbol: &str,
    settings: &Settings,
    counters: &mut RetryCounters,
) -> SessionEnd {
    for message in subscribe_messages(venue_symbol) {
        if let Err(e) = ws.send(Message::Text(message)).await {
            counters.connect += 1;
            tracing::warn!(error = %e, "failed to subscribe to Coinbase channels");
            watcher.set_status(Exchange::Coinbase, VenueStatus::Disconnected);
            return SessionEnd::Closed;
        }
    }

    let mut state = L2State::new();
    let mut last_published = None;

    loop {
        if state.book.is_some()
            && watcher.get_status(Exchange::Coinbase) == Some(VenueStatus::Disconnected)
        {
            return SessionEnd::ExternalDisconnect;
        }

        let text = match recv_text(ws, settings.stale_time).await {
            RecvOutcome::Text(text) => text,
            RecvOutcome::Timeout => {
                tracing::warn!(
                    stale_time = settings.stale_time.as_secs(),
                    "no Coinbase frame within the stale window"
                );
                watcher.set_status(Exchange::Coinbase, VenueStatus::Disconnected);
                return SessionEnd::Stale;
            }
            RecvOutcome::Closed => {
                counters.connect += 1;
                tracing::warn!("Coinbase ws connection closed");
                watcher.set_status(Exchange::Coinbase, VenueStatus::Disconnected);
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
                    "failed to parse Coinbase message"
                );
                watcher.set_status(Exchange::Coinbase, VenueStatus::Disconnected);
                return SessionEnd::UpdateFailed;
            }
        };

        match handle_message(&mut state, &message) {
            Ok(L2Outcome::Ignored) => {}
            Ok(L2Outcome::Subscribed) => {
                tracing::info!("Coinbase subscription confirmed");
                counters.connect = 0;
            }
            Ok(L2Outcome::SequenceBreak { expected, got }) => {
                tracing::error!(
                    expected,
                    got,
                    "Coinbase sequence mismatch, discarding state and reconnecting"
                );
                // The stale quote must not survive into the next connection.
                watcher.remove_venue(Exchange::Coinbase);
                return SessionEnd::Resync;
            }
            Ok(L2Outcome::BookChanged { snapshot }) => {
                let Some(book) = &state.book else {
                    continue;
                };
                if snapshot {
                    tracing::info!("Coinbase snapshot applied");
                    if watcher.get_status(Exchange::Coinbase) == Some(VenueStatus::Disconnected) {
                        tracing::info!("Coinbase reconnected after disconnect");
                    }
                }
                match publish_best_levels(
                    watcher,
                    Exchange::Coinbase,
                    book,
                    &mut last_published,
                    snapshot,
                ) {
                    Ok(_) => {
                        counters.update = 0;
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "Coinbase book desynced, reconnecting for a fresh snapshot"
                        );
                        watcher.set_status(Exchange::Coinbase, VenueStatus::Disconnected);
                        return SessionEnd::Resync;
                    }
                }
            }
            Err(e) => {
                counters.update += 1;
                tracing::error!(
                    error = %e,
                    attempt = counters.update,
                    "failed to process Coinbase message"
                );
                watcher.set_status(Exchange::Coinbase, VenueStatus::Disconnected);
                return SessionEnd::UpdateFailed;
            }
        }
    }
}

fn subscribe_messages(venue_symbol: &str) -> Vec<String> {
    let level2 = SubscribeMessage {
        kind: SUBSCRIBE,
        product_ids: Some(vec![venue_symbol.to_owned()]),
        channel: LEVEL2_CHANNEL,
    };
    let heartbeats = SubscribeMessage {
        kind: SUBSCRIBE,
        product_ids: None,
        channel: HEARTBEATS_CHANNEL,
    };

    [level2, heartbeats]
        .iter()
        .filter_map(|message| serde_json::to_string(message).ok())
        .collect()
}

struct L2State {
    book: Option<LocalOrderBook>,
    expected_sequence: u64,
}

enum L2Outcome {
    Ignored,
    Subscribed,
    SequenceBreak { expected: u64, got: u64 },
    BookChanged { snapshot: bool },
}

impl L2State {
    fn new() -> Self {
        L2State {
            book: None,
            expected_sequence: 0,
        }
    }
}

/// Applies one ws message to the connection state. The caller turns the
/// outcome into watcher effects.
fn handle_message(state: &mut L2State, message: &WsMessage) -> Result<L2Outcome, CoinbaseError> {
    let Some(sequence_num) = message.sequence_num else {
        tracing::warn!("Coinbase message without sequence_num, skipping");
        return Ok(L2Outcome::Ignored);
    };

    if sequence_num != state.expected_sequence {
        return Ok(L2Outcome::SequenceBreak {
            expected: state.expected_sequence,
            got: sequence_num,
        });
    }
    state.expected_sequence += 1;

    match message.channel.as_deref() {
        Some(HEARTBEATS_CHANNEL) => Ok(L2Outcome::Ignored),
        Some(SUBSCRIPTIONS_CHANNEL) => Ok(L2Outcome::Subscribed),
        Some(L2_DATA_CHANNEL) => {
            let mut saw_snapshot = false;
            let mut changed = false;

            for event in &message.events {
                match event.kind.as_deref() {
                    Some(SNAPSHOT_EVENT) => {
                        let mut book = LocalOrderBook::new();
                        apply_l2_rows(&mut book, &event.updates)?;
                        state.book = Some(book);
                        saw_snapshot = true;
                        changed = true;
                    }
                    Some(UPDATE_EVENT) => {
                        let book = state
                            .book
                            .as_mut()
                            .ok_or(CoinbaseError::UpdateBeforeSnapshot)?;
                        apply_l2_rows(book, &event.updates)?;
                        changed = true;
                    }
                    _ => {}
                }
            }

            if changed {
                Ok(L2Outcome::BookChanged {
                    snapshot: saw_snapshot,
                })
            } else {
                Ok(L2Outcome::Ignored)
            }
        }
        other => {
            tracing::debug!(channel = ?other, "skipping unexpected Coinbase channel");
            Ok(L2Outcome::Ignored)
        }
    }
}

fn apply_l2_rows(book: &mut LocalOrderBook, rows: &[L2Update]) -> Result<(), CoinbaseError> {
    for row in rows {
        let side = match row.side.as_str() {
            BID_SIDE => Side::Bid,
            ASK_SIDE | OFFER_SIDE => Side::Ask,
            other => return Err(CoinbaseError::InvalidLevel(other.to_owned())),
        };
        let price = row
            .price_level
            .parse::<f64>()
            .map_err(|_| CoinbaseError::InvalidLevel(row.price_level.clone()))?;
        let size = row
            .new_quantity
            .parse::<f64>()
            .map_err(|_| CoinbaseError::InvalidLevel(row.new_quantity.clone()))?;

        book.apply_level(side, price, size);
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    product_ids: Option<Vec<String>>,
    channel: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct WsMessage {
    pub channel: Option<String>,
    pub sequence_num: Option<u64>,
    #[serde(default)]
    pub events: Vec<L2Event>,
}

#[derive(Debug, Deserialize)]
pub struct L2Event {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub updates: Vec<L2Update>,
}

#[derive(Debug, Deserialize)]
pub struct L2Update {
    pub side: String,
    pub price_level: String,
    pub new_quantity: String,
}
