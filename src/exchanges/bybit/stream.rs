use std::sync::Arc;

use futures::SinkExt;
use serde_derive::{Deserialize, Serialize};
use tungstenite::Message;

use crate::config::Settings;
use crate::exchanges::bybit::error::BybitError;
use crate::exchanges::{
    exchange_utils, publish_best_levels, recv_text, Exchange, RecvOutcome, RetryCounters,
    SessionEnd, WsStream, EXTERNAL_DISCONNECT_BACKOFF, RECONNECT_BACKOFF,
};
use crate::order_book::{LocalOrderBook, Side};
use crate::watcher::{LivePriceWatcher, VenueStatus};

const WS_ENDPOINT: &str = "wss://stream.bybit.com/v5/public/spot";
const SUBSCRIBE_OP: &str = "subscribe";
const ORDER_BOOK_TOPIC_PREFIX: &str = "orderbook.50.";
const SNAPSHOT_TYPE: &str = "snapshot";
const DELTA_TYPE: &str = "delta";

// The v5 book stream is fully in-band. After the subscription ack the first
// type=snapshot seeds the book at cursor `u`, deltas advance it, and a later
// snapshot (or u == 1) means the server reset the stream and the book must be
// replaced wholesale.

pub(crate) async fn run_order_book_stream(
    watcher: Arc<LivePriceWatcher>,
    settings: Arc<Settings>,
) -> Result<(), BybitError> {
    let venue_symbol = Exchange::Bybit.venue_symbol(&settings.symbol);
    let topic = format!("{ORDER_BOOK_TOPIC_PREFIX}{}", venue_symbol.to_uppercase());

    let mut counters = RetryCounters::new();

    while !counters.exhausted(settings.max_ws_reconnects) {
        let mut ws = match tokio_tungstenite::connect_async(WS_ENDPOINT).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                counters.connect += 1;
                tracing::warn!(
                    error = %e,
                    attempt = counters.connect,
                    "failed to connect to Bybit ws"
                );
                watcher.set_status(Exchange::Bybit, VenueStatus::Disconnected);
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };
        tracing::info!("Bybit ws connection established");

        let end = run_session(&watcher, &mut ws, &topic, &settings, &mut counters).await;
        let _ = ws.close(None).await;

        match end {
            SessionEnd::ExternalDisconnect => {
                tracing::warn!("Bybit marked disconnected externally, throttling reconnect");
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
        "max reconnect attempts reached, stopping Bybit order book listener"
    );
    watcher.set_status(Exchange::Bybit, VenueStatus::Stopped);

    Ok(())
}

async fn run_session(
    watcher: &LivePriceWatcher,
    ws: &mut WsStream,
    topic: &str,
    settings: &Settings,
    counters: &mut RetryCounters,
) -> SessionEnd {
    let subscribe = SubscribeMessage {
        op: SUBSCRIBE_OP,
        args: vec![topic.to_owned()],
    };
    let subscribe_message = match serde_json::to_string(&subscribe) {
        Ok(message) => message,
        Err(e) => {
            counters.update += 1;
            tracing::error!(error = %e, "failed to serialize Bybit subscription");
            return SessionEnd::UpdateFailed;
        }
    };
    if let Err(e) = ws.send(Message::Text(subscribe_message)).await {
        counters.connect += 1;
        tracing::warn!(error = %e, "failed to subscribe to Bybit order book");
        watcher.set_status(Exchange::Bybit, VenueStatus::Disconnected);
        return SessionEnd::Closed;
    }

    let mut state = BybitState::new();
    let mut last_published = None;

    loop {
        if state.book.is_some()
            && watcher.get_status(Exchange::Bybit) == Some(VenueStatus::Disconnected)
        {
            return SessionEnd::ExternalDisconnect;
        }

        let text = match recv_text(ws, settings.stale_time).await {
            RecvOutcome::Text(text) => text,
            RecvOutcome::Timeout => {
                tracing::warn!(
                    stale_time = settings.stale_time.as_secs(),
                    "no Bybit order book update within the stale window"
                );
                watcher.set_status(Exchange::Bybit, VenueStatus::Disconnected);
                return SessionEnd::Stale;
            }
            RecvOutcome::Closed => {
                counters.connect += 1;
                tracing::warn!("Bybit ws connection closed");
                watcher.set_status(Exchange::Bybit, VenueStatus::Disconnected);
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
                    "failed to parse Bybit message"
                );
                watcher.set_status(Exchange::Bybit, VenueStatus::Disconnected);
                return SessionEnd::UpdateFailed;
            }
        };

        match handle_message(&mut state, &message, topic) {
            BybitOutcome::Ignored => {}
            BybitOutcome::Subscribed => {
                tracing::info!("Bybit subscription confirmed");
                counters.connect = 0;
            }
            BybitOutcome::SubscriptionRejected(reason) => {
                counters.update += 1;
                tracing::error!(reason, "Bybit subscription rejected");
                watcher.set_status(Exchange::Bybit, VenueStatus::Disconnected);
                return SessionEnd::UpdateFailed;
            }
            BybitOutcome::SnapshotApplied { initial } => {
                let Some(book) = &state.book else {
                    continue;
                };
                if initial {
                    tracing::info!(last_seq = book.last_seq, "first Bybit snapshot received");
                    if watcher.get_status(Exchange::Bybit) == Some(VenueStatus::Disconnected) {
                        tracing::info!("Bybit reconnected after disconnect");
                    }
                    match publish_best_levels(
                        watcher,
                        Exchange::Bybit,
                        book,
                        &mut last_published,
                        true,
                    ) {
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "Bybit snapshot is crossed, reconnecting");
                            watcher.set_status(Exchange::Bybit, VenueStatus::Disconnected);
                            return SessionEnd::Resync;
                        }
                    }
                } else {
                    // A mid-stream reset replaces the book but publishes
                    // nothing until a delta moves the best levels.
                    tracing::info!(last_seq = book.last_seq, "Bybit snapshot reset received");
                }
            }
            BybitOutcome::DeltaApplied => {
                let Some(book) = &state.book else {
                    continue;
                };
                match publish_best_levels(watcher, Exchange::Bybit, book, &mut last_published, false)
                {
                    Ok(published) => {
                        if published {
                            counters.update = 0;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "Bybit book desynced, reconnecting for a fresh snapshot"
                        );
                        watcher.set_status(Exchange::Bybit, VenueStatus::Disconnected);
                        return SessionEnd::Resync;
                    }
                }
            }
        }
    }
}

struct BybitState {
    book: Option<LocalOrderBook>,
    subscribed: bool,
}

enum BybitOutcome {
    Ignored,
    Subscribed,
    SubscriptionRejected(String),
    SnapshotApplied { initial: bool },
    DeltaApplied,
}

impl BybitState {
    fn new() -> Self {
        BybitState {
            book: None,
            subscribed: false,
        }
    }
}

fn handle_message(state: &mut BybitState, message: &WsMessage, topic: &str) -> BybitOutcome {
    // Op acks carry no topic.
    if message.topic.is_none() {
        if !state.subscribed {
            return match message.success {
                Some(true) => {
                    state.subscribed = true;
                    BybitOutcome::Subscribed
                }
                Some(false) => BybitOutcome::SubscriptionRejected(
                    message.ret_msg.clone().unwrap_or_default(),
                ),
                None => BybitOutcome::Ignored,
            };
        }
        return BybitOutcome::Ignored;
    }

    if message.topic.as_deref() != Some(topic) {
        return BybitOutcome::Ignored;
    }
    let Some(data) = &message.data else {
        return BybitOutcome::Ignored;
    };

    match &mut state.book {
        None => {
            // Nothing to apply deltas to until the first snapshot arrives.
            if message.kind.as_deref() == Some(SNAPSHOT_TYPE) {
                let mut book = LocalOrderBook::new();
                book.reset(&data.bids, &data.asks, Some(data.update_id));
                state.book = Some(book);
                return BybitOutcome::SnapshotApplied { initial: true };
            }
            BybitOutcome::Ignored
        }
        Some(book) => {
            // A second snapshot or a cursor restart is a server-side reset.
            if message.kind.as_deref() == Some(SNAPSHOT_TYPE) || data.update_id == 1 {
                book.reset(&data.bids, &data.asks, Some(data.update_id));
                return BybitOutcome::SnapshotApplied { initial: false };
            }
            if data.update_id <= book.last_seq.unwrap_or(0) {
                return BybitOutcome::Ignored;
            }
            if message.kind.as_deref() == Some(DELTA_TYPE) {
                book.apply_levels(Side::Bid, &data.bids);
                book.apply_levels(Side::Ask, &data.asks);
                book.last_seq = Some(data.update_id);
                return BybitOutcome::DeltaApplied;
            }
            BybitOutcome::Ignored
        }
    }
}

#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    op: &'a str,
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct WsMessage {
    pub success: Option<bool>,
    pub ret_msg: Option<String>,
    pub topic: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub data: Option<OrderBookData>,
}

#[derive(Debug, Deserialize)]
pub struct OrderBookData {
    #[serde(
        rename = "b",
        deserialize_with = "exchange_utils::convert_array_len_2_to_f64",
        default
    )]
    pub bids: Vec<[f64; 2]>,
    #[serde(
        rename = "a",
        deserialize_with = "exchange_utils::convert_array_len_2_to_f64",
        default
    )]
    pub asks: Vec<[f64; 2]>,
    #[serde(rename = "u")]
    pub update_id: u64,
}

#[cfg(test)]
mod tests {
    use super::{handle_message, BybitOutcome, BybitState, WsMessage};

    const TOPIC: &str = "orderbook.50.BTCUSDT";

    fn parse(message: &str) -> WsMessage {
        serde_json::from_str(message).expect("fixture should parse")
    }

    fn subscribed_state_with_book() -> BybitState {
        let mut state = BybitState::new();
        handle_message(
            &mut state,
            &parse(r#"{"success": true, "op": "subscribe"}"#),
            TOPIC,
        );
        handle_message(
            &mut state,
            &parse(
                r#"{
                    "topic": "orderbook.50.BTCUSDT",
                    "type": "snapshot",
                    "data": {"b": [["100.0", "1"]], "a": [["100.5", "1"]], "u": 10}
                }"#,
            ),
            TOPIC,
        );
        state
    }

    #[test]
    fn test_first_snapshot_initializes_book() {
        let state = subscribed_state_with_book();
        let book = state.book.expect("snapshot should build the book");
        assert_eq!(book.last_seq, Some(10));
        assert_eq!(book.best_levels(), Some((100.0, 100.5)));
    }

    #[test]
    fn test_subscription_reject_is_reported() {
        let mut state = BybitState::new();
        let outcome = handle_message(
            &mut state,
            &parse(r#"{"success": false, "ret_msg": "bad topic"}"#),
            TOPIC,
        );
        assert!(matches!(outcome, BybitOutcome::SubscriptionRejected(reason) if reason == "bad topic"));
    }

    #[test]
    fn test_mid_stream_snapshot_resets_book() {
        let mut state = subscribed_state_with_book();

        let outcome = handle_message(
            &mut state,
            &parse(
                r#"{
                    "topic": "orderbook.50.BTCUSDT",
                    "type": "snapshot",
                    "data": {"b": [["200.0", "1"]], "a": [["200.5", "1"]], "u": 12345}
                }"#,
            ),
            TOPIC,
        );

        assert!(matches!(
            outcome,
            BybitOutcome::SnapshotApplied { initial: false }
        ));
        let book = state.book.expect("book should survive the reset");
        assert_eq!(book.last_seq, Some(12345));
        assert_eq!(book.best_levels(), Some((200.0, 200.5)));
    }

    #[test]
    fn test_old_delta_is_dropped() {
        let mut state = subscribed_state_with_book();

        let outcome = handle_message(
            &mut state,
            &parse(
                r#"{
                    "topic": "orderbook.50.BTCUSDT",
                    "type": "delta",
                    "data": {"b": [["99.0", "1"]], "a": [], "u": 10}
                }"#,
            ),
            TOPIC,
        );

        assert!(matches!(outcome, BybitOutcome::Ignored));
        assert_eq!(state.book.unwrap().last_seq, Some(10));
    }

    #[test]
    fn test_delta_applies_and_advances_cursor() {
        let mut state = subscribed_state_with_book();

        let outcome = handle_message(
            &mut state,
            &parse(
                r#"{
                    "topic": "orderbook.50.BTCUSDT",
                    "type": "delta",
                    "data": {"b": [["100.2", "1"]], "a": [["100.5", "0"]], "u": 11}
                }"#,
            ),
            TOPIC,
        );

        assert!(matches!(outcome, BybitOutcome::DeltaApplied));
        let book = state.book.unwrap();
        assert_eq!(book.last_seq, Some(11));
        assert_eq!(book.best_bid(), Some(100.2));
        assert_eq!(book.best_ask(), None);
    }
}
