use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use serde_derive::{Deserialize, Serialize};
use tungstenite::Message;

use crate::config::Settings;
use crate::exchanges::kucoin::error::KucoinError;
use crate::exchanges::kucoin::sign::KcSigner;
use crate::exchanges::{
    exchange_utils, publish_best_levels, recv_text, DeltaOutcome, Exchange, RecvOutcome,
    RetryCounters, SessionEnd, WsStream, EXTERNAL_DISCONNECT_BACKOFF, RECONNECT_BACKOFF,
};
use crate::order_book::{LocalOrderBook, Side};
use crate::watcher::{LivePriceWatcher, VenueStatus};

const REST_BASE_ENDPOINT: &str = "https://api.kucoin.com";
const BULLET_PUBLIC_PATH: &str = "/api/v1/bullet-public";
const LEVEL2_SNAPSHOT_PATH: &str = "/api/v3/market/orderbook/level2";
const WS_BASE_ENDPOINT: &str = "wss://ws-api-spot.kucoin.com";
const LEVEL2_TOPIC_PREFIX: &str = "/market/level2:";
const SUBSCRIBE_TYPE: &str = "subscribe";
const WELCOME_TYPE: &str = "welcome";
const ACK_TYPE: &str = "ack";
const MESSAGE_TYPE: &str = "message";
//Grace period for the stream to get ahead of the snapshot sequence
const BUFFER_WINDOW: Duration = Duration::from_secs(1);

// KuCoin mirrors the Binance recipe with two twists. The ws endpoint is only
// reachable with a short lived token from the bullet-public endpoint, and
// the level2 REST snapshot requires signed headers even though the book data
// itself is public. Deltas carry a sequenceStart/sequenceEnd range instead
// of a single cursor pair.

pub(crate) async fn run_order_book_stream(
    watcher: Arc<LivePriceWatcher>,
    settings: Arc<Settings>,
) -> Result<(), KucoinError> {
    let Some(credentials) = settings.kucoin.as_ref() else {
        return Err(KucoinError::MissingCredentials);
    };
    let signer = KcSigner::new(credentials);
    let client = reqwest::Client::new();
    let venue_symbol = Exchange::Kucoin.venue_symbol(&settings.symbol);
    let topic = format!("{LEVEL2_TOPIC_PREFIX}{venue_symbol}");

    let mut counters = RetryCounters::new();

    while !counters.exhausted(settings.max_ws_reconnects) {
        let token = match get_public_token(&client).await {
            Ok(token) => token,
            Err(e) => {
                counters.connect += 1;
                tracing::warn!(
                    error = %e,
                    attempt = counters.connect,
                    "failed to fetch KuCoin ws token"
                );
                watcher.set_status(Exchange::Kucoin, VenueStatus::Disconnected);
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };

        let connect_id = format!("{:08x}", rand::random::<u32>());
        let endpoint = format!("{WS_BASE_ENDPOINT}?token={token}&connectId={connect_id}");

        let mut ws = match tokio_tungstenite::connect_async(endpoint.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                counters.connect += 1;
                tracing::warn!(
                    error = %e,
                    attempt = counters.connect,
                    "failed to connect to KuCoin ws"
                );
                watcher.set_status(Exchange::Kucoin, VenueStatus::Disconnected);
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };
        tracing::info!("KuCoin ws connection established");

        let end = run_session(
            &watcher,
            &mut ws,
            &client,
            &signer,
            &connect_id,
            &topic,
            &venue_symbol,
            &settings,
            &mut counters,
        )
        .await;
        let _ = ws.close(None).await;

        match end {
            SessionEnd::ExternalDisconnect => {
                tracing::warn!("KuCoin marked disconnected externally, throttling reconnect");
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
        "max reconnect attempts reached, stopping KuCoin order book listener"
    );
    watcher.set_status(Exchange::Kucoin, VenueStatus::Stopped);

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    watcher: &LivePriceWatcher,
    ws: &mut WsStream,
    client: &reqwest::Client,
    signer: &KcSigner,
    connect_id: &str,
    topic: &str,
    venue_symbol: &str,
    settings: &Settings,
    counters: &mut RetryCounters,
) -> SessionEnd {
    let subscribe = SubscribeMessage {
        id: connect_id,
        kind: SUBSCRIBE_TYPE,
        topic,
        private_channel: false,
        response: true,
    };
    let subscribe_message = match serde_json::to_string(&subscribe) {
        Ok(message) => message,
        Err(e) => {
            counters.update += 1;
            tracing::error!(error = %e, "failed to serialize KuCoin subscription");
            return SessionEnd::UpdateFailed;
        }
    };
    if let Err(e) = ws.send(Message::Text(subscribe_message)).await {
        counters.connect += 1;
        tracing::warn!(error = %e, "failed to subscribe to KuCoin level2");
        watcher.set_status(Exchange::Kucoin, VenueStatus::Disconnected);
        return SessionEnd::Closed;
    }

    let mut book = LocalOrderBook::new();
    let mut last_published = None;
    let mut buffer: Vec<Level2Change> = vec![];

    // Let deltas accumulate so the snapshot's sequence lands inside the
    // buffered range.
    let deadline = tokio::time::Instant::now() + BUFFER_WINDOW;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match recv_text(ws, remaining).await {
            RecvOutcome::Text(text) => buffer_change(&text, topic, &mut buffer),
            RecvOutcome::Timeout => break,
            RecvOutcome::Closed => {
                counters.connect += 1;
                tracing::warn!("KuCoin ws connection closed while buffering");
                watcher.set_status(Exchange::Kucoin, VenueStatus::Disconnected);
                return SessionEnd::Closed;
            }
        }
    }

    // Keep buffering while the signed snapshot request is in flight.
    let fetch = fetch_level2_snapshot(client, signer, venue_symbol);
    tokio::pin!(fetch);
    let snapshot = loop {
        tokio::select! {
            result = &mut fetch => break result,
            outcome = recv_text(ws, settings.stale_time) => match outcome {
                RecvOutcome::Text(text) => buffer_change(&text, topic, &mut buffer),
                RecvOutcome::Timeout => {
                    watcher.set_status(Exchange::Kucoin, VenueStatus::Disconnected);
                    return SessionEnd::Stale;
                }
                RecvOutcome::Closed => {
                    counters.connect += 1;
                    watcher.set_status(Exchange::Kucoin, VenueStatus::Disconnected);
                    return SessionEnd::Closed;
                }
            }
        }
    };

    let snapshot = match snapshot {
        Ok(snapshot) => snapshot,
        Err(e) => {
            counters.snapshot += 1;
            tracing::error!(
                error = %e,
                attempt = counters.snapshot,
                "failed to fetch KuCoin level2 snapshot"
            );
            watcher.set_status(Exchange::Kucoin, VenueStatus::Disconnected);
            return SessionEnd::SnapshotFailed;
        }
    };

    book.reset(&snapshot.bids, &snapshot.asks, Some(snapshot.sequence));
    apply_buffered_changes(&mut book, buffer);
    tracing::info!(sequence = snapshot.sequence, "KuCoin snapshot applied");

    if watcher.get_status(Exchange::Kucoin) == Some(VenueStatus::Disconnected) {
        tracing::info!("KuCoin reconnected after disconnect");
    }
    if publish_best_levels(watcher, Exchange::Kucoin, &book, &mut last_published, true).is_err() {
        counters.snapshot += 1;
        tracing::error!("KuCoin book crossed right after the snapshot");
        watcher.set_status(Exchange::Kucoin, VenueStatus::Disconnected);
        return SessionEnd::SnapshotFailed;
    }
    counters.connect = 0;

    // Streaming phase.
    loop {
        if watcher.get_status(Exchange::Kucoin) == Some(VenueStatus::Disconnected) {
            return SessionEnd::ExternalDisconnect;
        }

        let text = match recv_text(ws, settings.stale_time).await {
            RecvOutcome::Text(text) => text,
            RecvOutcome::Timeout => {
                tracing::warn!(
                    stale_time = settings.stale_time.as_secs(),
                    "no KuCoin order book update within the stale window"
                );
                watcher.set_status(Exchange::Kucoin, VenueStatus::Disconnected);
                return SessionEnd::Stale;
            }
            RecvOutcome::Closed => {
                counters.connect += 1;
                tracing::warn!("KuCoin ws connection closed");
                watcher.set_status(Exchange::Kucoin, VenueStatus::Disconnected);
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
                    "failed to parse KuCoin message"
                );
                watcher.set_status(Exchange::Kucoin, VenueStatus::Disconnected);
                return SessionEnd::UpdateFailed;
            }
        };

        if message.kind == WELCOME_TYPE || message.kind == ACK_TYPE {
            continue;
        }
        if message.kind != MESSAGE_TYPE || message.topic.as_deref() != Some(topic) {
            continue;
        }
        let Some(change) = message.data else {
            continue;
        };

        match apply_streaming_change(&mut book, &change) {
            DeltaOutcome::Skipped => {}
            DeltaOutcome::Gap => {
                tracing::warn!(
                    sequence_start = change.sequence_start,
                    last_seq = book.last_seq,
                    "KuCoin sequence gap detected, resetting order book from snapshot"
                );
                watcher.set_status(Exchange::Kucoin, VenueStatus::Disconnected);
                if let Err(end) = resync_from_snapshot(
                    watcher,
                    client,
                    signer,
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
            DeltaOutcome::Applied => {
                match publish_best_levels(
                    watcher,
                    Exchange::Kucoin,
                    &book,
                    &mut last_published,
                    false,
                ) {
                    Ok(published) => {
                        if published {
                            counters.update = 0;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "KuCoin book desynced, resetting from snapshot");
                        watcher.set_status(Exchange::Kucoin, VenueStatus::Disconnected);
                        if let Err(end) = resync_from_snapshot(
                            watcher,
                            client,
                            signer,
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
            }
        }
    }
}

fn buffer_change(text: &str, topic: &str, buffer: &mut Vec<Level2Change>) {
    match serde_json::from_str::<WsMessage>(text) {
        Ok(message) => {
            if message.kind == ACK_TYPE {
                tracing::info!("KuCoin subscription confirmed");
            } else if message.kind == MESSAGE_TYPE && message.topic.as_deref() == Some(topic) {
                if let Some(change) = message.data {
                    buffer.push(change);
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "unparseable KuCoin frame while buffering");
        }
    }
}

async fn resync_from_snapshot(
    watcher: &LivePriceWatcher,
    client: &reqwest::Client,
    signer: &KcSigner,
    venue_symbol: &str,
    book: &mut LocalOrderBook,
    last_published: &mut Option<(f64, f64)>,
    counters: &mut RetryCounters,
) -> Result<(), SessionEnd> {
    let snapshot = match fetch_level2_snapshot(client, signer, venue_symbol).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            counters.snapshot += 1;
            tracing::error!(
                error = %e,
                attempt = counters.snapshot,
                "failed to refetch KuCoin level2 snapshot"
            );
            return Err(SessionEnd::SnapshotFailed);
        }
    };

    book.reset(&snapshot.bids, &snapshot.asks, Some(snapshot.sequence));
    tracing::info!(
        sequence = snapshot.sequence,
        "KuCoin order book reset from snapshot"
    );

    if publish_best_levels(watcher, Exchange::Kucoin, book, last_published, true).is_err() {
        counters.snapshot += 1;
        tracing::error!("KuCoin book crossed right after the snapshot");
        return Err(SessionEnd::SnapshotFailed);
    }

    Ok(())
}

fn apply_change(book: &mut LocalOrderBook, change: &Level2Change) {
    for [price, size, _sequence] in &change.changes.bids {
        book.apply_level(Side::Bid, *price, *size);
    }
    for [price, size, _sequence] in &change.changes.asks {
        book.apply_level(Side::Ask, *price, *size);
    }
    book.last_seq = Some(change.sequence_end);
}

fn apply_streaming_change(book: &mut LocalOrderBook, change: &Level2Change) -> DeltaOutcome {
    let last_seq = book.last_seq.unwrap_or(0);

    if change.sequence_end <= last_seq {
        return DeltaOutcome::Skipped;
    }
    if change.sequence_start > last_seq + 1 {
        return DeltaOutcome::Gap;
    }

    apply_change(book, change);

    DeltaOutcome::Applied
}

/// Replays buffered deltas over a freshly applied snapshot, starting at the
/// first whose sequence range covers `sequence + 1`.
fn apply_buffered_changes(book: &mut LocalOrderBook, buffer: Vec<Level2Change>) {
    let snapshot_seq = book.last_seq.unwrap_or(0);
    let mut applying = false;

    for change in buffer {
        if change.sequence_end <= snapshot_seq {
            continue;
        }
        if !applying {
            if change.sequence_start <= snapshot_seq + 1
                && snapshot_seq + 1 <= change.sequence_end
            {
                applying = true;
            } else {
                continue;
            }
        }

        apply_change(book, &change);
    }
}

async fn get_public_token(client: &reqwest::Client) -> Result<String, KucoinError> {
    let response = client
        .post(format!("{REST_BASE_ENDPOINT}{BULLET_PUBLIC_PATH}"))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(KucoinError::HttpError(response.status().to_string()));
    }

    let bullet = response.json::<BulletResponse>().await?;
    Ok(bullet.data.token)
}

async fn fetch_level2_snapshot(
    client: &reqwest::Client,
    signer: &KcSigner,
    venue_symbol: &str,
) -> Result<Level2Snapshot, KucoinError> {
    let path = format!("{LEVEL2_SNAPSHOT_PATH}?symbol={}", venue_symbol.to_uppercase());
    let plain = format!("GET{path}");

    let mut request = client.get(format!("{REST_BASE_ENDPOINT}{path}"));
    for (name, value) in signer.headers(&plain) {
        request = request.header(name, value);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(KucoinError::HttpError(response.status().to_string()));
    }

    let snapshot = response.json::<Level2SnapshotResponse>().await?;
    Ok(snapshot.data)
}

#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    topic: &'a str,
    #[serde(rename = "privateChannel")]
    private_channel: bool,
    response: bool,
}

#[derive(Debug, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub topic: Option<String>,
    pub data: Option<Level2Change>,
}

#[derive(Debug, Deserialize)]
pub struct Level2Change {
    #[serde(rename = "sequenceStart")]
    pub sequence_start: u64,
    #[serde(rename = "sequenceEnd")]
    pub sequence_end: u64,
    pub changes: ChangeRows,
}

/// Change rows are `(price, size, sequence)` string triples.
#[derive(Debug, Deserialize)]
pub struct ChangeRows {
    #[serde(
        deserialize_with = "exchange_utils::convert_array_len_3_to_f64",
        default
    )]
    pub bids: Vec<[f64; 3]>,
    #[serde(
        deserialize_with = "exchange_utils::convert_array_len_3_to_f64",
        default
    )]
    pub asks: Vec<[f64; 3]>,
}

#[derive(Debug, Deserialize)]
struct BulletResponse {
    data: BulletData,
}

#[derive(Debug, Deserialize)]
struct BulletData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct Level2SnapshotResponse {
    data: Level2Snapshot,
}

#[derive(Debug, Deserialize)]
pub struct Level2Snapshot {
    #[serde(deserialize_with = "exchange_utils::convert_from_string_to_u64")]
    pub sequence: u64,
    #[serde(
        deserialize_with = "exchange_utils::convert_array_len_2_to_f64",
        default
    )]
    pub bids: Vec<[f64; 2]>,
    #[serde(
        deserialize_with = "exchange_utils::convert_array_len_2_to_f64",
        default
    )]
    pub asks: Vec<[f64; 2]>,
}

#[cfg(test)]
mod tests {
    use super::{
        apply_buffered_changes, apply_streaming_change, Level2Change, WsMessage,
    };
    use crate::exchanges::DeltaOutcome;
    use crate::order_book::LocalOrderBook;

    fn change(start: u64, end: u64, bids: Vec<[f64; 3]>, asks: Vec<[f64; 3]>) -> Level2Change {
        Level2Change {
            sequence_start: start,
            sequence_end: end,
            changes: super::ChangeRows { bids, asks },
        }
    }

    #[test]
    fn test_gap_fill_after_snapshot() {
        let mut book = LocalOrderBook::new();
        book.reset(&[[100.0, 1.0]], &[[100.5, 1.0]], Some(50));

        apply_buffered_changes(
            &mut book,
            vec![
                change(40, 50, vec![[99.0, 5.0, 41.0]], vec![]),
                change(49, 52, vec![[100.1, 1.0, 51.0]], vec![]),
                change(53, 55, vec![], vec![[100.4, 1.0, 54.0]]),
            ],
        );

        assert_eq!(book.last_seq, Some(55));
        assert_eq!(book.best_levels(), Some((100.1, 100.4)));
    }

    #[test]
    fn test_streaming_change_rules() {
        let mut book = LocalOrderBook::new();
        book.reset(&[[100.0, 1.0]], &[[100.5, 1.0]], Some(50));

        // Entirely behind the cursor.
        let outcome = apply_streaming_change(&mut book, &change(48, 50, vec![], vec![]));
        assert_eq!(outcome, DeltaOutcome::Skipped);

        // Starts past last_seq + 1.
        let outcome = apply_streaming_change(&mut book, &change(52, 53, vec![], vec![]));
        assert_eq!(outcome, DeltaOutcome::Gap);
        assert_eq!(book.last_seq, Some(50));

        // Contiguous, size zero removes the level.
        let outcome = apply_streaming_change(
            &mut book,
            &change(51, 52, vec![[100.0, 0.0, 51.0]], vec![[100.4, 2.0, 52.0]]),
        );
        assert_eq!(outcome, DeltaOutcome::Applied);
        assert_eq!(book.last_seq, Some(52));
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.best_ask(), Some(100.4));
    }

    #[test]
    fn test_level2_message_parses() {
        let message: WsMessage = serde_json::from_str(
            r#"{
                "type": "message",
                "topic": "/market/level2:BTC-USDT",
                "subject": "trade.l2update",
                "data": {
                    "changes": {
                        "asks": [["18906", "0.00331", "14103845"]],
                        "bids": [["18903", "0.16305032", "14103844"]]
                    },
                    "sequenceEnd": 14103845,
                    "sequenceStart": 14103844,
                    "symbol": "BTC-USDT",
                    "time": 1663747970273
                }
            }"#,
        )
        .expect("fixture should parse");

        let data = message.data.expect("data should be present");
        assert_eq!(data.sequence_start, 14103844);
        assert_eq!(data.sequence_end, 14103845);
        assert_eq!(data.changes.bids, vec![[18903.0, 0.16305032, 14103844.0]]);
    }
}
