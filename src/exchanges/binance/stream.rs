use std::sync::Arc;

use serde_derive::Deserialize;

use crate::config::Settings;
use crate::exchanges::binance::error::BinanceError;
use crate::exchanges::{
    exchange_utils, publish_best_levels, recv_text, DeltaOutcome, Exchange, RecvOutcome,
    RetryCounters, SessionEnd, WsStream, EXTERNAL_DISCONNECT_BACKOFF, RECONNECT_BACKOFF,
};
use crate::order_book::{LocalOrderBook, Side};
use crate::watcher::{LivePriceWatcher, VenueStatus};

const WS_BASE_ENDPOINT: &str = "wss://stream.binance.com:9443/ws/";
const ORDER_BOOK_SNAPSHOT_BASE_ENDPOINT: &str = "https://api.binance.com/api/v3/depth?symbol=";
const DEPTH_UPDATE_EVENT: &str = "depthUpdate";
const SNAPSHOT_DEPTH: usize = 100;

// The depth stream has no in-band snapshot. A session buffers incoming diff
// events while a REST snapshot is in flight, seeds the book from the
// snapshot, then replays the buffered events whose cursor range covers
// lastUpdateId + 1. From there every diff either extends the cursor, is
// dropped as already applied, or reveals a gap that forces a fresh snapshot.

pub(crate) async fn run_order_book_stream(
    watcher: Arc<LivePriceWatcher>,
    settings: Arc<Settings>,
) -> Result<(), BinanceError> {
    let venue_symbol = Exchange::Binance.venue_symbol(&settings.symbol);
    //The stream name must be lowercase while the snapshot endpoint requires
    //the pair in uppercase
    let stream_endpoint = format!("{WS_BASE_ENDPOINT}{venue_symbol}@depth@100ms");
    let snapshot_symbol = venue_symbol.to_uppercase();

    let mut counters = RetryCounters::new();

    while !counters.exhausted(settings.max_ws_reconnects) {
        let mut ws = match tokio_tungstenite::connect_async(stream_endpoint.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                counters.connect += 1;
                tracing::warn!(
                    error = %e,
                    attempt = counters.connect,
                    "failed to connect to Binance depth stream"
                );
                watcher.set_status(Exchange::Binance, VenueStatus::Disconnected);
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };
        tracing::info!("Binance ws connection established");

        let end = run_session(&watcher, &mut ws, &snapshot_symbol, &settings, &mut counters).await;
        let _ = ws.close(None).await;

        match end {
            SessionEnd::ExternalDisconnect => {
                tracing::warn!("Binance marked disconnected externally, throttling reconnect");
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
        "max reconnect attempts reached, stopping Binance order book listener"
    );
    watcher.set_status(Exchange::Binance, VenueStatus::Stopped);

    Ok(())
}

async fn run_session(
    watcher: &LivePriceWatcher,
    ws: &mut WsStream,
    snapshot_symbol: &str,
    settings: &Settings,
    counters: &mut RetryCounters,
) -> SessionEnd {
    let mut book = LocalOrderBook::new();
    let mut last_published = None;
    let mut buffer: Vec<DepthUpdate> = vec![];

    // Wait for the first diff event so the stream is live before the
    // snapshot request goes out, otherwise the snapshot could predate the
    // start of the stream.
    loop {
        match recv_text(ws, settings.stale_time).await {
            RecvOutcome::Text(text) => match parse_depth_update(&text) {
                Ok(Some(update)) => {
                    buffer.push(update);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "unparseable frame while waiting for the stream");
                }
            },
            RecvOutcome::Timeout => {
                tracing::warn!("no Binance frame before the stale window elapsed");
                watcher.set_status(Exchange::Binance, VenueStatus::Disconnected);
                return SessionEnd::Stale;
            }
            RecvOutcome::Closed => {
                counters.connect += 1;
                watcher.set_status(Exchange::Binance, VenueStatus::Disconnected);
                return SessionEnd::Closed;
            }
        }
    }

    // Buffer every event that arrives while the snapshot request is in
    // flight.
    let fetch = get_order_book_snapshot(snapshot_symbol, SNAPSHOT_DEPTH);
    tokio::pin!(fetch);
    let snapshot = loop {
        tokio::select! {
            result = &mut fetch => break result,
            outcome = recv_text(ws, settings.stale_time) => match outcome {
                RecvOutcome::Text(text) => match parse_depth_update(&text) {
                    Ok(Some(update)) => buffer.push(update),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "unparseable frame while buffering");
                    }
                },
                RecvOutcome::Timeout => {
                    watcher.set_status(Exchange::Binance, VenueStatus::Disconnected);
                    return SessionEnd::Stale;
                }
                RecvOutcome::Closed => {
                    counters.connect += 1;
                    watcher.set_status(Exchange::Binance, VenueStatus::Disconnected);
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
                "failed to fetch Binance depth snapshot"
            );
            watcher.set_status(Exchange::Binance, VenueStatus::Disconnected);
            return SessionEnd::SnapshotFailed;
        }
    };

    book.reset(&snapshot.bids, &snapshot.asks, Some(snapshot.last_update_id));
    apply_buffered_updates(&mut book, buffer);
    tracing::info!(
        last_update_id = snapshot.last_update_id,
        "Binance snapshot applied"
    );

    if watcher.get_status(Exchange::Binance) == Some(VenueStatus::Disconnected) {
        tracing::info!("Binance reconnected after disconnect");
    }
    if publish_best_levels(watcher, Exchange::Binance, &book, &mut last_published, true).is_err() {
        counters.snapshot += 1;
        tracing::error!("Binance book crossed right after the snapshot");
        watcher.set_status(Exchange::Binance, VenueStatus::Disconnected);
        return SessionEnd::SnapshotFailed;
    }
    counters.connect = 0;

    // Streaming phase.
    loop {
        if watcher.get_status(Exchange::Binance) == Some(VenueStatus::Disconnected) {
            return SessionEnd::ExternalDisconnect;
        }

        let text = match recv_text(ws, settings.stale_time).await {
            RecvOutcome::Text(text) => text,
            RecvOutcome::Timeout => {
                tracing::warn!(
                    stale_time = settings.stale_time.as_secs(),
                    "no Binance order book update within the stale window"
                );
                watcher.set_status(Exchange::Binance, VenueStatus::Disconnected);
                return SessionEnd::Stale;
            }
            RecvOutcome::Closed => {
                counters.connect += 1;
                tracing::warn!("Binance ws connection closed");
                watcher.set_status(Exchange::Binance, VenueStatus::Disconnected);
                return SessionEnd::Closed;
            }
        };

        let update = match parse_depth_update(&text) {
            Ok(Some(update)) => update,
            Ok(None) => continue,
            Err(e) => {
                counters.update += 1;
                tracing::error!(
                    error = %e,
                    attempt = counters.update,
                    "failed to parse Binance depth update"
                );
                watcher.set_status(Exchange::Binance, VenueStatus::Disconnected);
                return SessionEnd::UpdateFailed;
            }
        };

        match apply_streaming_update(&mut book, &update) {
            DeltaOutcome::Skipped => {}
            DeltaOutcome::Gap => {
                tracing::warn!(
                    first_update_id = update.first_update_id,
                    last_seq = book.last_seq,
                    "Binance sequence gap detected, resetting order book from snapshot"
                );
                watcher.set_status(Exchange::Binance, VenueStatus::Disconnected);
                if let Err(end) = resync_from_snapshot(
                    watcher,
                    &mut book,
                    &mut last_published,
                    snapshot_symbol,
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
                    Exchange::Binance,
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
                        tracing::warn!(error = %e, "Binance book desynced, resetting from snapshot");
                        watcher.set_status(Exchange::Binance, VenueStatus::Disconnected);
                        if let Err(end) = resync_from_snapshot(
                            watcher,
                            &mut book,
                            &mut last_published,
                            snapshot_symbol,
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

async fn resync_from_snapshot(
    watcher: &LivePriceWatcher,
    book: &mut LocalOrderBook,
    last_published: &mut Option<(f64, f64)>,
    snapshot_symbol: &str,
    counters: &mut RetryCounters,
) -> Result<(), SessionEnd> {
    let snapshot = match get_order_book_snapshot(snapshot_symbol, SNAPSHOT_DEPTH).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            counters.snapshot += 1;
            tracing::error!(
                error = %e,
                attempt = counters.snapshot,
                "failed to refetch Binance depth snapshot"
            );
            return Err(SessionEnd::SnapshotFailed);
        }
    };

    book.reset(&snapshot.bids, &snapshot.asks, Some(snapshot.last_update_id));
    tracing::info!(
        last_update_id = snapshot.last_update_id,
        "Binance order book reset from snapshot"
    );

    if publish_best_levels(watcher, Exchange::Binance, book, last_published, true).is_err() {
        counters.snapshot += 1;
        tracing::error!("Binance book crossed right after the snapshot");
        return Err(SessionEnd::SnapshotFailed);
    }

    Ok(())
}

fn apply_streaming_update(book: &mut LocalOrderBook, update: &DepthUpdate) -> DeltaOutcome {
    let last_seq = book.last_seq.unwrap_or(0);

    if update.final_update_id <= last_seq {
        return DeltaOutcome::Skipped;
    }
    if update.first_update_id > last_seq + 1 {
        return DeltaOutcome::Gap;
    }

    book.apply_levels(Side::Bid, &update.bids);
    book.apply_levels(Side::Ask, &update.asks);
    book.last_seq = Some(update.final_update_id);

    DeltaOutcome::Applied
}

/// Replays buffered diff events over a freshly applied snapshot. Events fully
/// behind the snapshot are dropped, replay starts at the first event whose
/// cursor range covers `lastUpdateId + 1` and then applies everything after
/// it in arrival order.
fn apply_buffered_updates(book: &mut LocalOrderBook, buffer: Vec<DepthUpdate>) {
    let snapshot_id = book.last_seq.unwrap_or(0);
    let mut applying = false;

    for update in buffer {
        if update.final_update_id <= snapshot_id {
            continue;
        }
        if !applying {
            if update.first_update_id <= snapshot_id + 1
                && snapshot_id + 1 <= update.final_update_id
            {
                applying = true;
            } else {
                continue;
            }
        }

        book.apply_levels(Side::Bid, &update.bids);
        book.apply_levels(Side::Ask, &update.asks);
        book.last_seq = Some(update.final_update_id);
    }
}

fn parse_depth_update(message: &str) -> Result<Option<DepthUpdate>, BinanceError> {
    let event = serde_json::from_str::<OrderBookEvent>(message)?;
    if event.event != DEPTH_UPDATE_EVENT {
        return Ok(None);
    }

    Ok(Some(serde_json::from_str::<DepthUpdate>(message)?))
}

#[derive(Debug, Deserialize)]
pub struct OrderBookSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    #[serde(deserialize_with = "exchange_utils::convert_array_len_2_to_f64")]
    pub bids: Vec<[f64; 2]>,
    #[serde(deserialize_with = "exchange_utils::convert_array_len_2_to_f64")]
    pub asks: Vec<[f64; 2]>,
}

#[derive(Debug, Deserialize)]
pub struct OrderBookEvent {
    #[serde(rename = "e")]
    pub event: String,
}

#[derive(Debug, Deserialize)]
pub struct DepthUpdate {
    #[serde(rename = "U")]
    pub first_update_id: u64,
    #[serde(rename = "u")]
    pub final_update_id: u64,
    #[serde(
        rename = "b",
        deserialize_with = "exchange_utils::convert_array_len_2_to_f64"
    )]
    pub bids: Vec<[f64; 2]>,
    #[serde(
        rename = "a",
        deserialize_with = "exchange_utils::convert_array_len_2_to_f64"
    )]
    pub asks: Vec<[f64; 2]>,
}

async fn get_order_book_snapshot(
    symbol: &str,
    depth: usize,
) -> Result<OrderBookSnapshot, BinanceError> {
    let snapshot_endpoint = format!("{ORDER_BOOK_SNAPSHOT_BASE_ENDPOINT}{symbol}&limit={depth}");

    let snapshot_response = reqwest::get(snapshot_endpoint).await?;

    if snapshot_response.status().is_success() {
        Ok(snapshot_response.json::<OrderBookSnapshot>().await?)
    } else {
        Err(BinanceError::HttpError(
            snapshot_response.status().to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_buffered_updates, apply_streaming_update, parse_depth_update, DepthUpdate};
    use crate::exchanges::DeltaOutcome;
    use crate::order_book::LocalOrderBook;

    fn update(first: u64, last: u64, bids: Vec<[f64; 2]>, asks: Vec<[f64; 2]>) -> DepthUpdate {
        DepthUpdate {
            first_update_id: first,
            final_update_id: last,
            bids,
            asks,
        }
    }

    #[test]
    fn test_gap_fill_after_snapshot() {
        let mut book = LocalOrderBook::new();
        book.reset(&[[100.0, 1.0]], &[[100.5, 1.0]], Some(100));

        // First event is fully behind the snapshot, second covers
        // lastUpdateId + 1, third follows in order.
        apply_buffered_updates(
            &mut book,
            vec![
                update(99, 99, vec![[99.0, 5.0]], vec![]),
                update(100, 101, vec![[100.1, 1.0]], vec![]),
                update(102, 104, vec![], vec![[100.4, 1.0]]),
            ],
        );

        assert_eq!(book.last_seq, Some(104));
        assert_eq!(book.best_levels(), Some((100.1, 100.4)));
    }

    #[test]
    fn test_gap_fill_ignores_stale_buffer() {
        let mut book = LocalOrderBook::new();
        book.reset(&[[100.0, 1.0]], &[[100.5, 1.0]], Some(100));

        apply_buffered_updates(
            &mut book,
            vec![
                update(90, 95, vec![[99.0, 5.0]], vec![]),
                update(96, 100, vec![[99.5, 5.0]], vec![]),
            ],
        );

        assert_eq!(book.last_seq, Some(100));
        assert_eq!(book.best_levels(), Some((100.0, 100.5)));
    }

    #[test]
    fn test_streaming_update_drops_old_events() {
        let mut book = LocalOrderBook::new();
        book.reset(&[[100.0, 1.0]], &[[100.5, 1.0]], Some(100));

        let outcome = apply_streaming_update(&mut book, &update(99, 100, vec![[99.0, 1.0]], vec![]));
        assert!(matches!(outcome, DeltaOutcome::Skipped));
        assert_eq!(book.last_seq, Some(100));
    }

    #[test]
    fn test_streaming_update_detects_gap() {
        let mut book = LocalOrderBook::new();
        book.reset(&[[100.0, 1.0]], &[[100.5, 1.0]], Some(100));

        let outcome =
            apply_streaming_update(&mut book, &update(102, 104, vec![[99.0, 1.0]], vec![]));
        assert!(matches!(outcome, DeltaOutcome::Gap));
        // A gap must not advance the cursor or mutate the book.
        assert_eq!(book.last_seq, Some(100));
        assert_eq!(book.best_levels(), Some((100.0, 100.5)));
    }

    #[test]
    fn test_streaming_update_applies_in_order() {
        let mut book = LocalOrderBook::new();
        book.reset(&[[100.0, 1.0]], &[[100.5, 1.0]], Some(100));

        let outcome = apply_streaming_update(
            &mut book,
            &update(101, 103, vec![[100.2, 1.0]], vec![[100.5, 0.0], [100.6, 2.0]]),
        );
        assert!(matches!(outcome, DeltaOutcome::Applied));
        assert_eq!(book.last_seq, Some(103));
        assert_eq!(book.best_levels(), Some((100.2, 100.6)));
    }

    #[test]
    fn test_parse_depth_update() {
        let message = r#"{
            "e": "depthUpdate",
            "E": 1699999999123,
            "s": "BTCUSDT",
            "U": 1000,
            "u": 1005,
            "b": [["67650.00", "1.234"]],
            "a": [["67651.00", "0.987"]]
        }"#;

        let update = parse_depth_update(message)
            .expect("parse failed")
            .expect("event was filtered");
        assert_eq!(update.first_update_id, 1000);
        assert_eq!(update.final_update_id, 1005);
        assert_eq!(update.bids, vec![[67650.0, 1.234]]);
        assert_eq!(update.asks, vec![[67651.0, 0.987]]);
    }
}
