use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arb_watch::{
    config::Settings,
    exchanges::Exchange,
    opportunity::OpportunityMonitor,
    watcher::{status::StatusPublisher, LivePriceWatcher},
};
use tokio::time;

fn test_settings(dir: &Path) -> Settings {
    Settings {
        symbol: "BTC".to_owned(),
        exchanges: vec![Exchange::Binance, Exchange::Bybit],
        taker_fee: 0.001,
        stale_time: Duration::from_secs(30),
        max_ws_reconnects: 10,
        redis_url: None,
        status_file: dir.join("status_BTC.json"),
        opportunities_file: dir.join("opportunities.csv"),
        kucoin: None,
    }
}

//Drive the watcher from simulated venue tasks the way the venue clients do
#[tokio::test]
async fn test_simulated_venues_feed_the_watcher() {
    let watcher = Arc::new(LivePriceWatcher::new("BTC", None));

    let venues = [
        (Exchange::Binance, 100.00, 100.10),
        (Exchange::Bybit, 100.30, 100.40),
        (Exchange::Kraken, 99.90, 100.05),
    ];

    let mut join_handles = vec![];
    for (exchange, bid, ask) in venues {
        let watcher = watcher.clone();
        join_handles.push(tokio::spawn(async move {
            for tick in 0..10u32 {
                let drift = f64::from(tick) * 0.001;
                watcher.update_price(exchange, bid + drift, ask + drift);
                time::sleep(Duration::from_millis(5)).await;
            }
        }));
    }
    for handle in join_handles {
        handle.await.expect("venue task panicked");
    }

    let (best_bid, best_ask) = watcher
        .get_best_opportunity()
        .expect("three venues are connected");
    assert_eq!(best_bid.exchange, Exchange::Bybit);
    assert_eq!(best_ask.exchange, Exchange::Kraken);
    assert_eq!(watcher.connected_count(), 3);
}

#[tokio::test]
async fn test_opportunity_monitor_appends_csv_rows() {
    let dir = tempfile::tempdir().expect("could not create temp dir");
    let settings = test_settings(dir.path());

    let watcher = Arc::new(LivePriceWatcher::new("BTC", None));
    watcher.update_price(Exchange::Binance, 100.00, 100.10);
    watcher.update_price(Exchange::Bybit, 100.50, 100.60);

    let monitor_handle = OpportunityMonitor::new(watcher.clone(), &settings).spawn();
    time::sleep(Duration::from_millis(1600)).await;
    monitor_handle.abort();

    let contents = std::fs::read_to_string(&settings.opportunities_file)
        .expect("the monitor should have written opportunity rows");
    let first_row = contents.lines().next().expect("at least one row");
    let fields: Vec<&str> = first_row.split(',').collect();

    assert_eq!(fields.len(), 7);
    assert_eq!(fields[1], "BTC");
    assert_eq!(fields[2], "binance");
    assert_eq!(fields[3], "100.1");
    assert_eq!(fields[4], "bybit");
    assert_eq!(fields[5], "100.5");

    // The spread column is the fee-adjusted profit,
    // round(100.50 * 0.999, 2) - round(100.10 * 1.001, 2).
    let spread: f64 = fields[6].parse().expect("spread should be numeric");
    assert!((spread - 0.20).abs() < 1e-9);
}

#[tokio::test]
async fn test_status_publisher_writes_the_fallback_file() {
    let dir = tempfile::tempdir().expect("could not create temp dir");
    let settings = test_settings(dir.path());

    let (status_tx, publisher_handle) = StatusPublisher::spawn(&settings);
    let watcher = Arc::new(LivePriceWatcher::new("BTC", Some(status_tx)));

    watcher.update_price(Exchange::Binance, 100.00, 100.10);
    time::sleep(Duration::from_millis(300)).await;

    let contents = std::fs::read_to_string(&settings.status_file)
        .expect("the publisher should have written the status file");
    let parsed: serde_json::Value =
        serde_json::from_str(&contents).expect("status file should be valid json");

    assert_eq!(parsed["symbol"], "BTC");
    assert_eq!(parsed["exchanges"]["binance"]["status"], "connected");
    assert_eq!(parsed["exchanges"]["binance"]["bid"], 100.0);
    assert_eq!(parsed["exchanges"]["binance"]["ask"], 100.1);

    // Dropping the watcher closes the channel and ends the publisher task.
    drop(watcher);
    let result = time::timeout(Duration::from_secs(1), publisher_handle)
        .await
        .expect("publisher should stop once the channel closes")
        .expect("publisher task panicked");
    assert!(result.is_ok());
}
