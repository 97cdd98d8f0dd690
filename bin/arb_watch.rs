use std::sync::Arc;

use arb_watch::{
    config::Settings,
    opportunity::OpportunityMonitor,
    watcher::{status::StatusPublisher, LivePriceWatcher},
};
use clap::Parser;
use futures::FutureExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Format;

#[derive(Parser, Debug)]
#[clap(name = "arb-watch")]
struct Opts {
    /// Trading symbol, ie. BTC. Falls back to the SYMBOL environment
    /// variable, default BTC
    symbol: Option<String>,

    /// List of exchanges, separated by commas, ie. binance,kraken. Falls
    /// back to the EXCHANGES environment variable, default all venues
    #[clap(long, short)]
    exchanges: Option<String>,

    /// Taker fee applied to both legs when evaluating a spread
    #[clap(long, default_value = "0.001")]
    taker_fee: f64,

    /// Level of logging, options are trace, debug, info, warn, error
    #[clap(long, default_value = "info")]
    level: tracing::metadata::LevelFilter,

    /// Path to output file for logging
    #[clap(long, default_value = "arb_watch.log")]
    log_file_path: String,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv::dotenv().ok();

    let opts = Opts::parse();
    let _tracing_guard = initialize_tracing(&opts.log_file_path, opts.level)?;

    let settings = Arc::new(Settings::new(opts.symbol, opts.exchanges, opts.taker_fee)?);
    tracing::info!(
        symbol = %settings.symbol,
        exchanges = ?settings.exchanges,
        "starting live price watcher"
    );

    let (status_tx, status_handle) = StatusPublisher::spawn(&settings);
    let watcher = Arc::new(LivePriceWatcher::new(&settings.symbol, Some(status_tx)));

    //Spawn one order book synchronizer per configured venue plus the
    //opportunity loop, all sharing the watcher
    let mut join_handles = vec![];
    for exchange in &settings.exchanges {
        join_handles.push(
            exchange
                .spawn_order_book_service(watcher.clone(), settings.clone())
                .await,
        );
    }
    join_handles.push(OpportunityMonitor::new(watcher.clone(), &settings).spawn());
    join_handles.push(status_handle);

    let mut futures = join_handles
        .into_iter()
        .map(|handle| handle.boxed())
        .collect::<Vec<_>>();

    // A venue saturating its retry budget only stops that venue. The process
    // keeps running on the remaining tasks until interrupted.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                return Ok(());
            }
            (result, _index, remaining) = futures::future::select_all(futures) => {
                match result {
                    Ok(Ok(())) => tracing::warn!("a task finished"),
                    Ok(Err(e)) => tracing::error!(error = %e, "a task failed"),
                    Err(e) => tracing::error!(error = %e, "a task panicked"),
                }
                if remaining.is_empty() {
                    eyre::bail!("all tasks have stopped");
                }
                futures = remaining;
            }
        }
    }
}

fn initialize_tracing(
    file_path: &str,
    level: tracing::metadata::LevelFilter,
) -> eyre::Result<WorkerGuard> {
    let file_appender = tracing_appender::rolling::never("log", file_path);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let format = Format::default()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_level(true)
        .compact();

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(level)
        .event_format(format)
        .with_writer(non_blocking)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    Ok(guard)
}
