pub mod error;
mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::{
    config::Settings, error::ArbServiceError, exchanges::OrderBookService,
    watcher::LivePriceWatcher,
};

pub struct Binance;

#[async_trait]
impl OrderBookService for Binance {
    async fn spawn_order_book_service(
        watcher: Arc<LivePriceWatcher>,
        settings: Arc<Settings>,
    ) -> JoinHandle<Result<(), ArbServiceError>> {
        tokio::spawn(async move {
            stream::run_order_book_stream(watcher, settings).await?;
            Ok(())
        })
    }
}
