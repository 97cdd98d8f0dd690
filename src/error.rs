use crate::{
    config::ConfigError,
    exchanges::{
        binance::error::BinanceError, bybit::error::BybitError, coinbase::error::CoinbaseError,
        kraken::error::KrakenError, kucoin::error::KucoinError,
    },
    order_book::error::OrderBookError,
};

#[derive(thiserror::Error, Debug)]
pub enum ArbServiceError {
    #[error("Order book error")]
    OrderBookError(#[from] OrderBookError),
    #[error("Binance error")]
    BinanceError(#[from] BinanceError),
    #[error("Coinbase error")]
    CoinbaseError(#[from] CoinbaseError),
    #[error("Bybit error")]
    BybitError(#[from] BybitError),
    #[error("Kraken error")]
    KrakenError(#[from] KrakenError),
    #[error("Kucoin error")]
    KucoinError(#[from] KucoinError),
    #[error("Configuration error")]
    ConfigError(#[from] ConfigError),
    #[error("Io error")]
    IoError(#[from] std::io::Error),
    #[error("Csv error")]
    CsvError(#[from] csv::Error),
    #[error("Serde json error")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("Redis error")]
    RedisError(#[from] redis::RedisError),
}
