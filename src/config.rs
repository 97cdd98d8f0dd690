use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::exchanges::Exchange;

const DEFAULT_SYMBOL: &str = "BTC";
const DEFAULT_STALE_TIME_SECONDS: u64 = 30;
const DEFAULT_MAX_WS_RECONNECTS: u32 = 10;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),
    #[error("invalid value for {0}: {1}")]
    InvalidEnvValue(&'static str, String),
    #[error("missing KuCoin API credentials, set KUCOIN_API_KEY, KUCOIN_API_SECRET and KUCOIN_API_PASSPHRASE")]
    MissingKucoinCredentials,
}

#[derive(Debug, Clone)]
pub struct KucoinCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
}

/// Runtime settings, merged from the command line and the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Upper cased base symbol, ie. BTC.
    pub symbol: String,
    pub exchanges: Vec<Exchange>,
    pub taker_fee: f64,
    /// A venue whose stream is silent for this long is treated as dead.
    pub stale_time: Duration,
    /// Bound on every per-venue retry counter.
    pub max_ws_reconnects: u32,
    pub redis_url: Option<String>,
    pub status_file: PathBuf,
    pub opportunities_file: PathBuf,
    pub kucoin: Option<KucoinCredentials>,
}

impl Settings {
    /// Resolution order for the symbol and the exchange set is command line
    /// argument, then environment variable, then default.
    pub fn new(
        symbol_arg: Option<String>,
        exchanges_arg: Option<String>,
        taker_fee: f64,
    ) -> Result<Settings, ConfigError> {
        let symbol = symbol_arg
            .or_else(|| env::var("SYMBOL").ok())
            .unwrap_or_else(|| DEFAULT_SYMBOL.to_owned())
            .to_uppercase();

        let exchanges = match exchanges_arg.or_else(|| env::var("EXCHANGES").ok()) {
            Some(value) => Exchange::parse_exchanges(&value)?,
            None => Exchange::all_exchanges(),
        };

        let stale_time =
            Duration::from_secs(env_parse("STALE_TIME", DEFAULT_STALE_TIME_SECONDS)?);
        let max_ws_reconnects = env_parse("MAX_WS_RECONNECTS", DEFAULT_MAX_WS_RECONNECTS)?;

        let kucoin = kucoin_credentials_from_env();
        if kucoin.is_none() && exchanges.contains(&Exchange::Kucoin) {
            return Err(ConfigError::MissingKucoinCredentials);
        }

        Ok(Settings {
            status_file: PathBuf::from(format!("logs/status_{symbol}.json")),
            opportunities_file: PathBuf::from("opportunities.csv"),
            symbol,
            exchanges,
            taker_fee,
            stale_time,
            max_ws_reconnects,
            redis_url: env::var("REDIS_URL").ok(),
            kucoin,
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidEnvValue(name, value)),
        Err(_) => Ok(default),
    }
}

fn kucoin_credentials_from_env() -> Option<KucoinCredentials> {
    let api_key = env::var("KUCOIN_API_KEY").ok()?;
    let api_secret = env::var("KUCOIN_API_SECRET").ok()?;
    let api_passphrase = env::var("KUCOIN_API_PASSPHRASE").ok()?;

    if api_key.is_empty() || api_secret.is_empty() || api_passphrase.is_empty() {
        return None;
    }

    Some(KucoinCredentials {
        api_key,
        api_secret,
        api_passphrase,
    })
}

#[cfg(test)]
mod tests {
    use super::Settings;
    use crate::exchanges::Exchange;

    #[test]
    fn test_symbol_argument_is_uppercased() {
        let settings = Settings::new(
            Some("eth".to_owned()),
            Some("binance,kraken".to_owned()),
            0.001,
        )
        .expect("settings should build");

        assert_eq!(settings.symbol, "ETH");
        assert_eq!(
            settings.exchanges,
            vec![Exchange::Binance, Exchange::Kraken]
        );
        assert_eq!(
            settings.status_file,
            std::path::PathBuf::from("logs/status_ETH.json")
        );
    }

    #[test]
    fn test_unknown_exchange_is_rejected() {
        let result = Settings::new(Some("BTC".to_owned()), Some("binance,mtgox".to_owned()), 0.001);
        assert!(result.is_err());
    }

    #[test]
    fn test_kucoin_requires_credentials() {
        // No credentials in the test environment.
        let result = Settings::new(Some("BTC".to_owned()), Some("kucoin".to_owned()), 0.001);
        assert!(result.is_err());
    }
}
