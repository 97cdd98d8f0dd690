#[derive(thiserror::Error, Debug)]
pub enum CoinbaseError {
    #[error("Tungstenite error")]
    TungsteniteError(#[from] tungstenite::Error),
    #[error("Serde json error")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("invalid level2 row: {0}")]
    InvalidLevel(String),
    #[error("level2 update received before any snapshot")]
    UpdateBeforeSnapshot,
}
