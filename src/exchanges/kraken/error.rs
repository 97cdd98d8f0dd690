#[derive(thiserror::Error, Debug)]
pub enum KrakenError {
    #[error("Tungstenite error")]
    TungsteniteError(#[from] tungstenite::Error),
    #[error("Reqwest error")]
    ReqwestError(#[from] reqwest::Error),
    #[error("Serde json error")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("invalid book level: {0}")]
    InvalidLevel(String),
    #[error("Depth endpoint error: {0}")]
    RestError(String),
}
