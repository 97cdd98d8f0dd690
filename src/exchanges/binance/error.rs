#[derive(thiserror::Error, Debug)]
pub enum BinanceError {
    #[error("Tungstenite error")]
    TungsteniteError(#[from] tungstenite::Error),
    #[error("Reqwest error")]
    ReqwestError(#[from] reqwest::Error),
    #[error("Serde json error")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    HttpError(String),
}
