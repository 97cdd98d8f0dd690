#[derive(thiserror::Error, Debug)]
pub enum BybitError {
    #[error("Tungstenite error")]
    TungsteniteError(#[from] tungstenite::Error),
    #[error("Serde json error")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),
}
