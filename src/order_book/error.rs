#[derive(thiserror::Error, Debug)]
pub enum OrderBookError {
    #[error("crossed book, bid {bid} >= ask {ask}")]
    CrossedBook { bid: f64, ask: f64 },
}
