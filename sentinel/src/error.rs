use sentinel_broker::error::BrokerError;
use sentinel_store::error::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("serialisation: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("backtest: {0}")]
    Backtest(String),

    #[error("job {job_id}: {detail}")]
    Job { job_id: String, detail: String },

    #[error("JoinError: {0}")]
    JoinError(String),
}

impl From<tokio::task::JoinError> for SentinelError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::JoinError(format!("{value:?}"))
    }
}
