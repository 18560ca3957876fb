use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error: {0}")]
    Api(String),

    #[error("response parse: {0}")]
    Parse(String),

    #[error("credentials missing: set tradernet_api_key / tradernet_api_secret")]
    NotConfigured,
}

impl From<serde_json::Error> for BrokerError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}
