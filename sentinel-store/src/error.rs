use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("migration: {0}")]
    Migration(String),

    #[error("serialisation: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid row in table {table}: {detail}")]
    InvalidRow { table: &'static str, detail: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn invalid_row(table: &'static str, detail: impl Into<String>) -> Self {
        Self::InvalidRow {
            table,
            detail: detail.into(),
        }
    }
}
