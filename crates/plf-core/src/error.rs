use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row holds a value the sync engine cannot interpret.
    #[error("invalid value in column {column}: {value}")]
    InvalidValue { column: &'static str, value: String },
}

impl CoreError {
    pub(crate) fn invalid(column: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            column,
            value: value.into(),
        }
    }
}
