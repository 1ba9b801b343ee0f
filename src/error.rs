use thiserror::Error;

#[derive(Error, Debug)]
pub enum HoldbackError {
    #[error("{table} row {id} not found")]
    RowNotFound { table: String, id: i64 },

    #[error("section '{0}' not found")]
    SectionNotFound(i64),

    #[error("equipment type '{0}' not found")]
    TypeNotFound(i64),

    #[error("unknown field '{field}' for {table}")]
    UnknownField { table: String, field: String },

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("column limit reached ({0} columns)")]
    ColumnLimit(usize),

    #[error("cannot remove the last remaining column")]
    LastColumn,

    #[error("record has no integer 'id' field")]
    MissingId,

    #[error("backend is unavailable: {0}")]
    Unavailable(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("incorrect PIN")]
    PinRejected,

    #[error("API error: {0}")]
    Api(String),

    #[error("rate limited, retry after {0}s")]
    RateLimited(u64),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, HoldbackError>;
