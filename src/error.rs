use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no results found matching the given query")]
    NoResults,

    #[error("{0}")]
    Custom(String),

    #[error("sort arguments must be given in field/order pairs")]
    UnpairedSortArguments,

    #[error("invalid sort order: {0}")]
    InvalidSortOrder(String),

    #[error("operator {0} applied without a target field; call where_field first")]
    MissingTargetField(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("unique constraint violated: field '{field}' value already exists")]
    UniqueViolation { field: String },

    #[error("model '{0}' is already registered with a different document type")]
    ModelTypeMismatch(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document must be a JSON object")]
    NotAnObject,

    #[error("schedule error: {0}")]
    Schedule(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
