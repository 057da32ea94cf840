//! Error types for warehouse-etl.
//!
//! Errors come in two tiers. [`FieldError`] describes a data-quality problem with a single
//! field value; the normalizer recovers from it locally by storing `null`. Everything else is an
//! [`Error`], which aborts the current batch and, through it, the job.

use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for warehouse-etl operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
        /// Source error if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A scalar type tag that the type registry does not know.
    #[error("Unknown field type: {0}")]
    UnknownType(String),

    /// A declared table schema that cannot be turned into a normalization plan.
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// Schema error on the destination side (missing primary key, empty schema, ...)
    #[error("Schema error: {message}")]
    Schema {
        /// Error message
        message: String,
    },

    /// Load type other than `merge` or `replace`.
    #[error("Load type '{0}' is not implemented")]
    UnsupportedLoadType(String),

    /// Structural failure while normalizing a batch.
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// Field coercion failure surfaced through the standalone registry API.
    #[error(transparent)]
    Field(#[from] FieldError),

    /// PostgreSQL connection error
    #[error("PostgreSQL connection error: {message}")]
    PostgresConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// PostgreSQL query error
    #[error("PostgreSQL query error on table '{table}': {message}")]
    PostgresQuery {
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<tokio_postgres::Error>,
    },

    /// MySQL connection error
    #[error("MySQL connection error: {message}")]
    MySqlConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// MySQL query error
    #[error("MySQL query error on table '{table}': {message}")]
    MySqlQuery {
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// DuckDB / MotherDuck connection error
    #[error("MotherDuck connection error: {message}")]
    MotherDuckConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<duckdb::Error>,
    },

    /// DuckDB / MotherDuck query error
    #[error("MotherDuck query error on table '{table}': {message}")]
    MotherDuckQuery {
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<duckdb::Error>,
    },

    /// Document store error
    #[error("Document store error on collection '{collection}': {message}")]
    DocumentStore {
        /// Collection name
        collection: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// REST API source error
    #[error("API error ({status}) for {url}: {message}")]
    Api {
        /// Requested URL (without credentials)
        url: String,
        /// HTTP status, 0 when the request never completed
        status: u16,
        /// Error message
        message: String,
    },

    /// The metadata provider asked us to slow down.
    #[error("Rate limited by metadata provider: {0}")]
    RateLimited(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Staging area error
    #[error("Staging error at '{path}': {message}")]
    Staging {
        /// File or directory involved
        path: String,
        /// Error message
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Retry exhausted
    #[error("Operation failed after {attempts} attempts: {message}")]
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error message
        message: String,
        /// Last error encountered
        #[source]
        last_error: Option<Box<Error>>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a PostgreSQL connection error.
    pub fn postgres_connection(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::PostgresConnection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a PostgreSQL query error.
    pub fn postgres_query(
        table: impl Into<String>,
        message: impl Into<String>,
        source: tokio_postgres::Error,
    ) -> Self {
        Self::PostgresQuery {
            table: table.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a MySQL connection error.
    pub fn mysql_connection(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::MySqlConnection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a MySQL query error.
    pub fn mysql_query(
        table: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::MySqlQuery {
            table: table.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a MotherDuck connection error.
    pub fn motherduck_connection(message: impl Into<String>, source: duckdb::Error) -> Self {
        Self::MotherDuckConnection {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a MotherDuck query error.
    pub fn motherduck_query(
        table: impl Into<String>,
        message: impl Into<String>,
        source: duckdb::Error,
    ) -> Self {
        Self::MotherDuckQuery {
            table: table.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a document store error.
    pub fn document_store(
        collection: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DocumentStore {
            collection: collection.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create an invalid schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a staging error.
    pub fn staging(path: impl AsRef<std::path::Path>, message: impl Into<String>) -> Self {
        Self::Staging {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RateLimited(_))
    }

    /// Get the error code for metrics/logging.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "CONFIG_ERROR",
            Error::UnknownType(_) => "UNKNOWN_TYPE",
            Error::InvalidSchema(_) => "INVALID_SCHEMA",
            Error::Schema { .. } => "SCHEMA_ERROR",
            Error::UnsupportedLoadType(_) => "UNSUPPORTED_LOAD_TYPE",
            Error::Batch(_) => "BATCH_ERROR",
            Error::Field(_) => "FIELD_ERROR",
            Error::PostgresConnection { .. } => "PG_CONNECTION_ERROR",
            Error::PostgresQuery { .. } => "PG_QUERY_ERROR",
            Error::MySqlConnection { .. } => "MYSQL_CONNECTION_ERROR",
            Error::MySqlQuery { .. } => "MYSQL_QUERY_ERROR",
            Error::MotherDuckConnection { .. } => "MD_CONNECTION_ERROR",
            Error::MotherDuckQuery { .. } => "MD_QUERY_ERROR",
            Error::DocumentStore { .. } => "DOCUMENT_STORE_ERROR",
            Error::Api { .. } => "API_ERROR",
            Error::RateLimited(_) => "RATE_LIMITED",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Staging { .. } => "STAGING_ERROR",
            Error::Serialization { .. } => "SERIALIZATION_ERROR",
            Error::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

/// Recoverable failure to coerce one field value.
///
/// The normalizer replaces the offending value with `null` and logs the error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    /// An encoded string could not be decoded.
    #[error("cannot decode {expected} from string: {message}")]
    Decode {
        /// What the string was expected to contain
        expected: &'static str,
        /// Decoder message
        message: String,
    },

    /// The raw value has a JSON shape the target type cannot accept.
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        /// Target type
        expected: &'static str,
        /// JSON kind of the raw value
        found: &'static str,
    },

    /// The raw value has the right shape but an unparseable content.
    #[error("invalid {expected} value {value:?}")]
    InvalidValue {
        /// Target type
        expected: &'static str,
        /// Offending value rendered as text
        value: String,
    },
}

/// Unrecoverable failure while normalizing a batch; the whole batch is abandoned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    /// A source record is not a mapping.
    #[error("record #{index} is not a mapping (found {found})")]
    NotAMapping {
        /// Position of the record in the batch
        index: usize,
        /// JSON kind of the record
        found: &'static str,
    },
}
