/// SQLSTATE reported by Postgres when a statement is cancelled by request.
pub const QUERY_CANCELED: &str = "57014";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("invalid connection target: {0}")] InvalidTarget(String),
    #[error("open connection: {0}")] Connect(String),
    #[error("ping: {0}")] Ping(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("canceling statement due to user request")] Cancelled,
    #[error("connection closed")] ConnectionClosed,
    #[error("{message}")] Execution { code: Option<String>, message: String },
    #[error("decode column {column}: {reason}")] Decode { column: usize, reason: String },
}

impl QueryError {
    pub fn execution(message: impl Into<String>) -> Self {
        QueryError::Execution { code: None, message: message.into() }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            QueryError::Execution { code, .. } => code.as_deref(),
            QueryError::Cancelled => Some(QUERY_CANCELED),
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.code() == Some(QUERY_CANCELED)
    }
}

impl From<sqlx::Error> for QueryError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) => QueryError::Execution {
                code: db.code().map(|c| c.into_owned()),
                message: db.message().to_string(),
            },
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) => QueryError::ConnectionClosed,
            other => QueryError::execution(other.to_string()),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HistoryError {
    #[error("history storage: {0}")] Storage(#[from] sqlx::Error),
    #[error("history directory {path}: {source}")] Directory { path: String, source: std::io::Error },
}

#[derive(thiserror::Error, Debug)]
pub enum ExportError {
    #[error("csv export: {0}")] Csv(#[from] csv::Error),
    #[error("json export: {0}")] Json(#[from] serde_json::Error),
    #[error("export output: {0}")] Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("not connected to database")] NotConnected,
    #[error(transparent)] Connection(#[from] ConnectionError),
    #[error("{source}")] Query { tab_id: Option<String>, source: QueryError },
    #[error(transparent)] History(#[from] HistoryError),
    #[error(transparent)] Export(#[from] ExportError),
}

impl ServiceError {
    pub fn query(tab_id: Option<&str>, source: QueryError) -> Self {
        ServiceError::Query { tab_id: tab_id.map(str::to_string), source }
    }

    /// The underlying statement failure, if this is one.
    pub fn query_error(&self) -> Option<&QueryError> {
        match self {
            ServiceError::Query { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
