use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::ConnectionError;

const DEFAULT_PORT: u16 = 5432;

/// Parsed `postgres://` URL the current connection was built from.
///
/// Never changes after a handle is opened with it; switching database derives
/// a new target instead.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    url: Url,
}

impl ConnectionTarget {
    pub fn parse(raw: &str) -> Result<Self, ConnectionError> {
        let url = Url::parse(raw.trim())
            .map_err(|e| ConnectionError::InvalidTarget(e.to_string()))?;
        match url.scheme() {
            "postgres" | "postgresql" => {}
            other => {
                return Err(ConnectionError::InvalidTarget(format!(
                    "unsupported scheme '{}', expected postgres://",
                    other
                )));
            }
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(ConnectionError::InvalidTarget("missing host".to_string()));
        }
        Ok(Self { url })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port().unwrap_or(DEFAULT_PORT)
    }

    /// Decoded user name, as the driver sends it to the server.
    pub fn user(&self) -> Cow<'_, str> {
        percent_decode_str(self.url.username()).decode_utf8_lossy()
    }

    /// Decoded database name, as the driver sends it to the server.
    pub fn database(&self) -> Cow<'_, str> {
        percent_decode_str(self.url.path().trim_start_matches('/')).decode_utf8_lossy()
    }

    /// Same target with only the database component replaced.
    pub fn with_database(&self, database: &str) -> Result<Self, ConnectionError> {
        let database = database.trim();
        if database.is_empty() {
            return Err(ConnectionError::InvalidTarget(
                "database name must not be empty".to_string(),
            ));
        }
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|_| ConnectionError::InvalidTarget("target has no path".to_string()))?
            .clear()
            .push(database);
        Ok(Self { url })
    }

    /// URL with the password masked, safe for logs.
    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        if url.password().is_some() {
            let _ = url.set_password(Some("****"));
        }
        url.to_string()
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionTarget").field(&self.redacted()).finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
    pub version: String,
}

impl ConnectionInfo {
    /// Metadata derivable from the target alone; `version` is filled by the server.
    pub fn from_target(target: &ConnectionTarget) -> Self {
        Self {
            host: target.host().to_string(),
            port: target.port(),
            user: target.user().into_owned(),
            database: target.database().into_owned(),
            version: String::new(),
        }
    }
}

/// One result cell. `Null` serialises as JSON `null`, never as `""`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Null => None,
            CellValue::Text(s) => Some(s),
        }
    }
}

impl From<Option<String>> for CellValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(CellValue::Null, CellValue::Text)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub column_types: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    pub row_count: usize,
    pub duration_ms: i64,
}

impl QueryResult {
    pub fn new(
        columns: Vec<String>,
        column_types: Vec<String>,
        rows: Vec<Vec<CellValue>>,
        elapsed: Duration,
    ) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            column_types,
            rows,
            row_count,
            duration_ms: i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&CellValue> {
        self.rows.get(row).and_then(|r| r.get(column))
    }
}

/// Audit record of one executed statement. Empty `error` means success.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub id: Option<i64>,
    pub sql: String,
    pub database: String,
    pub duration_ms: i64,
    pub row_count: i64,
    pub error: String,
    pub executed_at: String,
}

impl HistoryEntry {
    pub fn success(sql: &str, database: &str, result: &QueryResult) -> Self {
        Self {
            id: None,
            sql: sql.to_string(),
            database: database.to_string(),
            duration_ms: result.duration_ms,
            row_count: i64::try_from(result.row_count).unwrap_or(i64::MAX),
            error: String::new(),
            executed_at: timestamp(Utc::now()),
        }
    }

    pub fn failure(sql: &str, database: &str, error: &str, elapsed: Duration) -> Self {
        Self {
            id: None,
            sql: sql.to_string(),
            database: database.to_string(),
            duration_ms: i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
            row_count: 0,
            error: error.to_string(),
            executed_at: timestamp(Utc::now()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryPage {
    pub entries: Vec<HistoryEntry>,
    pub total: i64,
}
