use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Json => "application/json",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            ExportFormat::Csv => "export.csv",
            ExportFormat::Json => "export.json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!("unsupported format '{}', use csv or json", other)),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Csv => f.write_str("csv"),
            ExportFormat::Json => f.write_str("json"),
        }
    }
}

/// Plan explanation flavour for one-shot EXPLAIN requests.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExplainMode {
    Plan,
    Analyze,
}

impl ExplainMode {
    pub fn rewrite(self, sql: &str) -> String {
        match self {
            ExplainMode::Plan => format!("EXPLAIN {}", sql),
            ExplainMode::Analyze => format!("EXPLAIN ANALYZE {}", sql),
        }
    }
}
