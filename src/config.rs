use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use dirs::home_dir;

/// Directory name searched for upward from the working directory.
const STORE_DIR_NAME: &str = ".pglet";
/// SQLite file holding query history inside the store directory.
const HISTORY_DB_FILE: &str = "pglet.db";

#[derive(Debug, Clone, Parser)]
#[command(name = "pglet", version, about = "A PostgreSQL browser")]
pub struct Config {
    /// PostgreSQL connection URL
    #[arg(long, env = "PGLET_URL")]
    pub url: Option<String>,

    /// Database host
    #[arg(long, env = "PGLET_HOST")]
    pub host: Option<String>,

    /// Database port
    #[arg(long, env = "PGLET_PORT", default_value_t = 5432)]
    pub port: u16,

    /// Database user
    #[arg(long, env = "PGLET_USER")]
    pub user: Option<String>,

    /// Database password
    #[arg(long, env = "PGLET_PASS", hide_env_values = true)]
    pub pass: Option<String>,

    /// Database name
    #[arg(long = "db", env = "PGLET_DB")]
    pub db_name: Option<String>,

    /// SSL mode
    #[arg(long, env = "PGLET_SSL", default_value = "disable")]
    pub ssl: String,

    /// Data directory (default: nearest .pglet/ upward, then ~/.pglet/)
    #[arg(long = "store-dir", alias = "repo-dir", env = "PGLET_STORE_DIR")]
    pub store_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, env = "PGLET_DEV")]
    pub dev: bool,

    /// Connections kept by the shared pool; tabs beyond this wait for a free one
    #[arg(long, env = "PGLET_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    /// How long a cancelled statement may keep running before its connection is dropped
    #[arg(long, env = "PGLET_CANCEL_GRACE_MS", default_value_t = 5000)]
    pub cancel_grace_ms: u64,
}

impl Config {
    /// Connection URL from `--url`, or assembled from the individual flags
    /// when a host is given.
    pub fn connection_url(&self) -> Option<String> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Some(url.trim().to_string());
        }
        let host = self.host.as_deref().filter(|h| !h.is_empty())?;

        let mut url = String::from("postgres://");
        if let Some(user) = self.user.as_deref().filter(|u| !u.is_empty()) {
            url.push_str(user);
            if let Some(pass) = self.pass.as_deref().filter(|p| !p.is_empty()) {
                url.push(':');
                url.push_str(pass);
            }
            url.push('@');
        }
        url.push_str(&format!("{}:{}", host, self.port));
        if let Some(db) = self.db_name.as_deref().filter(|d| !d.is_empty()) {
            url.push('/');
            url.push_str(db);
        }
        url.push_str(&format!("?sslmode={}", self.ssl));
        Some(url)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.max_connections.max(1),
            cancel_grace: Duration::from_millis(self.cancel_grace_ms),
            ..PoolSettings::default()
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        resolve_store_dir(self.store_dir.as_deref())
    }
}

/// Runtime knobs for the Postgres connection pool behind each handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub cancel_grace: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// Explicit directory, else the nearest `.pglet/` above the working
/// directory, else `~/.pglet`.
pub fn resolve_store_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Ok(cwd) = std::env::current_dir()
        && let Some(found) = find_store_dir_upward(&cwd)
    {
        return found;
    }
    match home_dir() {
        Some(home) => home.join(STORE_DIR_NAME),
        None => PathBuf::from(STORE_DIR_NAME),
    }
}

fn find_store_dir_upward(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(STORE_DIR_NAME))
        .find(|candidate| candidate.is_dir())
}

pub fn history_db_path(store_dir: &Path) -> PathBuf {
    store_dir.join(HISTORY_DB_FILE)
}
