//! Façade over the connection manager, the per-tab registry and history.
//!
//! This is the surface an outer layer (the CLI prompt, or an HTTP glue) drives.

use std::io::Write;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::PoolSettings;
use crate::connection::ConnectionManager;
use crate::driver::Connector;
use crate::driver_postgres::PgConnector;
use crate::errors::ServiceResult;
use crate::export;
use crate::history::HistoryStore;
use crate::models::{ConnectionInfo, ExplainMode, ExportFormat, HistoryPage, QueryResult};
use crate::query::QueryRegistry;

pub struct Service {
    connections: Arc<ConnectionManager>,
    queries: Arc<QueryRegistry>,
    history: Arc<HistoryStore>,
}

impl Service {
    pub fn new(connector: Arc<dyn Connector>, history: Arc<HistoryStore>) -> Self {
        let connections = Arc::new(ConnectionManager::new(connector));
        let queries = QueryRegistry::new(connections.clone(), history.clone());
        Self { connections, queries, history }
    }

    /// Service backed by real PostgreSQL pools.
    pub fn postgres(settings: PoolSettings, history: Arc<HistoryStore>) -> Self {
        Self::new(Arc::new(PgConnector::new(settings)), history)
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub async fn connect(&self, target: &str) -> ServiceResult<ConnectionInfo> {
        self.connections.connect(target).await
    }

    pub async fn disconnect(&self) {
        self.connections.disconnect().await
    }

    pub async fn switch_database(&self, database: &str) -> ServiceResult<ConnectionInfo> {
        self.connections.switch_database(database).await
    }

    pub async fn current_info(&self) -> ServiceResult<Option<ConnectionInfo>> {
        self.connections.current_info().await
    }

    pub fn is_connected(&self) -> bool {
        self.connections.is_connected()
    }

    pub async fn databases(&self) -> ServiceResult<Vec<String>> {
        self.connections.databases().await
    }

    pub async fn run_query(&self, tab_id: &str, sql: &str) -> ServiceResult<QueryResult> {
        self.queries.run_query(tab_id, sql).await
    }

    pub fn cancel_query(&self, tab_id: &str) {
        self.queries.cancel_query(tab_id)
    }

    pub async fn explain_query(&self, sql: &str, cancel: &CancellationToken) -> ServiceResult<QueryResult> {
        self.queries.explain_query(sql, ExplainMode::Plan, cancel).await
    }

    pub async fn analyze_query(&self, sql: &str, cancel: &CancellationToken) -> ServiceResult<QueryResult> {
        self.queries.explain_query(sql, ExplainMode::Analyze, cancel).await
    }

    pub async fn export_query(&self, sql: &str, cancel: &CancellationToken) -> ServiceResult<QueryResult> {
        self.queries.export_query(sql, cancel).await
    }

    /// Run `sql` and write it to `out` in `format`. Returns the exported row count.
    pub async fn export_to<W: Write>(
        &self,
        sql: &str,
        format: ExportFormat,
        out: W,
        cancel: &CancellationToken,
    ) -> ServiceResult<usize> {
        let result = self.export_query(sql, cancel).await?;
        export::write_result(&result, format, out)?;
        Ok(result.row_count)
    }

    pub async fn list_history(&self, limit: i64, offset: i64) -> ServiceResult<HistoryPage> {
        Ok(self.history.list(limit, offset).await?)
    }

    pub async fn clear_history(&self) -> ServiceResult<()> {
        Ok(self.history.clear().await?)
    }

    /// Disconnect and release the history store.
    pub async fn shutdown(&self) {
        self.connections.disconnect().await;
        self.history.close().await;
    }
}
