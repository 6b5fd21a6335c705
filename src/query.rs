//! Per-tab query execution
//!
//! Each tab owns at most one running statement. Starting a new one on the
//! same tab cancels the previous statement first; cancelling only signals,
//! and the statement removes its own registry entry when it finishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionManager;
use crate::driver::DatabaseHandle;
use crate::errors::{QueryError, ServiceError, ServiceResult};
use crate::history::HistoryRecorder;
use crate::models::{ExplainMode, HistoryEntry, QueryResult};

struct RunningQuery {
    /// Identifies which execution installed this entry.
    generation: u64,
    token: CancellationToken,
}

pub struct QueryRegistry {
    connections: Arc<ConnectionManager>,
    history: Arc<dyn HistoryRecorder>,
    running: Mutex<HashMap<String, RunningQuery>>,
    generations: AtomicU64,
}

/// Releases a tab's slot when the execution that owns it ends, however it ends.
struct TabSlot<'a> {
    registry: &'a QueryRegistry,
    tab_id: &'a str,
    generation: u64,
    token: CancellationToken,
}

impl Drop for TabSlot<'_> {
    fn drop(&mut self) {
        self.registry.release(self.tab_id, self.generation);
        self.token.cancel();
    }
}

impl QueryRegistry {
    pub fn new(connections: Arc<ConnectionManager>, history: Arc<dyn HistoryRecorder>) -> Arc<Self> {
        Arc::new(Self {
            connections,
            history,
            running: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(1),
        })
    }

    /// Run `sql` for `tab_id`, superseding whatever that tab was running.
    ///
    /// The statement runs on its own task: if the caller stops waiting, the
    /// statement is cancelled but still finishes its bookkeeping and history.
    pub async fn run_query(self: &Arc<Self>, tab_id: &str, sql: &str) -> ServiceResult<QueryResult> {
        let handle = self.connections.require()?;
        let token = CancellationToken::new();
        let generation = self.install(tab_id, token.clone());

        let registry = Arc::clone(self);
        let task = tokio::spawn({
            let tab_id = tab_id.to_string();
            let sql = sql.to_string();
            let token = token.clone();
            async move {
                registry
                    .execute_tracked(handle, &tab_id, generation, &sql, token)
                    .await
            }
        });
        let _abandon = token.drop_guard();

        match task.await {
            Ok(result) => result.map_err(|e| ServiceError::query(Some(tab_id), e)),
            Err(join) => Err(ServiceError::query(
                Some(tab_id),
                QueryError::execution(format!("query task failed: {}", join)),
            )),
        }
    }

    /// Signal the statement running for `tab_id`, if any. Unknown or
    /// finished tabs are a no-op.
    pub fn cancel_query(&self, tab_id: &str) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = running.get(tab_id) {
            info!("cancelling query for tab {}", tab_id);
            entry.token.cancel();
        }
    }

    pub fn is_running(&self, tab_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(tab_id)
    }

    pub fn running_tabs(&self) -> usize {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// `EXPLAIN` / `EXPLAIN ANALYZE` under the caller's own cancellation.
    /// Not tracked per tab and not recorded in history.
    pub async fn explain_query(
        &self,
        sql: &str,
        mode: ExplainMode,
        cancel: &CancellationToken,
    ) -> ServiceResult<QueryResult> {
        self.run_untracked(&mode.rewrite(sql), cancel).await
    }

    /// Run `sql` verbatim for export under the caller's own cancellation.
    pub async fn export_query(&self, sql: &str, cancel: &CancellationToken) -> ServiceResult<QueryResult> {
        self.run_untracked(sql, cancel).await
    }

    async fn run_untracked(&self, sql: &str, cancel: &CancellationToken) -> ServiceResult<QueryResult> {
        let handle = self.connections.require()?;
        handle
            .execute(sql, cancel)
            .await
            .map_err(|e| ServiceError::query(None, e))
    }

    async fn execute_tracked(
        &self,
        handle: Arc<dyn DatabaseHandle>,
        tab_id: &str,
        generation: u64,
        sql: &str,
        token: CancellationToken,
    ) -> Result<QueryResult, QueryError> {
        let slot = TabSlot { registry: self, tab_id, generation, token: token.clone() };
        let started = Instant::now();
        debug!("tab {}: running query", tab_id);

        let result = handle.execute(sql, &token).await;
        drop(slot);

        let entry = match &result {
            Ok(r) => {
                debug!("tab {}: {} rows in {} ms", tab_id, r.row_count, r.duration_ms);
                HistoryEntry::success(sql, &handle.database(), r)
            }
            Err(e) => {
                debug!("tab {}: failed: {}", tab_id, e);
                HistoryEntry::failure(sql, &handle.database(), &e.to_string(), started.elapsed())
            }
        };
        drop(handle);
        self.record(&entry).await;
        result
    }

    async fn record(&self, entry: &HistoryEntry) {
        if let Err(e) = self.history.append(entry).await {
            warn!("failed to record history entry: {}", e);
        }
    }

    /// Cancel and replace the tab's entry in one critical section.
    fn install(&self, tab_id: &str, token: CancellationToken) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = running.insert(tab_id.to_string(), RunningQuery { generation, token });
        if let Some(previous) = previous {
            debug!("tab {}: superseding running query", tab_id);
            previous.token.cancel();
        }
        generation
    }

    /// Remove the tab's entry only if it is still the one `generation` installed.
    fn release(&self, tab_id: &str, generation: u64) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.get(tab_id).is_some_and(|e| e.generation == generation) {
            running.remove(tab_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::driver::testing::ScriptedConnector;
    use crate::errors::HistoryError;
    use crate::models::CellValue;

    #[derive(Default)]
    struct RecordingHistory {
        entries: Mutex<Vec<HistoryEntry>>,
    }

    impl RecordingHistory {
        fn entries(&self) -> Vec<HistoryEntry> {
            self.entries.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl HistoryRecorder for RecordingHistory {
        async fn append(&self, entry: &HistoryEntry) -> Result<(), HistoryError> {
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    struct BrokenHistory;

    #[async_trait::async_trait]
    impl HistoryRecorder for BrokenHistory {
        async fn append(&self, _entry: &HistoryEntry) -> Result<(), HistoryError> {
            Err(HistoryError::Storage(sqlx::Error::PoolClosed))
        }
    }

    async fn connected(history: Arc<dyn HistoryRecorder>) -> (Arc<ConnectionManager>, Arc<QueryRegistry>) {
        let manager = Arc::new(ConnectionManager::new(ScriptedConnector::new()));
        manager.connect("postgres://u@db/app").await.unwrap();
        let registry = QueryRegistry::new(manager.clone(), history);
        (manager, registry)
    }

    async fn wait_until_running(registry: &QueryRegistry, tab: &str) {
        for _ in 0..200 {
            if registry.is_running(tab) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("tab {tab} never started");
    }

    #[tokio::test]
    async fn run_query_records_success() {
        let history = Arc::new(RecordingHistory::default());
        let (_, registry) = connected(history.clone()).await;

        let result = registry.run_query("a", "SELECT 1").await.unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(result.columns.len(), 1);
        assert_eq!(result.cell(0, 0), Some(&CellValue::Text("1".into())));

        let entries = history.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].row_count, 1);
        assert!(entries[0].is_success());
        assert_eq!(entries[0].database, "app");
        assert!(!registry.is_running("a"));
    }

    #[tokio::test]
    async fn failure_is_recorded_and_surfaced_with_tab() {
        let history = Arc::new(RecordingHistory::default());
        let (_, registry) = connected(history.clone()).await;

        let err = registry.run_query("t1", "FAIL syntax error at end").await.unwrap_err();
        match err {
            ServiceError::Query { tab_id, source } => {
                assert_eq!(tab_id.as_deref(), Some("t1"));
                assert_eq!(source.code(), Some("42601"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let entries = history.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error, "syntax error at end");
        assert_eq!(entries[0].row_count, 0);
    }

    #[tokio::test]
    async fn not_connected_is_reported_without_history() {
        let history = Arc::new(RecordingHistory::default());
        let manager = Arc::new(ConnectionManager::new(ScriptedConnector::new()));
        let registry = QueryRegistry::new(manager, history.clone());

        let err = registry.run_query("a", "SELECT 1").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotConnected));
        assert!(history.entries().is_empty());
    }

    #[tokio::test]
    async fn rerun_on_same_tab_cancels_the_first() {
        let history = Arc::new(RecordingHistory::default());
        let (_, registry) = connected(history.clone()).await;

        let first = tokio::spawn({
            let registry = registry.clone();
            async move { registry.run_query("t", "SLEEP 5000").await }
        });
        wait_until_running(&registry, "t").await;

        let second = registry.run_query("t", "SELECT 2").await.unwrap();
        assert_eq!(second.cell(0, 0), Some(&CellValue::Text("2".into())));

        let first = first.await.unwrap().unwrap_err();
        assert_eq!(first.query_error(), Some(&QueryError::Cancelled));

        let entries = history.entries();
        assert_eq!(entries.len(), 2);
        let cancelled: Vec<_> = entries.iter().filter(|e| !e.is_success()).collect();
        let succeeded: Vec<_> = entries.iter().filter(|e| e.is_success()).collect();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].sql, "SLEEP 5000");
        assert!(cancelled[0].error.contains("cancel"));
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].sql, "SELECT 2");
        assert_eq!(registry.running_tabs(), 0);
    }

    #[tokio::test]
    async fn stubborn_first_query_still_reports_its_result() {
        let history = Arc::new(RecordingHistory::default());
        let (_, registry) = connected(history.clone()).await;

        let first = tokio::spawn({
            let registry = registry.clone();
            async move { registry.run_query("t", "STUBBORN 50").await }
        });
        wait_until_running(&registry, "t").await;
        registry.run_query("t", "SELECT 3").await.unwrap();

        // the server ignored the cancel, so the natural result comes back
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.columns, vec!["stubborn"]);
        assert!(history.entries().iter().all(HistoryEntry::is_success));
        assert_eq!(history.entries().len(), 2);
        assert!(!registry.is_running("t"));
    }

    #[tokio::test]
    async fn cancel_then_run_again() {
        let history = Arc::new(RecordingHistory::default());
        let (_, registry) = connected(history.clone()).await;

        let sleeping = tokio::spawn({
            let registry = registry.clone();
            async move { registry.run_query("a", "SLEEP 5000").await }
        });
        wait_until_running(&registry, "a").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.cancel_query("a");

        let err = sleeping.await.unwrap().unwrap_err();
        assert!(err.query_error().is_some_and(QueryError::is_cancellation));
        assert!(!registry.is_running("a"));

        let result = registry.run_query("a", "SELECT 2").await.unwrap();
        assert_eq!(result.cell(0, 0), Some(&CellValue::Text("2".into())));

        let entries = history.entries();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].is_success());
        assert!(entries[1].is_success());
    }

    #[tokio::test]
    async fn cancel_unknown_tab_is_a_no_op() {
        let history = Arc::new(RecordingHistory::default());
        let (_, registry) = connected(history.clone()).await;
        registry.cancel_query("nobody");
        registry.run_query("a", "SELECT 1").await.unwrap();
        registry.cancel_query("a");
        assert_eq!(registry.running_tabs(), 0);
    }

    #[tokio::test]
    async fn tabs_do_not_interfere() {
        let history = Arc::new(RecordingHistory::default());
        let (_, registry) = connected(history.clone()).await;

        let slow = tokio::spawn({
            let registry = registry.clone();
            async move { registry.run_query("slow", "SLEEP 100").await }
        });
        wait_until_running(&registry, "slow").await;

        registry.run_query("fast", "SELECT 1").await.unwrap();
        registry.cancel_query("fast");
        assert!(registry.is_running("slow"));

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.columns, vec!["slept"]);
    }

    #[tokio::test]
    async fn stale_release_does_not_remove_newer_entry() {
        let history = Arc::new(RecordingHistory::default());
        let (_, registry) = connected(history).await;

        let old = registry.install("t", CancellationToken::new());
        let newer_token = CancellationToken::new();
        let newer = registry.install("t", newer_token.clone());

        registry.release("t", old);
        assert!(registry.is_running("t"));
        assert!(!newer_token.is_cancelled());

        registry.release("t", newer);
        assert!(!registry.is_running("t"));
    }

    #[tokio::test]
    async fn dropping_the_caller_cancels_and_still_records() {
        let history = Arc::new(RecordingHistory::default());
        let (_, registry) = connected(history.clone()).await;

        let caller = tokio::spawn({
            let registry = registry.clone();
            async move { registry.run_query("gone", "SLEEP 5000").await }
        });
        wait_until_running(&registry, "gone").await;
        caller.abort();
        let _ = caller.await;

        for _ in 0..200 {
            if !history.entries().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let entries = history.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].error.contains("cancel"));
        assert!(!registry.is_running("gone"));
    }

    #[tokio::test]
    async fn history_failures_do_not_fail_queries() {
        let (_, registry) = connected(Arc::new(BrokenHistory)).await;
        let result = registry.run_query("a", "NULLS").await.unwrap();
        assert_eq!(result.rows[0], vec![CellValue::Text(String::new()), CellValue::Null]);
    }

    #[tokio::test]
    async fn switch_mid_query_surfaces_closed_connection() {
        let history = Arc::new(RecordingHistory::default());
        let (manager, registry) = connected(history.clone()).await;

        let running = tokio::spawn({
            let registry = registry.clone();
            async move { registry.run_query("a", "SLEEP 5000").await }
        });
        wait_until_running(&registry, "a").await;
        manager.switch_database("other").await.unwrap();

        let err = running.await.unwrap().unwrap_err();
        assert_eq!(err.query_error(), Some(&QueryError::ConnectionClosed));
        assert_eq!(history.entries()[0].database, "app");

        let after = registry.run_query("a", "SHOW TARGET").await.unwrap();
        assert_eq!(after.cell(0, 0), Some(&CellValue::Text("other".into())));
    }

    #[tokio::test]
    async fn explain_and_export_are_untracked() {
        let history = Arc::new(RecordingHistory::default());
        let connector = ScriptedConnector::new();
        let manager = Arc::new(ConnectionManager::new(connector.clone()));
        manager.connect("postgres://u@db/app").await.unwrap();
        let registry = QueryRegistry::new(manager.clone(), history.clone());

        let err = registry
            .explain_query("SELECT 1", ExplainMode::Analyze, &CancellationToken::new())
            .await
            .unwrap_err();
        // the scripted handle has no EXPLAIN, which is enough to see the rewrite
        assert!(err.to_string().contains("EXPLAIN ANALYZE SELECT 1"));
        assert_eq!(connector.opened()[0].executed(), vec!["EXPLAIN ANALYZE SELECT 1"]);

        let exported = registry.export_query("NULLS", &CancellationToken::new()).await.unwrap();
        assert_eq!(exported.columns, vec!["empty", "missing"]);

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = registry.export_query("SLEEP 10", &cancelled).await.unwrap_err();
        assert_eq!(err.query_error(), Some(&QueryError::Cancelled));

        assert!(history.entries().is_empty());
        assert_eq!(registry.running_tabs(), 0);

        let handle = manager.snapshot().unwrap();
        assert!(!handle.is_closed());
    }
}
