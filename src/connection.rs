//! Connection lifecycle: the one current database handle
//!
//! Every query path calls [`ConnectionManager::snapshot`] right before it
//! issues work and drops the handle when that work is done. Connect, switch
//! and disconnect are serialized against each other; the slot itself is only
//! locked for the swap.

use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info};
use tokio::sync::Mutex;

use crate::driver::{Connector, DatabaseHandle};
use crate::errors::{ServiceError, ServiceResult};
use crate::models::{ConnectionInfo, ConnectionTarget};

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    current: RwLock<Option<Arc<dyn DatabaseHandle>>>,
    lifecycle: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            current: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    /// Open `target` and make it current, closing the previous handle.
    ///
    /// On failure the previous handle stays current and untouched.
    pub async fn connect(&self, target: &str) -> ServiceResult<ConnectionInfo> {
        let target = ConnectionTarget::parse(target)?;
        let _lifecycle = self.lifecycle.lock().await;
        self.open_and_install(&target).await
    }

    /// Drop the current handle, if any. Disconnecting twice is fine.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.install(None).await {
            info!("disconnected");
        }
    }

    /// Reconnect to `database` on the same server with the same credentials.
    pub async fn switch_database(&self, database: &str) -> ServiceResult<ConnectionInfo> {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self.snapshot().ok_or(ServiceError::NotConnected)?;
        let target = current.target().with_database(database)?;
        drop(current);
        self.open_and_install(&target).await
    }

    /// `None` when disconnected, otherwise live metadata from the handle.
    pub async fn current_info(&self) -> ServiceResult<Option<ConnectionInfo>> {
        let Some(handle) = self.snapshot() else {
            return Ok(None);
        };
        let info = handle
            .info()
            .await
            .map_err(|e| ServiceError::query(None, e))?;
        Ok(Some(info))
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot().is_some()
    }

    /// The current handle. Fetch it immediately before use and do not keep
    /// it across awaits that are not the work itself.
    pub fn snapshot(&self) -> Option<Arc<dyn DatabaseHandle>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current handle or [`ServiceError::NotConnected`].
    pub fn require(&self) -> ServiceResult<Arc<dyn DatabaseHandle>> {
        self.snapshot().ok_or(ServiceError::NotConnected)
    }

    pub async fn databases(&self) -> ServiceResult<Vec<String>> {
        let handle = self.require()?;
        handle
            .databases()
            .await
            .map_err(|e| ServiceError::query(None, e))
    }

    /// Caller holds the lifecycle lock.
    async fn open_and_install(&self, target: &ConnectionTarget) -> ServiceResult<ConnectionInfo> {
        let handle = self.connector.open(target).await?;
        let info = match handle.info().await {
            Ok(info) => info,
            Err(e) => {
                handle.close().await;
                return Err(ServiceError::query(None, e));
            }
        };
        self.install(Some(handle)).await;
        info!(
            "connected to {} (database {}, server {})",
            target, info.database, info.version
        );
        Ok(info)
    }

    /// Swap the slot and close whatever was there. Caller holds the
    /// lifecycle lock, so each superseded handle is closed exactly once.
    /// Returns whether a handle was replaced.
    async fn install(&self, next: Option<Arc<dyn DatabaseHandle>>) -> bool {
        let previous = {
            let mut slot = self
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, next)
        };
        match previous {
            Some(old) => {
                debug!("closing superseded handle for {}", old.target());
                old.close().await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::driver::testing::ScriptedConnector;
    use crate::errors::{ConnectionError, QueryError};

    fn manager() -> (Arc<ScriptedConnector>, ConnectionManager) {
        let connector = ScriptedConnector::new();
        let manager = ConnectionManager::new(connector.clone());
        (connector, manager)
    }

    #[tokio::test]
    async fn connect_then_disconnect() {
        let (_, manager) = manager();
        let info = manager.connect("postgres://alice@db:6000/app").await.unwrap();
        assert_eq!(info.host, "db");
        assert_eq!(info.port, 6000);
        assert_eq!(info.user, "alice");
        assert_eq!(info.database, "app");

        let current = manager.current_info().await.unwrap().expect("connected");
        assert_eq!(current.database, "app");
        assert!(!current.version.is_empty());

        manager.disconnect().await;
        assert!(manager.current_info().await.unwrap().is_none());
        // idempotent
        manager.disconnect().await;
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn reconnect_closes_previous_exactly_once() {
        let (connector, manager) = manager();
        manager.connect("postgres://u@db/one").await.unwrap();
        manager.connect("postgres://u@db/two").await.unwrap();
        manager.disconnect().await;

        let opened = connector.opened();
        assert_eq!(opened.len(), 2);
        assert!(opened.iter().all(|h| h.close_calls() == 1));
    }

    #[tokio::test]
    async fn failed_connect_keeps_previous_handle() {
        let (connector, manager) = manager();
        manager.connect("postgres://u@db/one").await.unwrap();

        let err = manager.connect("postgres://u@unreachable/two").await.unwrap_err();
        assert!(matches!(err, ServiceError::Connection(ConnectionError::Connect(_))));

        let err = manager.connect("postgres://u@db/missing").await.unwrap_err();
        assert!(matches!(err, ServiceError::Connection(ConnectionError::Ping(_))));

        let info = manager.current_info().await.unwrap().expect("still connected");
        assert_eq!(info.database, "one");
        assert_eq!(connector.opened()[0].close_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_target_is_a_connection_error() {
        let (_, manager) = manager();
        let err = manager.connect("mysql://root@localhost/db").await.unwrap_err();
        assert!(matches!(err, ServiceError::Connection(ConnectionError::InvalidTarget(_))));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn switch_database_requires_connection() {
        let (connector, manager) = manager();
        let err = manager.switch_database("other").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotConnected));
        assert!(!manager.is_connected());
        assert!(connector.opened().is_empty());
    }

    #[tokio::test]
    async fn switch_database_swaps_handle() {
        let (connector, manager) = manager();
        manager.connect("postgres://u:pw@db:5433/one?sslmode=disable").await.unwrap();
        let info = manager.switch_database("two").await.unwrap();
        assert_eq!(info.database, "two");
        assert_eq!(info.port, 5433);

        let opened = connector.opened();
        assert_eq!(opened[0].close_calls(), 1);
        assert_eq!(opened[1].close_calls(), 0);
        assert_eq!(opened[1].target().as_str(), "postgres://u:pw@db:5433/two?sslmode=disable");
    }

    #[tokio::test]
    async fn in_flight_work_fails_when_handle_is_replaced() {
        let (_, manager) = manager();
        manager.connect("postgres://u@db/one").await.unwrap();
        let handle = manager.snapshot().unwrap();

        let running = tokio::spawn(async move {
            handle.execute("SLEEP 5000", &CancellationToken::new()).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.connect("postgres://u@db/two").await.unwrap();

        let res = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("did not hang")
            .unwrap();
        assert_eq!(res.unwrap_err(), QueryError::ConnectionClosed);
    }

    #[tokio::test]
    async fn databases_need_a_connection() {
        let (_, manager) = manager();
        assert!(matches!(manager.databases().await, Err(ServiceError::NotConnected)));
        manager.connect("postgres://u@db/app").await.unwrap();
        assert_eq!(manager.databases().await.unwrap(), vec!["app", "postgres"]);
    }
}
