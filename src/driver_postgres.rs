use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions, Postgres};
use sqlx::{Connection, PgPool};
use tokio_util::sync::CancellationToken;

use crate::config::PoolSettings;
use crate::driver::{Connector, DatabaseHandle};
use crate::errors::{ConnectionError, QueryError};
use crate::materialize::materialize;
use crate::models::{ConnectionInfo, ConnectionTarget, QueryResult};

/// Upper bound on delivering a cancel request, independent of the grace
/// period given to the cancelled statement afterwards.
const CANCEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Opens [`PgHandle`]s, one pool per handle.
pub struct PgConnector {
    settings: PoolSettings,
}

impl PgConnector {
    pub fn new(settings: PoolSettings) -> Self {
        Self { settings }
    }
}

#[async_trait::async_trait]
impl Connector for PgConnector {
    async fn open(
        &self,
        target: &ConnectionTarget,
    ) -> Result<Arc<dyn DatabaseHandle>, ConnectionError> {
        debug!("opening PostgreSQL pool for {}", target);

        let connect_options: PgConnectOptions = target
            .as_str()
            .parse()
            .map_err(|e: sqlx::Error| ConnectionError::InvalidTarget(e.to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(self.settings.max_connections)
            .acquire_timeout(self.settings.acquire_timeout)
            .connect_with(connect_options.clone())
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;

        if let Err(e) = sqlx::query("SELECT 1").execute(&pool).await {
            pool.close().await;
            return Err(ConnectionError::Ping(e.to_string()));
        }

        Ok(Arc::new(PgHandle {
            target: target.clone(),
            connect_options,
            pool,
            closing: CancellationToken::new(),
            cancel_grace: self.settings.cancel_grace,
        }))
    }
}

/// A live pool against one target database.
pub struct PgHandle {
    target: ConnectionTarget,
    /// Used for cancel requests, which must not wait on a saturated pool.
    connect_options: PgConnectOptions,
    pool: PgPool,
    /// Fired once on close; in-flight executions watch it.
    closing: CancellationToken,
    cancel_grace: Duration,
}

enum Outcome {
    Finished(Result<QueryResult, QueryError>),
    Closed,
    Abandoned,
}

impl PgHandle {
    /// Check out a connection, giving up early on cancellation or close.
    async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PoolConnection<Postgres>, QueryError> {
        tokio::select! {
            conn = self.pool.acquire() => conn.map_err(QueryError::from),
            _ = cancel.cancelled() => Err(QueryError::Cancelled),
            _ = self.closing.cancelled() => Err(QueryError::ConnectionClosed),
        }
    }

    /// Ask the server to cancel whatever backend `pid` is running.
    ///
    /// Goes over its own short-lived connection: the pool may have no free
    /// slot while the statement being cancelled holds one.
    async fn cancel_backend(&self, pid: i32) {
        let request = async {
            let mut conn = PgConnection::connect_with(&self.connect_options).await?;
            let cancelled = sqlx::query_scalar::<_, bool>("SELECT pg_cancel_backend($1)")
                .bind(pid)
                .fetch_one(&mut conn)
                .await;
            if let Err(e) = conn.close().await {
                debug!("closing cancel connection failed: {}", e);
            }
            cancelled
        };
        match tokio::time::timeout(CANCEL_REQUEST_TIMEOUT, request).await {
            Ok(Ok(true)) => info!("cancel requested for backend {}", pid),
            Ok(Ok(false)) => debug!("backend {} had nothing to cancel", pid),
            Ok(Err(e)) => warn!("pg_cancel_backend({}) failed: {}", pid, e),
            Err(_) => warn!("pg_cancel_backend({}) timed out", pid),
        }
    }
}

#[async_trait::async_trait]
impl DatabaseHandle for PgHandle {
    fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    async fn info(&self) -> Result<ConnectionInfo, QueryError> {
        if self.is_closed() {
            return Err(QueryError::ConnectionClosed);
        }
        let mut info = ConnectionInfo::from_target(&self.target);
        match sqlx::query_scalar::<_, String>("SHOW server_version")
            .fetch_one(&self.pool)
            .await
        {
            Ok(version) => info.version = version,
            Err(e) => debug!("server_version unavailable: {}", e),
        }
        Ok(info)
    }

    async fn databases(&self) -> Result<Vec<String>, QueryError> {
        if self.is_closed() {
            return Err(QueryError::ConnectionClosed);
        }
        let names = sqlx::query_scalar::<_, String>(
            "SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn execute(
        &self,
        sql: &str,
        cancel: &CancellationToken,
    ) -> Result<QueryResult, QueryError> {
        let submitted = Instant::now();
        if self.is_closed() {
            return Err(QueryError::ConnectionClosed);
        }
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let mut conn = self.acquire(cancel).await?;
        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await?;

        let outcome = {
            let run = materialize(&mut conn, sql, submitted);
            tokio::pin!(run);

            tokio::select! {
                biased;
                res = &mut run => Outcome::Finished(res),
                _ = self.closing.cancelled() => Outcome::Closed,
                _ = cancel.cancelled() => {
                    self.cancel_backend(pid).await;
                    tokio::select! {
                        biased;
                        res = &mut run => Outcome::Finished(res),
                        _ = self.closing.cancelled() => Outcome::Closed,
                        _ = tokio::time::sleep(self.cancel_grace) => Outcome::Abandoned,
                    }
                }
            }
        };

        match outcome {
            Outcome::Finished(Ok(result)) => Ok(result),
            Outcome::Finished(Err(e)) if cancel.is_cancelled() && e.is_cancellation() => {
                Err(QueryError::Cancelled)
            }
            Outcome::Finished(Err(e)) => Err(e),
            Outcome::Closed => {
                conn.close_on_drop();
                Err(QueryError::ConnectionClosed)
            }
            Outcome::Abandoned => {
                warn!(
                    "backend {} ignored cancellation for {:?}, dropping its connection",
                    pid, self.cancel_grace
                );
                conn.close_on_drop();
                Err(QueryError::Cancelled)
            }
        }
    }

    async fn close(&self) {
        if self.closing.is_cancelled() {
            return;
        }
        self.closing.cancel();
        self.pool.close().await;
        debug!("closed PostgreSQL pool for {}", self.target);
    }

    fn is_closed(&self) -> bool {
        self.closing.is_cancelled() || self.pool.is_closed()
    }
}
