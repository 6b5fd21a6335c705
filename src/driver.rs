//! Database-agnostic transport seam
//!
//! The lifecycle manager and the per-tab registry only ever talk to these
//! traits. `driver_postgres` provides the real implementation.

use std::borrow::Cow;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::errors::{ConnectionError, QueryError};
use crate::models::{ConnectionInfo, ConnectionTarget, QueryResult};

/// Opens connection handles from a target.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Establish the transport and verify it with a liveness check.
    ///
    /// On error nothing is left open.
    async fn open(
        &self,
        target: &ConnectionTarget,
    ) -> Result<Arc<dyn DatabaseHandle>, ConnectionError>;
}

/// One live connection to the target database.
///
/// Handles are shared behind `Arc` but only the connection manager may close
/// them. Once closed every new or in-flight operation fails with
/// [`QueryError::ConnectionClosed`].
#[async_trait::async_trait]
pub trait DatabaseHandle: Send + Sync {
    fn target(&self) -> &ConnectionTarget;

    /// Database component of the target this handle was opened with.
    fn database(&self) -> Cow<'_, str> {
        self.target().database()
    }

    /// Live metadata. Server version is best effort and left empty when the
    /// server does not answer.
    async fn info(&self) -> Result<ConnectionInfo, QueryError>;

    /// Non-template databases on the server, sorted by name.
    async fn databases(&self) -> Result<Vec<String>, QueryError>;

    /// Run one statement bound to `cancel` and materialize its rows.
    ///
    /// Cancellation is cooperative: if the server finishes the statement
    /// before honoring the cancel request, the natural result is returned.
    async fn execute(&self, sql: &str, cancel: &CancellationToken)
        -> Result<QueryResult, QueryError>;

    /// Close the transport. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}
