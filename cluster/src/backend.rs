//! Relational protocol seam: opening a pool against one member and running
//! statements through it.

use async_trait::async_trait;
use crudapp_common::{
    ClusterConfig, ClusterError, MemberAddress, PoolStats, QueryParam, Result, Verification,
};
use std::sync::Arc;

/// Callback for asynchronous pool-level failures (a pooled connection dropped)
pub type ErrorHook = Arc<dyn Fn(&ClusterError) + Send + Sync>;

/// Hook that ignores every error
pub fn noop_hook() -> ErrorHook {
    Arc::new(|_: &ClusterError| {})
}

/// Opens connection pools against cluster members
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Pool: BackendPool;

    /// Open a pool bound to `member` using the sizing limits in `config`.
    ///
    /// `on_error` must be invoked for failures detected outside of a caller's
    /// own query (background health of pooled connections).
    async fn open(
        &self,
        member: &MemberAddress,
        config: &ClusterConfig,
        on_error: ErrorHook,
    ) -> Result<Self::Pool>;
}

/// A bounded pool of connections to one member
#[async_trait]
pub trait BackendPool: Send + Sync + 'static {
    /// Rows returned by `query`
    type Rows: Send;

    /// Checked-out connection for multi-statement work
    type Connection: Send;

    /// Liveness timestamp plus read-only/recovery flag
    async fn verify(&self) -> Result<Verification>;

    async fn query(&self, sql: &str, params: &[QueryParam]) -> Result<Self::Rows>;

    async fn acquire(&self) -> Result<Self::Connection>;

    fn stats(&self) -> PoolStats;

    /// Close the pool, waiting for checked-out connections to be returned
    async fn close(&self);

    fn is_closed(&self) -> bool;
}
