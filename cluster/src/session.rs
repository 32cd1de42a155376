use crate::backend::{Backend, BackendPool, ErrorHook};
use crudapp_common::{
    ClusterConfig, ClusterError, MemberAddress, PoolStats, QueryParam, Result, Verification,
};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// One connection pool bound to one member.
///
/// A session only exists for a member that accepted writes at connect time.
pub struct Session<P: BackendPool> {
    id: Uuid,
    member: MemberAddress,
    pool: P,
    verification: Verification,
}

impl<P: BackendPool> Session<P> {
    /// Open a pool to `member` and check it is writable.
    ///
    /// A member reporting read-only/recovery mode is closed again and
    /// rejected with [`ClusterError::ReadOnlyMember`].
    pub async fn connect<B>(
        backend: &B,
        member: &MemberAddress,
        config: &ClusterConfig,
        on_error: ErrorHook,
    ) -> Result<Self>
    where
        B: Backend<Pool = P>,
    {
        let started = Instant::now();
        let pool = backend.open(member, config, on_error).await?;

        let verification = match pool.verify().await {
            Ok(verification) => verification,
            Err(e) => {
                pool.close().await;
                return Err(match e {
                    ClusterError::Query { kind, source } => ClusterError::Connect {
                        member: member.clone(),
                        kind,
                        source,
                    },
                    other => other,
                });
            }
        };

        if verification.in_recovery {
            warn!(member = %member, "Connected but member is in recovery mode");
            pool.close().await;
            return Err(ClusterError::ReadOnlyMember {
                member: member.clone(),
            });
        }

        let session = Self {
            id: Uuid::new_v4(),
            member: member.clone(),
            pool,
            verification,
        };

        info!(
            session = %session.id,
            member = %member,
            elapsed_ms = started.elapsed().as_millis() as u64,
            server_time = %session.verification.server_time,
            "Session connected to writable member"
        );

        Ok(session)
    }

    pub fn member(&self) -> &MemberAddress {
        &self.member
    }

    /// Verification captured when the session was opened
    pub fn verification(&self) -> &Verification {
        &self.verification
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> Result<P::Rows> {
        self.pool.query(sql, params).await
    }

    pub async fn acquire(&self) -> Result<P::Connection> {
        self.pool.acquire().await
    }

    /// Run the verification query again against the live pool
    pub async fn verify(&self) -> Result<Verification> {
        self.pool.verify().await
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Drain and close the pool
    pub async fn close(&self) {
        if self.pool.is_closed() {
            return;
        }
        info!(session = %self.id, member = %self.member, "Closing session");
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
