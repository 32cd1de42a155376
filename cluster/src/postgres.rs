use crate::backend::{Backend, BackendPool, ErrorHook};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crudapp_common::{
    ClusterConfig, ClusterError, ErrorKind, MemberAddress, PoolStats, QueryParam, Result,
    Verification,
};
use sqlx::encode::{Encode, IsNull};
use sqlx::error::BoxDynError;
use sqlx::pool::PoolConnection;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgTypeInfo,
};
use sqlx::query::Query;
use sqlx::{Connection, Postgres, Row, Type};
use tracing::{debug, warn};

const VERIFY_SQL: &str =
    "SELECT NOW() AS now, pg_is_in_recovery() AS in_recovery, version() AS version";

/// Map a driver error onto the closed error taxonomy
pub fn classify(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Io(io) => ErrorKind::from_io(io.kind()),
        sqlx::Error::PoolTimedOut => ErrorKind::TimedOut,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // admin_shutdown, crash_shutdown: server terminated the session
            Some("57P01") | Some("57P02") => ErrorKind::ResetByPeer,
            // cannot_connect_now: server starting up or shutting down
            Some("57P03") => ErrorKind::ConnectionRefused,
            _ => ErrorKind::Other,
        },
        _ => ErrorKind::Other,
    }
}

fn query_error(err: sqlx::Error) -> ClusterError {
    ClusterError::query(classify(&err), err)
}

/// NULL sent with parameter type oid 0, leaving the server to infer the
/// type from context. A typed NULL (e.g. text) fails against int columns.
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(
        &self,
        _buf: &mut PgArgumentBuffer,
    ) -> std::result::Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(UntypedNull),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::Text(v) => query.bind(v.as_str()),
        QueryParam::Timestamp(v) => query.bind(*v),
        QueryParam::Json(v) => query.bind(sqlx::types::Json(v)),
    }
}

/// PostgreSQL backend built on sqlx pools
#[derive(Debug, Default, Clone)]
pub struct PgBackend {
    application_name: Option<String>,
}

impl PgBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Backend for PgBackend {
    type Pool = PgClusterPool;

    async fn open(
        &self,
        member: &MemberAddress,
        config: &ClusterConfig,
        on_error: ErrorHook,
    ) -> Result<PgClusterPool> {
        let mut options = PgConnectOptions::new()
            .host(member.host())
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password);
        if let Some(name) = &self.application_name {
            options = options.application_name(name);
        }

        let hook_member = member.clone();
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .idle_timeout(Some(config.idle_timeout()))
            .acquire_timeout(config.connection_timeout())
            .max_lifetime(Some(config.max_lifetime()))
            // Liveness is checked by the hook below so failures reach the manager
            .test_before_acquire(false)
            .before_acquire(move |conn, _meta| {
                let on_error = on_error.clone();
                let member = hook_member.clone();
                Box::pin(async move {
                    match conn.ping().await {
                        Ok(()) => Ok(true),
                        Err(e) => {
                            let err = query_error(e);
                            warn!(member = %member, error = %err, "Pooled connection failed liveness check");
                            on_error(&err);
                            Ok(false)
                        }
                    }
                })
            })
            .connect_with(options)
            .await
            .map_err(|e| ClusterError::connect(member.clone(), classify(&e), e))?;

        debug!(member = %member, max_connections = config.max_connections, "Opened connection pool");

        Ok(PgClusterPool {
            pool,
            max_connections: config.max_connections,
        })
    }
}

/// sqlx pool bound to one member
pub struct PgClusterPool {
    pool: PgPool,
    max_connections: u32,
}

#[async_trait]
impl BackendPool for PgClusterPool {
    type Rows = Vec<PgRow>;
    type Connection = PoolConnection<Postgres>;

    async fn verify(&self) -> Result<Verification> {
        let row = sqlx::query(VERIFY_SQL)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error)?;

        Ok(Verification {
            server_time: row.try_get::<DateTime<Utc>, _>("now").map_err(query_error)?,
            in_recovery: row.try_get::<bool, _>("in_recovery").map_err(query_error)?,
            server_version: row.try_get::<String, _>("version").map_err(query_error)?,
        })
    }

    async fn query(&self, sql: &str, params: &[QueryParam]) -> Result<Vec<PgRow>> {
        let query = params
            .iter()
            .fold(sqlx::query(sql), |query, param| bind_param(query, param));

        query.fetch_all(&self.pool).await.map_err(query_error)
    }

    async fn acquire(&self) -> Result<PoolConnection<Postgres>> {
        self.pool.acquire().await.map_err(query_error)
    }

    fn stats(&self) -> PoolStats {
        if self.pool.is_closed() {
            return PoolStats {
                max_connections: self.max_connections,
                ..Default::default()
            };
        }
        PoolStats::new(self.pool.size(), self.pool.num_idle() as u32, self.max_connections)
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
