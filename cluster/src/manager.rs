use crate::backend::{Backend, BackendPool, ErrorHook};
use crate::directory::{Discovery, InstanceDirectory};
use crate::inventory::{inventory_from_config, InventorySource};
use crate::locator::LeaderLocator;
use crate::postgres::PgBackend;
use crate::probe::{AssumeLeaderProbe, HttpLeaderProbe, LeaderProbe};
use crate::scheduler::Scheduler;
use crate::session::Session;
use crudapp_common::{
    ClusterConfig, ClusterError, ClusterStats, ConnectionReport, ManagerState, MemberAddress,
    PoolStats, QueryParam, Result,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Rows produced by a query through a manager over backend `B`
pub type Rows<B> = <<B as Backend>::Pool as BackendPool>::Rows;

/// Checked-out connection from a manager over backend `B`
pub type Connection<B> = <<B as Backend>::Pool as BackendPool>::Connection;

/// Cluster connection manager - keeps one session bound to the current leader
///
/// Cheap to clone; every clone drives the same manager. Background work holds
/// weak references only, so dropping every handle stops it as well.
pub struct ClusterManager<B: Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for ClusterManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<B: Backend> {
    config: ClusterConfig,
    backend: B,
    discovery: Discovery,
    locator: LeaderLocator,

    /// Active session; swapped atomically, never observed half-replaced
    session: RwLock<Option<Arc<Session<B::Pool>>>>,
    current_leader: RwLock<Option<MemberAddress>>,
    state: Mutex<ManagerState>,

    /// Held by the single reconnection in flight
    reconnecting: AtomicBool,
    shutting_down: AtomicBool,
    reconnections: AtomicU64,

    scheduler: Scheduler,
}

impl ClusterManager<PgBackend> {
    /// PostgreSQL manager with the inventory and probe named in `config`
    pub fn from_config(config: ClusterConfig) -> Result<Self> {
        let inventory = inventory_from_config(&config);
        let probe: Arc<dyn LeaderProbe> = if config.verify_leader {
            Arc::new(HttpLeaderProbe::from_config(&config)?)
        } else {
            Arc::new(AssumeLeaderProbe)
        };

        Self::new(
            config,
            PgBackend::new().with_application_name("crudapp"),
            inventory,
            probe,
        )
    }
}

impl<B: Backend> ClusterManager<B> {
    pub fn new(
        config: ClusterConfig,
        backend: B,
        inventory: Arc<dyn InventorySource>,
        probe: Arc<dyn LeaderProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let locator = LeaderLocator::new(probe, config.fallback_to_first_member);

        Ok(Self {
            inner: Arc::new(Inner {
                discovery: Discovery::new(inventory),
                locator,
                backend,
                session: RwLock::new(None),
                current_leader: RwLock::new(None),
                state: Mutex::new(ManagerState::Uninitialized),
                reconnecting: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                reconnections: AtomicU64::new(0),
                scheduler: Scheduler::new(),
                config,
            }),
        })
    }

    /// Discover members, connect to the leader and start background work.
    ///
    /// Fails without retrying when discovery finds no members; fails after
    /// `max_retries` attempts when no writable leader can be connected.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ManagerState::Uninitialized => *state = ManagerState::Initializing,
                ManagerState::ShuttingDown | ManagerState::Closed => {
                    return Err(ClusterError::ShuttingDown)
                }
                _ => return Err(ClusterError::AlreadyInitialized),
            }
        }

        info!("Initializing cluster connection manager");
        let started = Instant::now();

        match self.inner.connect_initial().await {
            Ok(()) => {
                self.inner.set_state(ManagerState::Connected);
                self.start_background();
                info!(
                    member = ?self.current_leader(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Cluster manager initialized"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to initialize cluster manager");
                self.inner.set_state(ManagerState::Uninitialized);
                Err(e)
            }
        }
    }

    fn start_background(&self) {
        let scheduler = &self.inner.scheduler;

        let weak = Arc::downgrade(&self.inner);
        scheduler.spawn_periodic("discovery", self.inner.config.discovery_interval(), move || {
            let weak: Weak<Inner<B>> = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                if !inner.shutting_down.load(Ordering::SeqCst) {
                    inner.discovery.discover().await;
                }
                true
            }
        });

        let weak = Arc::downgrade(&self.inner);
        scheduler.spawn_periodic(
            "health-check",
            self.inner.config.health_check_interval(),
            move || {
                let weak: Weak<Inner<B>> = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return false;
                    };
                    inner.health_check().await;
                    true
                }
            },
        );
    }

    /// Run a statement against the active member.
    ///
    /// Connection-class failures schedule a background reconnection and are
    /// still returned; the statement is never replayed.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> Result<Rows<B>> {
        let session = self.inner.active_session()?;
        let started = Instant::now();

        match session.query(sql, params).await {
            Ok(rows) => {
                let elapsed = started.elapsed();
                metrics::histogram!("crudapp_cluster_query_duration_seconds")
                    .record(elapsed.as_secs_f64());
                debug!(
                    member = %session.member(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Query executed"
                );
                Ok(rows)
            }
            Err(e) => {
                self.inner.on_query_error(&e);
                Err(e)
            }
        }
    }

    /// Check out a connection from the active pool for multi-statement work
    pub async fn get_connection(&self) -> Result<Connection<B>> {
        let session = self.inner.active_session()?;
        match session.acquire().await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                self.inner.on_query_error(&e);
                Err(e)
            }
        }
    }

    /// Re-discover, re-locate and reconnect.
    ///
    /// Returns `false` without doing anything unless the manager is
    /// connected with no other reconnection running.
    pub async fn handle_connection_loss(&self, reason: &str) -> bool {
        self.inner.handle_connection_loss(reason).await
    }

    /// Run the verification query on the active member and report the outcome
    pub async fn test_connection(&self) -> ConnectionReport {
        let members = self.directory().members().to_vec();

        let session = match self.inner.active_session() {
            Ok(session) => session,
            Err(e) => return ConnectionReport::failed(e.to_string(), self.current_leader(), members),
        };

        match session.verify().await {
            Ok(verification) => ConnectionReport {
                success: true,
                server_time: Some(verification.server_time),
                server_version: Some(verification.server_version),
                is_replica: Some(verification.in_recovery),
                leader: Some(session.member().clone()),
                members,
                error: None,
            },
            Err(e) => {
                self.inner.on_query_error(&e);
                ConnectionReport::failed(e.to_string(), Some(session.member().clone()), members)
            }
        }
    }

    pub fn stats(&self) -> ClusterStats {
        let directory = self.inner.discovery.directory();
        let session = self.inner.session.read().clone();

        ClusterStats {
            state: self.state(),
            active_member: session.as_ref().map(|s| s.member().clone()),
            directory_size: directory.len(),
            members: directory.members().to_vec(),
            pool: session.as_ref().map(|s| s.stats()).unwrap_or(PoolStats {
                max_connections: self.inner.config.max_connections,
                ..Default::default()
            }),
            reconnections: self.inner.reconnections.load(Ordering::Relaxed),
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.inner.state.lock()
    }

    /// Member backing the active session
    pub fn current_leader(&self) -> Option<MemberAddress> {
        self.inner.current_leader.read().clone()
    }

    pub fn directory(&self) -> InstanceDirectory {
        self.inner.discovery.directory()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Stop background work and close the active pool.
    ///
    /// Returns once every connection is closed. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Cluster manager already shut down");
            return;
        }

        info!("Shutting down cluster manager");
        self.inner.set_state(ManagerState::ShuttingDown);

        self.inner.scheduler.shutdown().await;

        let session = self.inner.session.write().take();
        if let Some(session) = session {
            session.close().await;
        }
        *self.inner.current_leader.write() = None;

        self.inner.set_state(ManagerState::Closed);
        info!("Cluster manager shut down");
    }
}

/// Clears the reconnecting flag when the reconnection ends, however it ends
struct ReconnectGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<B: Backend> Inner<B> {
    fn set_state(&self, next: ManagerState) {
        let mut state = self.state.lock();
        let closing = matches!(*state, ManagerState::ShuttingDown | ManagerState::Closed);
        if closing && next != ManagerState::Closed {
            return;
        }
        let current = *state;
        if current != next {
            debug!(from = %current, to = %next, "Manager state changed");
            *state = next;
        }
    }

    fn active_session(&self) -> Result<Arc<Session<B::Pool>>> {
        match self.session.read().clone() {
            Some(session) => Ok(session),
            None if self.shutting_down.load(Ordering::SeqCst) => Err(ClusterError::ShuttingDown),
            None => Err(ClusterError::NotConnected),
        }
    }

    async fn connect_initial(self: &Arc<Self>) -> Result<()> {
        let directory = self.discovery.discover().await;
        if directory.is_empty() {
            return Err(ClusterError::NoMembers);
        }
        self.connect_with_retry().await
    }

    /// Locate the leader and connect, with bounded attempts and fixed backoff
    async fn connect_with_retry(self: &Arc<Self>) -> Result<()> {
        let max_attempts = self.config.max_retries;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(ClusterError::ShuttingDown);
            }

            let result = match self.try_connect(attempt).await {
                Ok(session) => self.install(session).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    metrics::counter!("crudapp_cluster_connect_attempts_total", "outcome" => "success")
                        .increment(1);
                    return Ok(());
                }
                Err(ClusterError::ShuttingDown) => return Err(ClusterError::ShuttingDown),
                Err(e) => {
                    metrics::counter!("crudapp_cluster_connect_attempts_total", "outcome" => "failure")
                        .increment(1);
                    error!(attempt, max_attempts, error = %e, "Connection attempt failed");

                    if attempt >= max_attempts {
                        return Err(ClusterError::RetriesExhausted {
                            attempts: max_attempts,
                            last: Box::new(e),
                        });
                    }

                    info!(
                        delay_ms = self.config.retry_delay_ms,
                        "Retrying connection"
                    );
                    if !self.scheduler.sleep(self.config.retry_delay()).await {
                        return Err(ClusterError::ShuttingDown);
                    }
                }
            }
        }
    }

    async fn try_connect(self: &Arc<Self>, attempt: u32) -> Result<Session<B::Pool>> {
        let directory = self.discovery.directory();
        let member = self
            .locator
            .locate(&directory)
            .await
            .ok_or(ClusterError::NoLeaderCandidate)?;

        info!(member = %member, attempt, "Connecting to leader candidate");
        Session::connect(&self.backend, &member, &self.config, self.error_hook()).await
    }

    /// Make `session` the active one and retire the previous session
    async fn install(self: &Arc<Self>, session: Session<B::Pool>) -> Result<()> {
        let session = Arc::new(session);

        let swapped = {
            let mut slot = self.session.write();
            if self.shutting_down.load(Ordering::SeqCst) {
                None
            } else {
                Some(slot.replace(session.clone()))
            }
        };

        let Some(previous) = swapped else {
            session.close().await;
            return Err(ClusterError::ShuttingDown);
        };

        let member = session.member().clone();
        let old_leader = self.current_leader.write().replace(member.clone());
        match old_leader {
            Some(old) if old != member => {
                warn!(from = %old, to = %member, "Leader changed");
                metrics::counter!("crudapp_cluster_leader_changes_total").increment(1);
            }
            None => info!(member = %member, "Connected to leader"),
            _ => {}
        }

        if let Some(previous) = previous {
            let retired = previous.clone();
            if !self.scheduler.spawn(async move { retired.close().await }) {
                previous.close().await;
            }
        }

        Ok(())
    }

    /// Pool-level failure callback handed to every session
    fn error_hook(self: &Arc<Self>) -> ErrorHook {
        let weak = Arc::downgrade(self);
        Arc::new(move |err: &ClusterError| {
            if !err.is_connection_loss() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                error!(error = %err, "Pool error");
                inner.schedule_reconnect("pool error");
            }
        })
    }

    fn on_query_error(self: &Arc<Self>, err: &ClusterError) {
        let kind = err.kind();
        error!(error = %err, kind = kind.as_str(), "Query error");
        metrics::counter!("crudapp_cluster_query_errors_total", "kind" => kind.as_str()).increment(1);

        if kind.is_connection_loss() {
            self.schedule_reconnect("query failure");
        }
    }

    /// Start a reconnection in the background unless one is already running
    fn schedule_reconnect(self: &Arc<Self>, reason: &'static str) {
        if self.shutting_down.load(Ordering::SeqCst) || self.reconnecting.load(Ordering::SeqCst) {
            return;
        }

        let inner = self.clone();
        self.scheduler.spawn(async move {
            inner.handle_connection_loss(reason).await;
        });
    }

    async fn health_check(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) || self.reconnecting.load(Ordering::SeqCst) {
            return;
        }

        let Some(member) = self.session.read().as_ref().map(|s| s.member().clone()) else {
            return;
        };

        if self.locator.probe().is_leader(&member).await {
            debug!(member = %member, "Health check passed");
            return;
        }

        warn!(member = %member, "Current member is no longer the leader");
        self.handle_connection_loss("leader lost").await;
    }

    async fn handle_connection_loss(self: &Arc<Self>, reason: &str) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(reason, "Reconnection already in progress");
            return false;
        }
        let _guard = ReconnectGuard(&self.reconnecting);

        // Only an established connection can be lost
        {
            let mut state = self.state.lock();
            let current = *state;
            if current != ManagerState::Connected {
                debug!(reason, state = %current, "Not connected, ignoring connection loss");
                return false;
            }
            debug!(from = %current, to = %ManagerState::Reconnecting, "Manager state changed");
            *state = ManagerState::Reconnecting;
        }

        let previous = self.current_leader.read().clone();
        warn!(reason, member = ?previous, "Connection lost, attempting to reconnect");
        let started = Instant::now();

        self.discovery.discover().await;
        let result = self.connect_with_retry().await;
        self.reconnections.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(()) => {
                info!(
                    member = ?self.current_leader.read().clone(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Reconnection successful"
                );
                metrics::counter!("crudapp_cluster_reconnections_total", "outcome" => "success")
                    .increment(1);
            }
            Err(e) => {
                error!(
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Reconnection failed, will retry on next trigger"
                );
                metrics::counter!("crudapp_cluster_reconnections_total", "outcome" => "failure")
                    .increment(1);
            }
        }

        self.set_state(ManagerState::Connected);
        true
    }
}
