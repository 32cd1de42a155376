pub mod backend;
pub mod directory;
pub mod inventory;
pub mod locator;
pub mod manager;
pub mod postgres;
pub mod probe;
pub mod scheduler;
pub mod session;

pub use backend::{noop_hook, Backend, BackendPool, ErrorHook};
pub use directory::{Discovery, InstanceDirectory};
pub use inventory::{inventory_from_config, DnsInventory, Ec2Inventory, InventorySource, StaticInventory};
pub use locator::LeaderLocator;
pub use manager::{ClusterManager, Connection, Rows};
pub use postgres::{PgBackend, PgClusterPool};
pub use probe::{AssumeLeaderProbe, HttpLeaderProbe, LeaderProbe};
pub use scheduler::Scheduler;
pub use session::Session;

pub use crudapp_common::{
    ClusterConfig, ClusterError, ClusterStats, ConnectionReport, ErrorKind, InventoryConfig,
    ManagerState, MemberAddress, PoolStats, QueryParam, Result, Verification,
};
