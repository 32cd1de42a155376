pub mod config;
pub mod error;
pub mod types;
pub mod url;

pub use config::*;
pub use error::{ClusterError, ErrorKind, Result};
pub use types::*;
pub use url::ConnectionUrl;
