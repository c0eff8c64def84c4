//! Floating IP pool management
//!
//! A durable, transactional allocator for externally-routable IPv4
//! addresses, partitioned by routable subnet. The [`Ipam`] facade sits on
//! top of an [`AllocationStore`]; the SQL implementation is the production
//! backend, and a `BTreeMap`-backed one is available for tests.
//!
//! # Example
//!
//! ```no_run
//! use fip_ipam::{FipConf, Ipam, SqlStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqlStore::connect("sqlite://floatingip.db", 5).await?;
//! let ipam = Ipam::new(Arc::new(store));
//!
//! let confs: Vec<FipConf> = serde_json::from_str(
//!     r#"[{"routableSubnet":"10.0.0.0/24","ips":["10.0.0.2~10.0.0.30"],"gateway":"10.0.0.1"}]"#,
//! )?;
//! ipam.configure_pool(&confs).await?;
//!
//! let subnet = "10.0.0.0/24".parse()?;
//! let ip = ipam.allocate_in_subnet("default_web-0", &subnet, "node-1").await?;
//! ipam.release(&["default_web-0".to_string()]).await?;
//! # let _ = ip;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod ipam;
pub mod models;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod sql;
pub mod store;

pub use error::{IpamError, StoreError};
pub use ipam::Ipam;
pub use models::{AllocationRecord, FipConf, FipRange, IpInfo, PoolEntry, ReleasePolicy};
#[cfg(any(test, feature = "test-util"))]
pub use mock::MemoryStore;
pub use sql::SqlStore;
pub use store::{AllocationStore, PoolSeed};
