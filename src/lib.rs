//! An adaptive database connection pool.
//!
//! `tidepool` brokers a fixed-capacity set of live database connections
//! between concurrent tasks: it hides connection establishment latency
//! behind warm idle records, validates connections on checkout, and bounds
//! every wait with the configured timeout. When the pool is starved at
//! nominal capacity, it temporarily widens itself by a small *overdrive*
//! allowance that is rescinded after a cooldown. See the [`pool`] module
//! docs for the lifecycle.
//!
//! The database itself stays behind two small traits: [`Driver`]
//! materializes physical connections from a URL and a property bag, and
//! [`Connection`] gives the pool the verbs it needs to validate and close
//! them.
//!
//! ```no_run
//! use futures_core::future::BoxFuture;
//! use tidepool::{Connection, DbKind, Driver, Pool, PoolConfig, PropertyBag, Result};
//!
//! struct H2Conn;
//!
//! impl Connection for H2Conn {
//!     fn execute<'c>(&'c mut self, _sql: &'c str) -> BoxFuture<'c, Result<()>> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn close(self) -> BoxFuture<'static, Result<()>> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//!
//! struct H2Driver;
//!
//! impl Driver for H2Driver {
//!     type Connection = H2Conn;
//!
//!     fn materialize<'a>(
//!         &'a self,
//!         _url: &'a str,
//!         _driver_class: &'a str,
//!         _props: &'a PropertyBag,
//!     ) -> BoxFuture<'a, Result<Self::Connection>> {
//!         Box::pin(async { Ok(H2Conn) })
//!     }
//! }
//!
//! # async fn example() -> Result<()> {
//! let config = PoolConfig::builder("main")
//!     .url("jdbc:h2:mem:app")
//!     .db_kind(DbKind::H2)
//!     .credentials("app", "secret")
//!     .max_connections(8)
//!     .build()?;
//!
//! let pool = Pool::builder(config, H2Driver).build();
//!
//! let conn = pool.acquire().await?;
//! drop(conn); // returned to the pool
//!
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod error;
pub mod pool;
mod rng;
mod source;
mod tls;

pub use config::{DbKind, PoolConfig, PoolConfigBuilder, Protocol};
pub use connection::{Connection, Driver, PropertyBag};
pub use error::{Error, Result};
pub use pool::{CloseTrace, Pool, PoolBuilder, PoolConnection, PoolStats};
pub use rng::RngPool;
pub use source::OnAcquire;
pub use tls::{NONSECURE_URL_SUFFIX, SECURE_URL_SUFFIX};
