//! The interceptor data source.
//!
//! Wraps the driver adapter and the caller-supplied on-acquire visitor:
//! every connection this source produces has been visited exactly once
//! before it is yielded. The pool engine also routes idle checkouts through
//! [`ConnectSource::visit`] so the visitor runs once per checkout, whatever
//! the connection's origin.

use std::sync::Arc;

use futures_core::future::BoxFuture;

use crate::connection::{Connection, Driver};
use crate::error::{Error, Result};
use crate::tls::DriverTarget;

/// Caller-supplied visitor invoked on every freshly checked-out connection.
pub type OnAcquire<C> =
    Arc<dyn for<'c> Fn(&'c mut C) -> BoxFuture<'c, Result<()>> + Send + Sync>;

pub(crate) struct ConnectSource<C: Connection> {
    driver: Arc<dyn Driver<Connection = C>>,
    driver_class: String,
    target: DriverTarget,
    on_acquire: Option<OnAcquire<C>>,
}

impl<C: Connection> ConnectSource<C> {
    pub(crate) fn new(
        driver: Arc<dyn Driver<Connection = C>>,
        driver_class: String,
        target: DriverTarget,
        on_acquire: Option<OnAcquire<C>>,
    ) -> Self {
        Self {
            driver,
            driver_class,
            target,
            on_acquire,
        }
    }

    /// Materialize a fresh physical connection and run the visitor on it.
    ///
    /// If the visitor fails the connection is closed and the failure is
    /// surfaced as [`Error::Hook`]; it is never handed out unvisited.
    pub(crate) async fn connect(&self) -> Result<C> {
        let mut conn = self
            .driver
            .materialize(&self.target.url, &self.driver_class, &self.target.props)
            .await?;

        if let Err(err) = self.visit(&mut conn).await {
            let _ = conn.close().await;
            return Err(err);
        }

        Ok(conn)
    }

    /// Run the visitor once against an already-open connection.
    pub(crate) async fn visit(&self, conn: &mut C) -> Result<()> {
        if let Some(visitor) = &self.on_acquire {
            visitor(conn).await.map_err(|err| match err {
                err @ Error::Hook(_) => err,
                other => Error::Hook(Box::new(other)),
            })?;
        }

        Ok(())
    }
}
