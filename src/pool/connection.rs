//! Checked-out connection handles and the internal record wrappers.

use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::time::Instant;

use crate::connection::Connection;
use crate::error::Result;
use crate::pool::engine::{DecrementSizeGuard, PoolEngine};

/// A connection checked out from a [`Pool`][crate::Pool].
///
/// Dereferences to the raw driver connection. Returned to the pool on-drop;
/// the handle is uniquely owned, so a connection can only ever be released
/// once, and handing it to another task is an explicit move.
pub struct PoolConnection<C: Connection> {
    live: Option<Live<C>>,
    engine: Arc<PoolEngine<C>>,
}

/// A record with a caller or on its way to/from one.
pub(super) struct Live<C> {
    pub(super) raw: C,
    pub(super) id: u64,
    pub(super) created: Instant,
}

/// A record parked in the idle queue.
pub(super) struct Idle<C> {
    pub(super) live: Live<C>,
    pub(super) since: Instant,
}

/// RAII wrapper for records being handled by functions that may drop them;
/// dropping the wrapper gives its size reservation back to the engine.
pub(super) struct Floating<C: Connection, S> {
    pub(super) inner: S,
    pub(super) guard: DecrementSizeGuard<C>,
}

const EXPECT_MSG: &str = "BUG: inner connection already taken";

impl<C: Connection> Debug for PoolConnection<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConnection")
            .field("id", &self.live.as_ref().map(|live| live.id))
            .finish()
    }
}

impl<C: Connection> Deref for PoolConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.live.as_ref().expect(EXPECT_MSG).raw
    }
}

impl<C: Connection> DerefMut for PoolConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.live.as_mut().expect(EXPECT_MSG).raw
    }
}

impl<C: Connection> PoolConnection<C> {
    /// Close this connection gracefully, allowing the pool to open a
    /// replacement.
    pub async fn close(mut self) -> Result<()> {
        let floating = self
            .live
            .take()
            .expect(EXPECT_MSG)
            .float(Arc::clone(&self.engine));
        floating.close_raw().await
    }

    fn return_to_pool(&mut self) -> impl Future<Output = ()> + Send + 'static {
        // Float the record before moving into the task, in case the future
        // is never polled (e.g. spawned into a dying runtime): the size
        // reservation is then still released by the guard's drop.
        let floating = self
            .live
            .take()
            .map(|live| live.float(Arc::clone(&self.engine)));

        async move {
            if let Some(floating) = floating {
                floating.return_to_pool().await;
            }
        }
    }
}

/// Returns the connection to the pool it was checked out from.
impl<C: Connection> Drop for PoolConnection<C> {
    fn drop(&mut self) {
        if self.live.is_some() {
            tokio::task::spawn(self.return_to_pool());
        }
    }
}

impl<C> Live<C> {
    pub(super) fn into_idle(self) -> Idle<C> {
        Idle {
            live: self,
            since: Instant::now(),
        }
    }
}

impl<C: Connection> Live<C> {
    pub(super) fn float(self, engine: Arc<PoolEngine<C>>) -> Floating<C, Live<C>> {
        Floating {
            inner: self,
            // re-adopt the size reservation that `reattach` handed to the
            // `PoolConnection`
            guard: DecrementSizeGuard::new(engine),
        }
    }
}

impl<C: Connection> Floating<C, Live<C>> {
    pub(super) fn new_live(raw: C, id: u64, guard: DecrementSizeGuard<C>) -> Self {
        Floating {
            inner: Live {
                raw,
                id,
                created: Instant::now(),
            },
            guard,
        }
    }

    /// Hand the record to a caller as a [`PoolConnection`].
    pub(super) fn reattach(self) -> PoolConnection<C> {
        let Floating { inner, guard } = self;

        let engine = Arc::clone(guard.engine());

        guard.cancel();
        PoolConnection {
            live: Some(inner),
            engine,
        }
    }

    /// Return the record to the idle set, unless the pool has closed or the
    /// record has outlived its maximum age.
    pub(super) async fn return_to_pool(self) {
        let engine = Arc::clone(self.guard.engine());

        if engine.is_closed() {
            self.close_raw().await.ok();
            return;
        }

        if let Some(max_age) = engine.config().max_connection_age {
            if self.inner.created.elapsed() >= max_age {
                tracing::debug!(
                    conn_id = %engine.config().conn_id,
                    connection = self.inner.id,
                    "evicting connection past max age"
                );
                self.close_raw().await.ok();
                return;
            }
        }

        engine.release(self);
    }

    pub(super) fn release(self) {
        let engine = Arc::clone(self.guard.engine());
        engine.release(self);
    }

    /// Close the physical connection gracefully. The guard drops with
    /// `self`, releasing the record's slot.
    pub(super) async fn close_raw(self) -> Result<()> {
        self.guard.engine().forget_checkout(self.inner.id);
        self.inner.raw.close().await
    }

    pub(super) fn into_idle(self) -> Floating<C, Idle<C>> {
        Floating {
            inner: self.inner.into_idle(),
            guard: self.guard,
        }
    }
}

impl<C: Connection> Floating<C, Idle<C>> {
    pub(super) fn from_idle(idle: Idle<C>, engine: Arc<PoolEngine<C>>) -> Self {
        Floating {
            inner: idle,
            guard: DecrementSizeGuard::new(engine),
        }
    }

    pub(super) fn into_live(self) -> Floating<C, Live<C>> {
        Floating {
            inner: self.inner.live,
            guard: self.guard,
        }
    }

    pub(super) async fn close_raw(self) -> Result<()> {
        self.inner.live.raw.close().await
    }
}

impl<C: Connection, S> Deref for Floating<C, S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<C: Connection, S> DerefMut for Floating<C, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
