//! The adaptive pool: a lock-free lifecycle state machine over the engine.
//!
//! The pool moves through *zero → normal → elevated → normal → closed*.
//! Every transition is an optimistic compare-and-swap of one immutable
//! snapshot; a caller that loses a race simply restarts from the state it
//! observes next. Nothing on the acquire path ever holds a lock across
//! I/O; only `init()` and `close()` serialize, against themselves and
//! each other.
//!
//! A checkout timing out against a pool at nominal capacity *elevates* it:
//! the admission threshold is widened by the configured overdrive (11 by
//! default) and the acquire retries once. The widened pool is demoted back
//! to nominal the first time it is observed after a 30 second cooldown, so
//! a transient storm gets a relief valve without the capacity oscillating.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_core::future::BoxFuture;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::connection::{Connection, Driver};
use crate::error::{Error, Result};
use crate::source::{ConnectSource, OnAcquire};
use crate::tls;

mod connection;
mod engine;
mod state;

pub use connection::PoolConnection;
pub use state::CloseTrace;

use connection::Floating;
use engine::PoolEngine;
use state::PoolState;

/// How long an elevated pool stays widened before the next observer
/// restores nominal capacity.
pub(crate) const COOLDOWN: Duration = Duration::from_millis(30_000);

/// Acquisitions slower than this are logged at warning level.
const SLOW_ACQUIRE_WARN: Duration = Duration::from_millis(1_000);

const FAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const FAULT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// A point-in-time view of pool occupancy, for metrics sinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Records checked out to callers.
    pub busy: u32,
    /// Records parked in the idle set.
    pub idle: u32,
    /// All live records, busy or idle.
    pub total: u32,
    /// Callers parked waiting for a record.
    pub waiting: u32,
}

/// An adaptive pool of database connections.
///
/// Cheap to construct and to clone (it is a reference-counted handle): no
/// I/O happens until [`init`][Pool::init] or the first
/// [`acquire`][Pool::acquire]. See the [module docs][self] for the
/// lifecycle.
pub struct Pool<C: Connection>(Arc<PoolShared<C>>);

struct PoolShared<C: Connection> {
    config: Arc<PoolConfig>,
    driver: Arc<dyn Driver<Connection = C>>,
    on_acquire: Option<OnAcquire<C>>,
    state: ArcSwap<PoolState<C>>,
    /// Serializes `init` and `close` against themselves and each other.
    /// The acquire path never takes it.
    lifecycle: tokio::sync::Mutex<()>,
}

/// Assembles a [`Pool`]; see [`Pool::builder`].
pub struct PoolBuilder<C: Connection> {
    config: PoolConfig,
    driver: Arc<dyn Driver<Connection = C>>,
    on_acquire: Option<OnAcquire<C>>,
}

impl<C: Connection> PoolBuilder<C> {
    /// Visit every connection once per successful checkout, before it is
    /// handed to the caller.
    ///
    /// The visitor must be cheap, a short health check at most. If it
    /// fails, the connection is closed and the acquire surfaces
    /// [`Error::Hook`].
    pub fn on_acquire<F>(mut self, visitor: F) -> Self
    where
        for<'c> F: Fn(&'c mut C) -> BoxFuture<'c, Result<()>> + Send + Sync + 'static,
    {
        self.on_acquire = Some(Arc::new(visitor));
        self
    }

    /// Build the pool in its uninitialized state. No I/O happens here.
    pub fn build(self) -> Pool<C> {
        Pool(Arc::new(PoolShared {
            config: Arc::new(self.config),
            driver: self.driver,
            on_acquire: self.on_acquire,
            state: ArcSwap::from_pointee(PoolState::Zero),
            lifecycle: tokio::sync::Mutex::new(()),
        }))
    }
}

impl<C: Connection> Pool<C> {
    pub fn builder<D>(config: PoolConfig, driver: D) -> PoolBuilder<C>
    where
        D: Driver<Connection = C>,
    {
        PoolBuilder {
            config,
            driver: Arc::new(driver),
            on_acquire: None,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.0.config
    }

    /// Retrieves a connection, waiting at most the configured checkout
    /// timeout for one to become available.
    ///
    /// Lazily initializes the pool on first use. If the wait times out
    /// against a pool at nominal capacity, the pool is elevated and the
    /// acquire retried once; a second timeout is returned to the caller.
    pub async fn acquire(&self) -> Result<PoolConnection<C>> {
        let started = Instant::now();
        let result = self.acquire_inner().await;
        let elapsed = started.elapsed();

        if result.is_ok() {
            if elapsed >= SLOW_ACQUIRE_WARN {
                let stats = self.stats();
                tracing::warn!(
                    conn_id = %self.0.config.conn_id,
                    ?elapsed,
                    busy = stats.busy,
                    idle = stats.idle,
                    total = stats.total,
                    waiting = stats.waiting,
                    "slow connection acquire"
                );
            } else {
                tracing::debug!(
                    conn_id = %self.0.config.conn_id,
                    ?elapsed,
                    "acquired connection"
                );
            }
        }

        result
    }

    async fn acquire_inner(&self) -> Result<PoolConnection<C>> {
        loop {
            let snap = self.0.state.load_full();

            match &*snap {
                PoolState::Zero => {
                    self.initialize().await?;
                }

                PoolState::Faulted {
                    backoff_until,
                    attempts,
                    message,
                } => {
                    if Instant::now() < *backoff_until {
                        return Err(Error::init(format!(
                            "initialization backing off after {attempts} failed attempt(s): {message}"
                        )));
                    }

                    self.initialize().await?;
                }

                PoolState::Normal { engine } => match engine.acquire().await {
                    Ok(live) => return Ok(live.reattach()),
                    Err(Error::PoolTimedOut) => self.elevate(&snap, engine),
                    Err(other) => return Err(other),
                },

                PoolState::Elevated { engine, since } => {
                    if since.elapsed() >= COOLDOWN {
                        self.demote(&snap, engine);
                        continue;
                    }

                    // Still within the relief window; a timeout here goes
                    // to the caller.
                    return engine.acquire().await.map(Floating::reattach);
                }

                PoolState::Closed { trace } => {
                    return Err(Error::PoolClosed(Arc::clone(trace)));
                }
            }
        }
    }

    fn elevate(&self, snap: &Arc<PoolState<C>>, engine: &Arc<PoolEngine<C>>) {
        let elevated = self.0.config.elevated_max();

        // The widened threshold is stored as an absolute value before the
        // snapshot is published: racing elevations are idempotent, and an
        // observer of the elevated snapshot always sees the wide engine.
        engine.set_max_size(elevated);

        let next = Arc::new(PoolState::Elevated {
            engine: Arc::clone(engine),
            since: Instant::now(),
        });

        let prev = self.0.state.compare_and_swap(snap, next);
        if Arc::ptr_eq(&prev, snap) {
            tracing::warn!(
                conn_id = %self.0.config.conn_id,
                max_size = elevated,
                "checkout timed out at nominal capacity; elevating pool"
            );
        }
        // A lost race means another actor already transitioned: either an
        // identical elevation, or a close, where the store above touched a
        // dead engine. The caller retries against whatever is published now.
    }

    fn demote(&self, snap: &Arc<PoolState<C>>, engine: &Arc<PoolEngine<C>>) {
        let next = Arc::new(PoolState::Normal {
            engine: Arc::clone(engine),
        });

        let prev = self.0.state.compare_and_swap(snap, next);
        if Arc::ptr_eq(&prev, snap) {
            // Only the winner narrows the engine; losers restart from the
            // published snapshot.
            engine.set_max_size(self.0.config.max_connections);
            tracing::info!(
                conn_id = %self.0.config.conn_id,
                max_size = self.0.config.max_connections,
                "cooldown elapsed; pool restored to nominal capacity"
            );
        }
    }

    /// Eagerly initialize the pool.
    ///
    /// Idempotent while the pool is serving; fails with
    /// [`Error::PoolClosed`] once closed. A transient failure leaves the
    /// pool in a backoff window from which the next caller retries; an
    /// invalid configuration closes the pool permanently.
    pub async fn init(&self) -> Result<()> {
        self.initialize().await
    }

    async fn initialize(&self) -> Result<()> {
        let _lifecycle = self.0.lifecycle.lock().await;

        // Someone may have transitioned while we waited for the lock.
        let attempts = match &*self.0.state.load_full() {
            PoolState::Zero => 0,
            PoolState::Normal { .. } | PoolState::Elevated { .. } => return Ok(()),
            PoolState::Faulted {
                backoff_until,
                attempts,
                message,
            } => {
                if Instant::now() < *backoff_until {
                    return Err(Error::init(format!(
                        "initialization backing off after {attempts} failed attempt(s): {message}"
                    )));
                }

                *attempts
            }
            PoolState::Closed { trace } => return Err(Error::PoolClosed(Arc::clone(trace))),
        };

        match self.start_engine().await {
            Ok(engine) => {
                self.0.state.store(Arc::new(PoolState::Normal { engine }));
                tracing::info!(conn_id = %self.0.config.conn_id, "pool initialized");
                Ok(())
            }
            Err(err) => {
                // The configuration is immutable for the life of the pool,
                // so a configuration error recurs on every retry: fatal to
                // this instance, not a backoff case.
                if matches!(err, Error::Configuration(_)) {
                    self.0.state.store(Arc::new(PoolState::Closed {
                        trace: Arc::new(CloseTrace::capture()),
                    }));
                    tracing::error!(
                        conn_id = %self.0.config.conn_id,
                        error = %err,
                        "pool configuration is invalid; pool closed"
                    );
                    return Err(err);
                }

                let attempts = attempts + 1;
                let backoff = (FAULT_BACKOFF_BASE * 2u32.pow((attempts - 1).min(6)))
                    .min(FAULT_BACKOFF_CAP);

                tracing::error!(
                    conn_id = %self.0.config.conn_id,
                    attempts,
                    ?backoff,
                    error = %err,
                    "pool initialization failed; backing off"
                );

                self.0.state.store(Arc::new(PoolState::Faulted {
                    backoff_until: Instant::now() + backoff,
                    attempts,
                    message: err.to_string().into(),
                }));

                Err(match err {
                    err @ Error::PoolClosed(_) => err,
                    other => Error::Init(Box::new(other)),
                })
            }
        }
    }

    /// Build, warm, and prove a fresh engine before publishing it.
    async fn start_engine(&self) -> Result<Arc<PoolEngine<C>>> {
        let target = tls::assemble(&self.0.config)?;
        tracing::debug!(
            conn_id = %self.0.config.conn_id,
            url = %target.url,
            props = ?target.props,
            "assembled driver target"
        );

        let source = ConnectSource::new(
            Arc::clone(&self.0.driver),
            self.0.config.driver_class.clone(),
            target,
            self.0.on_acquire.clone(),
        );

        let engine = PoolEngine::new_arc(Arc::clone(&self.0.config), source);

        if let Err(err) = engine.start().await {
            engine.close(Arc::new(CloseTrace::capture())).await;
            return Err(err);
        }

        // Checkout-and-return one connection: the pool must be able to
        // serve before anyone sees it.
        match engine.acquire().await {
            Ok(conn) => conn.release(),
            Err(err) => {
                engine.close(Arc::new(CloseTrace::capture())).await;
                return Err(err);
            }
        }

        Ok(engine)
    }

    /// Close the pool permanently.
    ///
    /// Waiting acquires are woken with [`Error::PoolClosed`] immediately;
    /// this method resolves once every record has been closed. Idempotent.
    pub async fn close(&self) {
        let _lifecycle = self.0.lifecycle.lock().await;

        let snap = self.0.state.load_full();
        let trace = Arc::new(CloseTrace::capture());

        match &*snap {
            PoolState::Closed { .. } => return,
            PoolState::Normal { engine } | PoolState::Elevated { engine, .. } => {
                engine.close(Arc::clone(&trace)).await;
            }
            PoolState::Zero | PoolState::Faulted { .. } => {}
        }

        self.0.state.store(Arc::new(PoolState::Closed { trace }));
        tracing::info!(conn_id = %self.0.config.conn_id, "pool closed");
    }

    pub fn is_closed(&self) -> bool {
        matches!(&**self.0.state.load(), PoolState::Closed { .. })
    }

    /// Occupancy snapshot; zeros before initialization and after close.
    pub fn stats(&self) -> PoolStats {
        match &**self.0.state.load() {
            PoolState::Normal { engine } | PoolState::Elevated { engine, .. } => engine.stats(),
            _ => PoolStats::default(),
        }
    }

    /// Records currently managed, busy or idle.
    pub fn size(&self) -> u32 {
        self.stats().total
    }

    pub fn num_idle(&self) -> usize {
        self.stats().idle as usize
    }

    /// The current admission threshold: nominal capacity, or nominal plus
    /// overdrive while elevated. Zero before initialization.
    pub fn max_size(&self) -> u32 {
        match &**self.0.state.load() {
            PoolState::Normal { engine } | PoolState::Elevated { engine, .. } => engine.max_size(),
            _ => 0,
        }
    }
}

/// Returns a new handle to the same pool.
impl<C: Connection> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<C: Connection> Debug for Pool<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool")
            .field("conn_id", &self.0.config.conn_id)
            .field("state", &self.0.state.load().name())
            .field("stats", &stats)
            .finish()
    }
}
