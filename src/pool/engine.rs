//! The pool engine: bounded record set, idle queue, FIFO waiters, reaper.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use event_listener::Event;
use tokio::time::{timeout_at, Instant};

use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::pool::connection::{Floating, Idle, Live};
use crate::pool::state::CloseTrace;
use crate::pool::PoolStats;
use crate::source::ConnectSource;

pub(crate) struct PoolEngine<C: Connection> {
    source: ConnectSource<C>,
    config: Arc<PoolConfig>,

    idle: ArrayQueue<Idle<C>>,
    // Kept separately because `ArrayQueue::len()` spins until the head and
    // tail pointers stop moving, which may take a while under churn.
    num_idle: AtomicUsize,

    size: AtomicU32,
    /// Admission threshold. Raised while elevated; records above a lowered
    /// threshold are never closed preemptively, new admissions just stay
    /// barred until the count drains below it.
    max_size: AtomicU32,

    num_waiting: AtomicUsize,
    /// Notified once per released record or freed slot; `notify(1)` wakes
    /// the longest-parked waiter, which keeps the wait-list FIFO.
    release_event: Event,

    is_closed: AtomicBool,
    close_trace: OnceLock<Arc<CloseTrace>>,

    next_id: AtomicU64,
    /// Outstanding checkouts, kept only when leak reporting is configured.
    checkouts: Mutex<HashMap<u64, CheckoutStamp>>,
}

struct CheckoutStamp {
    at: Instant,
    context: String,
    warned: bool,
}

impl<C: Connection> PoolEngine<C> {
    pub(super) fn new_arc(config: Arc<PoolConfig>, source: ConnectSource<C>) -> Arc<Self> {
        // Sized for the elevated bound so elevation never overflows the
        // idle queue.
        let capacity = config.elevated_max() as usize;

        let engine = Arc::new(Self {
            source,
            idle: ArrayQueue::new(capacity),
            num_idle: AtomicUsize::new(0),
            size: AtomicU32::new(0),
            max_size: AtomicU32::new(config.max_connections),
            num_waiting: AtomicUsize::new(0),
            release_event: Event::new(),
            is_closed: AtomicBool::new(false),
            close_trace: OnceLock::new(),
            next_id: AtomicU64::new(1),
            checkouts: Mutex::new(HashMap::new()),
            config,
        });

        engine.spawn_reaper();

        engine
    }

    pub(super) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(super) fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    pub(super) fn num_idle(&self) -> usize {
        self.num_idle.load(Ordering::Acquire)
    }

    pub(super) fn max_size(&self) -> u32 {
        self.max_size.load(Ordering::Acquire)
    }

    pub(super) fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub(super) fn stats(&self) -> PoolStats {
        let total = self.size();
        let idle = self.num_idle() as u32;

        PoolStats {
            busy: total.saturating_sub(idle),
            idle,
            total,
            waiting: self.num_waiting.load(Ordering::Acquire) as u32,
        }
    }

    fn closed_error(&self) -> Error {
        let trace = self
            .close_trace
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(CloseTrace::capture()));

        Error::PoolClosed(trace)
    }

    /// Adjust the admission threshold. Growth wakes enough waiters to fill
    /// the new slots; shrinking closes nothing.
    pub(super) fn set_max_size(&self, max: u32) {
        debug_assert!(max as usize <= self.idle.capacity());

        let prev = self.max_size.swap(max, Ordering::AcqRel);
        if max > prev {
            self.release_event.notify((max - prev) as usize);
        }
    }

    /// Warm the pool to `min_connections`, bounded by the connect timeout.
    pub(super) async fn start(self: &Arc<Self>) -> Result<()> {
        let deadline = Instant::now() + self.config.connect_timeout;

        while self.size() < self.config.min_connections {
            let Some(guard) = self.try_increase_size() else {
                break;
            };

            let conn = self.connect(deadline, guard).await?;
            conn.release();
        }

        Ok(())
    }

    pub(super) async fn acquire(self: &Arc<Self>) -> Result<Floating<C, Live<C>>> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let deadline = Instant::now() + self.config.checkout_timeout;

        match timeout_at(deadline, self.acquire_inner(deadline)).await {
            Ok(result) => result,
            Err(_) => Err(Error::PoolTimedOut),
        }
    }

    async fn acquire_inner(
        self: &Arc<Self>,
        deadline: Instant,
    ) -> Result<Floating<C, Live<C>>> {
        // Fair wake-up: a task arriving while others are parked gets in
        // line instead of stealing ahead of them.
        let mut should_wait = self.num_waiting.load(Ordering::Acquire) > 0;

        loop {
            if should_wait {
                let listener = self.release_event.listen();

                // A record may have come back between the last attempt and
                // registering the listener; only park if there is still
                // nothing to take. A dropped-but-notified listener passes
                // its notification on, so bailing out here loses no wakes.
                if !self.checkout_ready() && !self.is_closed() {
                    let _waiting = WaitGuard::new(&self.num_waiting);
                    listener.await;
                }
            }

            if self.is_closed() {
                return Err(self.closed_error());
            }

            if let Some(idle) = self.try_pop_idle() {
                match self.prepare_idle(idle, deadline).await? {
                    Some(live) => return Ok(live),
                    // failed validation; the record was discarded and its
                    // slot freed, so try again immediately
                    None => {
                        should_wait = false;
                        continue;
                    }
                }
            }

            if let Some(guard) = self.try_increase_size() {
                return self.connect(deadline, guard).await;
            }

            should_wait = true;
        }
    }

    fn checkout_ready(&self) -> bool {
        self.num_idle() > 0 || self.size() < self.max_size()
    }

    fn try_pop_idle(self: &Arc<Self>) -> Option<Floating<C, Idle<C>>> {
        // The count acts as a ticket: a successful decrement means a record
        // was pushed before the matching increment, so the pop cannot miss.
        self.num_idle
            .fetch_update(Ordering::Release, Ordering::Acquire, |len| {
                len.checked_sub(1)
            })
            .ok()
            .and_then(|_| {
                let idle = self.idle.pop()?;
                Some(Floating::from_idle(idle, Arc::clone(self)))
            })
    }

    /// Try to reserve a slot for a new record.
    ///
    /// Returns `None` at capacity or on a closed pool.
    fn try_increase_size(self: &Arc<Self>) -> Option<DecrementSizeGuard<C>> {
        let max = self.max_size();

        self.size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                if self.is_closed() {
                    return None;
                }

                size.checked_add(1).filter(|size| *size <= max)
            })
            .ok()
            .map(|_| DecrementSizeGuard::new(Arc::clone(self)))
    }

    /// Validate an idle record and run the on-acquire visitor.
    ///
    /// `Ok(None)` means the record failed validation and was discarded; the
    /// caller retries within its deadline.
    async fn prepare_idle(
        self: &Arc<Self>,
        idle: Floating<C, Idle<C>>,
        deadline: Instant,
    ) -> Result<Option<Floating<C, Live<C>>>> {
        let mut live = idle.into_live();

        let test_query = self.config.test_query();
        match timeout_at(deadline, live.inner.raw.execute(test_query)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                // A failed record is always discarded, never re-queued.
                if Instant::now() >= deadline {
                    return Err(Error::Validation(Box::new(err)));
                }

                tracing::debug!(
                    conn_id = %self.config.conn_id,
                    connection = live.inner.id,
                    error = %err,
                    "idle connection failed validation; discarding"
                );
                live.close_raw().await.ok();
                return Ok(None);
            }
            Err(_) => return Err(Error::PoolTimedOut),
        }

        if let Err(err) = self.source.visit(&mut live.inner.raw).await {
            live.close_raw().await.ok();
            return Err(err);
        }

        self.note_checkout(live.inner.id);

        Ok(Some(live))
    }

    /// Open a fresh record, retrying transient driver errors until the
    /// deadline. Hook rejections are surfaced immediately.
    async fn connect(
        self: &Arc<Self>,
        deadline: Instant,
        guard: DecrementSizeGuard<C>,
    ) -> Result<Floating<C, Live<C>>> {
        let mut backoff = Duration::from_millis(10);

        loop {
            if self.is_closed() {
                return Err(self.closed_error());
            }

            let attempt_deadline = deadline.min(Instant::now() + self.config.connect_timeout);

            match timeout_at(attempt_deadline, self.source.connect()).await {
                Ok(Ok(raw)) => {
                    // The pool may have closed while we were connecting;
                    // never hand out a record from a closed pool. Dropping
                    // `raw` is the hard close, and the guard frees the slot.
                    if self.is_closed() {
                        return Err(self.closed_error());
                    }

                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    self.note_checkout(id);

                    return Ok(Floating::new_live(raw, id, guard));
                }
                Ok(Err(err @ Error::Hook(_))) => return Err(err),
                Ok(Err(err)) => {
                    tracing::warn!(
                        conn_id = %self.config.conn_id,
                        error = %err,
                        "error establishing a connection"
                    );

                    if Instant::now() + backoff >= deadline {
                        return Err(err);
                    }

                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
                Err(_) => return Err(Error::PoolTimedOut),
            }
        }
    }

    /// Park a record in the idle set and hand it to the oldest waiter.
    pub(super) fn release(self: &Arc<Self>, floating: Floating<C, Live<C>>) {
        self.forget_checkout(floating.inner.id);
        self.release_idle(floating.into_idle());
    }

    fn release_idle(&self, floating: Floating<C, Idle<C>>) {
        let Floating { inner: idle, guard } = floating;

        if self.idle.push(idle).is_err() {
            panic!("BUG: idle queue overflow in release()");
        }

        self.num_idle.fetch_add(1, Ordering::AcqRel);

        // The record keeps its slot; only the floating wrapper dies here.
        guard.cancel();

        self.release_event.notify(1);
    }

    fn note_checkout(&self, id: u64) {
        if self.config.unreturned_conn_timeout.is_none() {
            return;
        }

        let stamp = CheckoutStamp {
            at: Instant::now(),
            context: Backtrace::force_capture().to_string(),
            warned: false,
        };

        self.checkouts
            .lock()
            .expect("BUG: checkout registry poisoned")
            .insert(id, stamp);
    }

    pub(super) fn forget_checkout(&self, id: u64) {
        if self.config.unreturned_conn_timeout.is_none() {
            return;
        }

        self.checkouts
            .lock()
            .expect("BUG: checkout registry poisoned")
            .remove(&id);
    }

    /// Coalesced sweep: evict senescent idle records (respecting the
    /// `min_connections` floor) and report suspected leaks.
    pub(super) async fn reap(self: &Arc<Self>) {
        let mut keep = Vec::new();

        while let Some(idle) = self.try_pop_idle() {
            let age_expired = self
                .config
                .max_connection_age
                .map_or(false, |max| idle.inner.live.created.elapsed() >= max);

            // The popped record still holds its slot through the floating
            // guard, so `size()` counts it against the floor here.
            let idle_expired = self
                .config
                .max_idle_time
                .map_or(false, |max| idle.inner.since.elapsed() >= max)
                && self.size() > self.config.min_connections;

            if age_expired || idle_expired {
                tracing::debug!(
                    conn_id = %self.config.conn_id,
                    connection = idle.inner.live.id,
                    age_expired,
                    "reaping idle connection"
                );
                idle.close_raw().await.ok();
            } else {
                keep.push(idle);
            }
        }

        for idle in keep {
            self.release_idle(idle);
        }

        if let Some(limit) = self.config.unreturned_conn_timeout {
            let mut checkouts = self
                .checkouts
                .lock()
                .expect("BUG: checkout registry poisoned");

            for (id, stamp) in checkouts.iter_mut() {
                if !stamp.warned && stamp.at.elapsed() >= limit {
                    stamp.warned = true;
                    tracing::warn!(
                        conn_id = %self.config.conn_id,
                        connection = *id,
                        held_for = ?stamp.at.elapsed(),
                        checked_out_at = %stamp.context,
                        "connection has not been returned to the pool; possible leak"
                    );
                }
            }
        }
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let period = [
            self.config.max_idle_time,
            self.config.max_connection_age,
            self.config.unreturned_conn_timeout,
        ]
        .into_iter()
        .flatten()
        .min();

        let Some(period) = period else {
            return;
        };
        let period = period.max(Duration::from_millis(100));

        let weak = Arc::downgrade(self);

        tokio::task::spawn(async move {
            loop {
                tokio::time::sleep(period).await;

                let Some(engine) = weak.upgrade() else {
                    break;
                };
                if engine.is_closed() {
                    break;
                }

                engine.reap().await;
            }
        });
    }

    fn mark_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
        self.release_event.notify(usize::MAX);
    }

    /// Close the engine: refuse new checkouts, wake every waiter, drain and
    /// close idle records, then wait for checked-out records to come home.
    pub(super) async fn close(self: &Arc<Self>, trace: Arc<CloseTrace>) {
        let _ = self.close_trace.set(trace);
        self.mark_closed();

        loop {
            while let Some(idle) = self.try_pop_idle() {
                idle.close_raw().await.ok();
            }

            if self.size() == 0 {
                break;
            }

            let listener = self.release_event.listen();

            if self.size() == 0 {
                break;
            }
            if self.num_idle() > 0 {
                continue;
            }

            listener.await;
        }
    }
}

impl<C: Connection> Drop for PoolEngine<C> {
    fn drop(&mut self) {
        self.is_closed.store(true, Ordering::Release);
        self.release_event.notify(usize::MAX);
        // remaining idle records are hard-closed by their own drops
    }
}

/// RAII guard for a reserved record slot.
///
/// Dropped without [`cancel`][Self::cancel], it gives the slot back and
/// wakes a waiter; the pool never semantically leaks capacity even when a
/// connect attempt dies mid-flight.
pub(crate) struct DecrementSizeGuard<C: Connection> {
    engine: Arc<PoolEngine<C>>,
    cancelled: bool,
}

impl<C: Connection> DecrementSizeGuard<C> {
    pub(super) fn new(engine: Arc<PoolEngine<C>>) -> Self {
        Self {
            engine,
            cancelled: false,
        }
    }

    pub(super) fn engine(&self) -> &Arc<PoolEngine<C>> {
        &self.engine
    }

    /// Keep the slot: the record it was reserved for lives on.
    pub(super) fn cancel(mut self) {
        self.cancelled = true;
    }
}

impl<C: Connection> Drop for DecrementSizeGuard<C> {
    fn drop(&mut self) {
        if !self.cancelled {
            self.engine.size.fetch_sub(1, Ordering::AcqRel);
            self.engine.release_event.notify(1);
        }
    }
}

/// Keeps the parked-waiter count honest even if the wait is cancelled by a
/// timeout.
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
