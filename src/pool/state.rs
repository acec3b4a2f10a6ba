//! The atomically-published pool lifecycle snapshot.

use std::backtrace::Backtrace;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::time::Instant;

use crate::connection::Connection;
use crate::pool::engine::PoolEngine;

/// One immutable observation of the pool lifecycle.
///
/// The whole snapshot is swapped through a single atomic pointer, so the
/// engine handle and any transition metadata are always observed together.
pub(crate) enum PoolState<C: Connection> {
    /// Constructed but never initialized; the first `init()` or `acquire()`
    /// builds the engine. Never re-entered once left.
    Zero,

    /// Serving at nominal capacity.
    Normal { engine: Arc<PoolEngine<C>> },

    /// Serving with the overdrive allowance after a checkout timeout;
    /// demoted once `since` is a cooldown in the past.
    Elevated {
        engine: Arc<PoolEngine<C>>,
        since: Instant,
    },

    /// Initialization failed; retried only after the backoff window.
    Faulted {
        backoff_until: Instant,
        attempts: u32,
        message: Arc<str>,
    },

    /// Terminal. Every acquire fails with the captured close context.
    Closed { trace: Arc<CloseTrace> },
}

impl<C: Connection> PoolState<C> {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            PoolState::Zero => "zero",
            PoolState::Normal { .. } => "normal",
            PoolState::Elevated { .. } => "elevated",
            PoolState::Faulted { .. } => "faulted",
            PoolState::Closed { .. } => "closed",
        }
    }
}

/// Where and when the pool was closed.
///
/// Attached to every [`Error::PoolClosed`][crate::Error::PoolClosed] so a
/// late acquire can be traced back to the close that doomed it.
pub struct CloseTrace {
    thread: Option<String>,
    closed_at: SystemTime,
    backtrace: Backtrace,
}

impl CloseTrace {
    pub(crate) fn capture() -> Self {
        CloseTrace {
            thread: std::thread::current().name().map(String::from),
            closed_at: SystemTime::now(),
            backtrace: Backtrace::force_capture(),
        }
    }

    pub fn thread(&self) -> Option<&str> {
        self.thread.as_deref()
    }

    pub fn closed_at(&self) -> SystemTime {
        self.closed_at
    }

    /// The stack captured at the close site.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl Display for CloseTrace {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "closed from thread {:?} at {:?}",
            self.thread.as_deref().unwrap_or("<unnamed>"),
            self.closed_at
        )
    }
}

impl Debug for CloseTrace {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseTrace")
            .field("thread", &self.thread)
            .field("closed_at", &self.closed_at)
            .field("backtrace", &self.backtrace)
            .finish()
    }
}
