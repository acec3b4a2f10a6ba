//! Error and Result types.

use std::sync::Arc;

use crate::pool::CloseTrace;

/// A specialized `Result` type for tidepool.
pub type Result<T, E = Error> = std::result::Result<T, E>;

// Convenience type alias for usage within the crate.
// Do not make this type public.
pub(crate) type BoxDynError = Box<dyn std::error::Error + 'static + Send + Sync>;

/// Represents all the ways the pool can fail.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A required configuration option is missing or invalid.
    ///
    /// Raised while building a [`PoolConfig`][crate::PoolConfig] or during
    /// initialization; fatal to the pool instance.
    #[error("error with configuration: {0}")]
    Configuration(#[source] BoxDynError),

    /// The underlying driver failed to produce a connection.
    ///
    /// [`Pool::acquire`][crate::Pool::acquire] retries these implicitly
    /// until the checkout timeout elapses, then surfaces the last one.
    #[error("error establishing a connection: {0}")]
    Driver(#[source] BoxDynError),

    /// A checked-out connection failed its liveness test and the acquire
    /// deadline left no room to retry with another connection.
    #[error("connection failed validation: {0}")]
    Validation(#[source] BoxDynError),

    /// The on-acquire hook rejected a freshly checked-out connection.
    ///
    /// The connection is closed; the failure is surfaced as-is.
    #[error("on-acquire hook failed: {0}")]
    Hook(#[source] BoxDynError),

    /// A [`Pool::acquire`][crate::Pool::acquire] timed out with no
    /// connection becoming available.
    #[error("pool timed out while waiting for an open connection")]
    PoolTimedOut,

    /// [`Pool::close`][crate::Pool::close] was called; the pool is
    /// permanently closed. Carries the context captured at close time.
    #[error("attempted to acquire a connection on a closed pool ({0})")]
    PoolClosed(Arc<CloseTrace>),

    /// Pool initialization failed. The pool backs off and the next caller
    /// past the backoff window retries.
    #[error("pool initialization failed: {0}")]
    Init(#[source] BoxDynError),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into().into())
    }

    pub(crate) fn init(message: impl Into<String>) -> Self {
        Error::Init(message.into().into())
    }

    /// The close context, if this is a [`Error::PoolClosed`].
    pub fn close_trace(&self) -> Option<&CloseTrace> {
        match self {
            Error::PoolClosed(trace) => Some(trace),
            _ => None,
        }
    }
}
