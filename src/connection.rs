//! Traits presented to the driver adapter, and the property bag handed to it.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};

use futures_core::future::BoxFuture;

use crate::error::Result;

/// A live, driver-owned connection to the database.
///
/// The pool only needs two verbs from a connection: running the liveness
/// test query, and closing gracefully. Dropping a connection without calling
/// [`close`][Self::close] is the hard close; implementations must release
/// the underlying socket from their `Drop`.
pub trait Connection: Send + 'static {
    /// Execute a statement, discarding any result rows.
    ///
    /// The pool calls this with the configured test query on checkout.
    fn execute<'c>(&'c mut self, sql: &'c str) -> BoxFuture<'c, Result<()>>;

    /// Gracefully close the connection, notifying the server.
    fn close(self) -> BoxFuture<'static, Result<()>>
    where
        Self: Sized;
}

/// Materializes physical connections from a URL and a property bag.
///
/// Stateless; must be safe to call from any number of tasks concurrently.
/// The property bag is opaque to the pool: it is assembled from the
/// configuration (credentials, timeouts, SSL material) before the first
/// connection is opened and never mutated afterwards.
pub trait Driver: Send + Sync + 'static {
    type Connection: Connection;

    fn materialize<'a>(
        &'a self,
        url: &'a str,
        driver_class: &'a str,
        props: &'a PropertyBag,
    ) -> BoxFuture<'a, Result<Self::Connection>>;
}

/// String key/value properties passed through to the driver.
///
/// Keys whose name contains `pass` (case-insensitively) hold secrets and
/// are redacted from `Debug` output, so the bag can be logged wholesale.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PropertyBag {
    entries: BTreeMap<String, String>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn is_secret(key: &str) -> bool {
    key.to_ascii_lowercase().contains("pass")
}

impl Debug for PropertyBag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.entries {
            if is_secret(key) {
                map.entry(key, &"<redacted>");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_password_keys() {
        let mut props = PropertyBag::new();
        props.set("user", "app");
        props.set("password", "hunter2");
        props.set("javax.net.ssl.keyStorePassword", "hunter3");

        let rendered = format!("{props:?}");
        assert!(rendered.contains("app"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("hunter3"));
        assert_eq!(rendered.matches("<redacted>").count(), 2);
    }
}
