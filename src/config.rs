//! Pool configuration.

use std::fmt::{self, Debug, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// The kind of database behind the pool; selects the liveness test query
/// and, for Oracle, the TCPS handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Oracle,
    Postgres,
    H2,
}

impl DbKind {
    /// The short statement run to validate a connection on checkout.
    pub fn test_query(self) -> &'static str {
        match self {
            DbKind::Oracle => "SELECT 1 FROM DUAL",
            DbKind::Postgres | DbKind::H2 => "SELECT 1",
        }
    }
}

/// Transport protocol requested from the driver.
///
/// Only meaningful for Oracle, where `Tcps` triggers SSL property
/// synthesis; every other combination behaves as `Tcp`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    Tcp,
    Tcps,
}

/// Immutable pool configuration.
///
/// Build one with [`PoolConfig::builder`]. All sizing and timeout options
/// have defaults suitable for light-duty use; production deployments will
/// at least want to set [`max_connections`][PoolConfigBuilder::max_connections].
#[derive(Clone)]
pub struct PoolConfig {
    pub(crate) conn_id: String,
    pub(crate) login: String,
    pub(crate) password: String,
    pub(crate) url: String,
    pub(crate) url_suffix: Option<String>,
    pub(crate) driver_class: String,
    pub(crate) db_kind: DbKind,
    pub(crate) protocol: Protocol,
    pub(crate) min_connections: u32,
    pub(crate) max_connections: u32,
    pub(crate) overdrive: u32,
    pub(crate) max_connection_age: Option<Duration>,
    pub(crate) max_idle_time: Option<Duration>,
    pub(crate) checkout_timeout: Duration,
    pub(crate) socket_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) unreturned_conn_timeout: Option<Duration>,
    pub(crate) two_way_ssl: bool,
    pub(crate) truststore_path: Option<PathBuf>,
    pub(crate) keystore_path: Option<PathBuf>,
    pub(crate) keystore_password: Option<String>,
    pub(crate) match_server_dn: Option<String>,
}

impl PoolConfig {
    /// Returns a builder; `conn_id` names the pool in logs and metrics.
    pub fn builder(conn_id: impl Into<String>) -> PoolConfigBuilder {
        PoolConfigBuilder::new(conn_id)
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn db_kind(&self) -> DbKind {
        self.db_kind
    }

    pub fn min_connections(&self) -> u32 {
        self.min_connections
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    /// The number of extra connections admitted while the pool is elevated.
    pub fn overdrive(&self) -> u32 {
        self.overdrive
    }

    pub fn checkout_timeout(&self) -> Duration {
        self.checkout_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// The liveness statement derived from the configured [`DbKind`].
    pub fn test_query(&self) -> &'static str {
        self.db_kind.test_query()
    }

    /// Pool capacity while elevated.
    pub(crate) fn elevated_max(&self) -> u32 {
        self.max_connections + self.overdrive
    }
}

impl Debug for PoolConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("conn_id", &self.conn_id)
            .field("url", &self.url)
            .field("db_kind", &self.db_kind)
            .field("login", &self.login)
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("checkout_timeout", &self.checkout_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`PoolConfig`].
pub struct PoolConfigBuilder {
    conn_id: String,
    login: Option<String>,
    password: String,
    url: Option<String>,
    url_suffix: Option<String>,
    driver_class: String,
    db_kind: Option<DbKind>,
    protocol: Protocol,
    min_connections: u32,
    max_connections: u32,
    overdrive: u32,
    max_connection_age: Option<Duration>,
    max_idle_time: Option<Duration>,
    checkout_timeout: Duration,
    socket_timeout: Duration,
    connect_timeout: Duration,
    unreturned_conn_timeout: Option<Duration>,
    two_way_ssl: bool,
    truststore_path: Option<PathBuf>,
    keystore_path: Option<PathBuf>,
    keystore_password: Option<String>,
    match_server_dn: Option<String>,
}

impl PoolConfigBuilder {
    fn new(conn_id: impl Into<String>) -> Self {
        Self {
            conn_id: conn_id.into(),
            login: None,
            password: String::new(),
            url: None,
            url_suffix: None,
            driver_class: String::new(),
            db_kind: None,
            protocol: Protocol::Tcp,
            min_connections: 1,
            max_connections: 10,
            overdrive: 11,
            max_connection_age: Some(Duration::from_secs(30 * 60)),
            max_idle_time: Some(Duration::from_secs(10 * 60)),
            checkout_timeout: Duration::from_secs(30),
            socket_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            unreturned_conn_timeout: None,
            two_way_ssl: false,
            truststore_path: None,
            keystore_path: None,
            keystore_password: None,
            match_server_dn: None,
        }
    }

    /// Database URL. Required.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Optional suffix appended to the URL before any protocol suffix.
    pub fn url_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.url_suffix = Some(suffix.into());
        self
    }

    /// Driver class name, passed through to the driver adapter verbatim.
    pub fn driver_class(mut self, class: impl Into<String>) -> Self {
        self.driver_class = class.into();
        self
    }

    /// Database kind. Required; selects the test query.
    pub fn db_kind(mut self, kind: DbKind) -> Self {
        self.db_kind = Some(kind);
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Login credentials. The login is required; the password is never
    /// logged.
    pub fn credentials(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.password = password.into();
        self
    }

    /// Number of connections opened during initialization and kept through
    /// idle eviction. Must be at least 1 and at most `max_connections`.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Nominal pool capacity. While elevated, the pool temporarily admits
    /// [`overdrive`][Self::overdrive] connections beyond this.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Extra capacity granted when checkouts are timing out. Defaults to 11.
    pub fn overdrive(mut self, overdrive: u32) -> Self {
        self.overdrive = overdrive;
        self
    }

    /// Upper bound on a connection's lifetime; over-age connections are
    /// closed on release or by the reaper. `None` disables the bound.
    pub fn max_connection_age(mut self, age: impl Into<Option<Duration>>) -> Self {
        self.max_connection_age = age.into();
        self
    }

    /// Idle eviction threshold, respecting `min_connections`. `None`
    /// disables idle eviction.
    pub fn max_idle_time(mut self, idle: impl Into<Option<Duration>>) -> Self {
        self.max_idle_time = idle.into();
        self
    }

    /// Per-acquire wait cap. A checkout timing out against a pool at
    /// nominal capacity is what trips elevation.
    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    /// Passed through to the driver properties, in whole seconds.
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Bounds initialization warm-up and each fresh connect attempt.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Checked-out connections held longer than this are reported (not
    /// reclaimed) as suspected leaks, with their checkout context.
    pub fn unreturned_conn_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.unreturned_conn_timeout = timeout.into();
        self
    }

    /// Require client certificates for Oracle TCPS; needs a keystore path
    /// and password.
    pub fn two_way_ssl(mut self, enabled: bool) -> Self {
        self.two_way_ssl = enabled;
        self
    }

    pub fn truststore_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.truststore_path = Some(path.into());
        self
    }

    pub fn keystore_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.keystore_path = Some(path.into());
        self
    }

    pub fn keystore_password(mut self, password: impl Into<String>) -> Self {
        self.keystore_password = Some(password.into());
        self
    }

    /// Expected server certificate DN. Non-empty enables DN matching and
    /// the secure URL suffix for Oracle TCPS.
    pub fn match_server_dn(mut self, dn: impl Into<String>) -> Self {
        self.match_server_dn = Some(dn.into());
        self
    }

    pub fn build(self) -> Result<PoolConfig> {
        let url = self
            .url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::config("database URL is required"))?;
        let login = self
            .login
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::config("login is required"))?;
        let db_kind = self
            .db_kind
            .ok_or_else(|| Error::config("db_kind is required"))?;

        if self.min_connections < 1 {
            return Err(Error::config("min_connections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::config(format!(
                "min_connections ({}) must not exceed max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.checkout_timeout.is_zero() {
            return Err(Error::config("checkout_timeout must be non-zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::config("connect_timeout must be non-zero"));
        }

        Ok(PoolConfig {
            conn_id: self.conn_id,
            login,
            password: self.password,
            url,
            url_suffix: self.url_suffix,
            driver_class: self.driver_class,
            db_kind,
            protocol: self.protocol,
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            overdrive: self.overdrive,
            max_connection_age: self.max_connection_age,
            max_idle_time: self.max_idle_time,
            checkout_timeout: self.checkout_timeout,
            socket_timeout: self.socket_timeout,
            connect_timeout: self.connect_timeout,
            unreturned_conn_timeout: self.unreturned_conn_timeout,
            two_way_ssl: self.two_way_ssl,
            truststore_path: self.truststore_path,
            keystore_path: self.keystore_path,
            keystore_password: self.keystore_password,
            match_server_dn: self.match_server_dn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PoolConfigBuilder {
        PoolConfig::builder("test")
            .url("jdbc:postgresql://localhost/db")
            .db_kind(DbKind::Postgres)
            .credentials("app", "secret")
    }

    #[test]
    fn builds_with_defaults() {
        let config = base().build().unwrap();
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.overdrive, 11);
        assert_eq!(config.elevated_max(), 21);
        assert_eq!(config.test_query(), "SELECT 1");
    }

    #[test]
    fn oracle_test_query_is_dual() {
        let config = base().db_kind(DbKind::Oracle).build().unwrap();
        assert_eq!(config.test_query(), "SELECT 1 FROM DUAL");
    }

    #[test]
    fn rejects_missing_db_kind() {
        let err = PoolConfig::builder("test")
            .url("jdbc:h2:mem:test")
            .credentials("app", "")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn rejects_min_above_max() {
        let err = base().min_connections(5).max_connections(2).build().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn rejects_zero_min() {
        let err = base().min_connections(0).build().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn debug_omits_password() {
        let config = base().build().unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret"));
    }
}
