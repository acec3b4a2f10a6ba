//! Driver property assembly and Oracle TCPS material synthesis.

use crate::config::{DbKind, PoolConfig, Protocol};
use crate::connection::PropertyBag;
use crate::error::{Error, Result};

/// Appended to the URL when server DN matching is in force.
pub const SECURE_URL_SUFFIX: &str = "(SECURITY=(SSL_SERVER_DN_MATCH=yes))";

/// Appended otherwise. Empty: a plain URL needs no qualifier.
pub const NONSECURE_URL_SUFFIX: &str = "";

/// Truststore password applied when none is supplied; callers needing a
/// different one must set it on the driver themselves.
const DEFAULT_TRUSTSTORE_PASSWORD: &str = "ptclient";

/// The effective URL and property bag for every connection this pool opens.
#[derive(Debug, Clone)]
pub(crate) struct DriverTarget {
    pub url: String,
    pub props: PropertyBag,
}

/// Assemble the driver target from the configuration.
///
/// Base properties (credentials and timeouts) are always present. For
/// Oracle over TCPS the SSL material is injected and the URL gains the
/// secure suffix when DN matching is requested; everything else gets the
/// non-secure suffix.
pub(crate) fn assemble(config: &PoolConfig) -> Result<DriverTarget> {
    let mut props = PropertyBag::new();
    props.set("user", &config.login);
    props.set("password", &config.password);
    props.set("socketTimeout", config.socket_timeout.as_secs().to_string());
    props.set("connectTimeout", config.connect_timeout.as_secs().to_string());

    let mut url = config.url.clone();
    if let Some(suffix) = &config.url_suffix {
        url.push_str(suffix);
    }

    let suffix = if config.db_kind == DbKind::Oracle && config.protocol == Protocol::Tcps {
        synthesize_ssl(config, &mut props)?
    } else {
        NONSECURE_URL_SUFFIX
    };
    url.push_str(suffix);

    Ok(DriverTarget { url, props })
}

/// Inject Oracle TCPS properties; returns the URL suffix to append.
fn synthesize_ssl(config: &PoolConfig, props: &mut PropertyBag) -> Result<&'static str> {
    if let Some(truststore) = &config.truststore_path {
        if truststore.exists() {
            props.set("javax.net.ssl.trustStore", truststore.display().to_string());
            props.set(
                "javax.net.ssl.trustStorePassword",
                DEFAULT_TRUSTSTORE_PASSWORD,
            );
        } else {
            tracing::warn!(
                conn_id = %config.conn_id,
                truststore = %truststore.display(),
                "truststore path does not exist; continuing without it"
            );
        }
    }

    if config.two_way_ssl {
        let keystore = config
            .keystore_path
            .as_ref()
            .ok_or_else(|| Error::config("two-way SSL requires a keystore path"))?;
        let password = config
            .keystore_password
            .as_ref()
            .ok_or_else(|| Error::config("two-way SSL requires a keystore password"))?;

        props.set("javax.net.ssl.keyStore", keystore.display().to_string());
        props.set("javax.net.ssl.keyStorePassword", password);
    }

    match config.match_server_dn.as_deref() {
        Some(dn) if !dn.is_empty() => {
            props.set("oracle.net.ssl_server_dn_match", "true");
            Ok(SECURE_URL_SUFFIX)
        }
        _ => Ok(NONSECURE_URL_SUFFIX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DbKind, PoolConfig, PoolConfigBuilder, Protocol};
    use std::fs;
    use std::path::PathBuf;

    fn oracle_tcps() -> PoolConfigBuilder {
        PoolConfig::builder("ora")
            .url("jdbc:oracle:thin:@db:1521/svc")
            .db_kind(DbKind::Oracle)
            .protocol(Protocol::Tcps)
            .credentials("app", "secret")
    }

    fn scratch_file(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("tidepool-{}-{}", std::process::id(), name));
        fs::write(&path, b"jks").unwrap();
        path
    }

    #[test]
    fn dn_match_selects_secure_suffix() {
        let config = oracle_tcps().match_server_dn("CN=db").build().unwrap();
        let target = assemble(&config).unwrap();

        assert!(target.url.ends_with(SECURE_URL_SUFFIX));
        assert_eq!(target.props.get("oracle.net.ssl_server_dn_match"), Some("true"));
    }

    #[test]
    fn empty_dn_selects_nonsecure_suffix() {
        let config = oracle_tcps().match_server_dn("").build().unwrap();
        let target = assemble(&config).unwrap();

        assert_eq!(target.url, "jdbc:oracle:thin:@db:1521/svc");
        assert!(!target.props.contains("oracle.net.ssl_server_dn_match"));
    }

    #[test]
    fn truststore_on_disk_sets_default_password() {
        let truststore = scratch_file("truststore");
        let config = oracle_tcps().truststore_path(&truststore).build().unwrap();
        let target = assemble(&config).unwrap();

        assert_eq!(
            target.props.get("javax.net.ssl.trustStore").map(PathBuf::from),
            Some(truststore.clone())
        );
        assert_eq!(
            target.props.get("javax.net.ssl.trustStorePassword"),
            Some("ptclient")
        );
        let _ = fs::remove_file(truststore);
    }

    #[test]
    fn missing_truststore_is_skipped() {
        let config = oracle_tcps()
            .truststore_path("/nonexistent/truststore.jks")
            .build()
            .unwrap();
        let target = assemble(&config).unwrap();

        assert!(!target.props.contains("javax.net.ssl.trustStore"));
    }

    #[test]
    fn two_way_ssl_requires_keystore_material() {
        let err = assemble(&oracle_tcps().two_way_ssl(true).build().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let keystore = scratch_file("keystore");
        let config = oracle_tcps()
            .two_way_ssl(true)
            .keystore_path(&keystore)
            .keystore_password("kspass")
            .build()
            .unwrap();
        let target = assemble(&config).unwrap();
        assert!(target.props.contains("javax.net.ssl.keyStore"));
        assert_eq!(target.props.get("javax.net.ssl.keyStorePassword"), Some("kspass"));
        let _ = fs::remove_file(keystore);
    }

    #[test]
    fn non_oracle_gets_base_properties_only() {
        let config = PoolConfig::builder("pg")
            .url("jdbc:postgresql://localhost/db")
            .url_suffix("?ApplicationName=tidepool")
            .db_kind(DbKind::Postgres)
            .credentials("app", "secret")
            .build()
            .unwrap();
        let target = assemble(&config).unwrap();

        assert_eq!(target.url, "jdbc:postgresql://localhost/db?ApplicationName=tidepool");
        assert_eq!(target.props.get("user"), Some("app"));
        assert_eq!(target.props.get("password"), Some("secret"));
        assert!(target.props.contains("socketTimeout"));
        assert!(target.props.contains("connectTimeout"));
        assert!(!target.props.contains("javax.net.ssl.trustStore"));
    }
}
