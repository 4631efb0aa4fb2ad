//! TLS connector construction for `sslmode` values other than `disable`.

use std::fs;

use native_tls::{Certificate, Identity, TlsConnector, TlsConnectorBuilder};
use postgres_native_tls::MakeTlsConnector;
use poolkeeper_core::{ConnectParams, PoolError, PoolResult, SslMode};

/// Which certificate checks native-tls should skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Verification {
    pub accept_invalid_certs: bool,
    pub accept_invalid_hostnames: bool,
}

/// libpq semantics: `allow`/`prefer`/`require` only encrypt, except that
/// `require` with a root certificate behaves like `verify-ca`. Hostnames are
/// checked only under `verify-full`.
pub(crate) fn verification(mode: SslMode, has_root_cert: bool) -> Verification {
    match mode {
        SslMode::Disable | SslMode::Allow | SslMode::Prefer => Verification {
            accept_invalid_certs: true,
            accept_invalid_hostnames: true,
        },
        SslMode::Require => Verification {
            accept_invalid_certs: !has_root_cert,
            accept_invalid_hostnames: true,
        },
        SslMode::VerifyCa => Verification {
            accept_invalid_certs: false,
            accept_invalid_hostnames: true,
        },
        SslMode::VerifyFull => Verification {
            accept_invalid_certs: false,
            accept_invalid_hostnames: false,
        },
    }
}

/// Build a TLS connector from the TLS-related connection parameters.
pub(crate) fn connector(params: &ConnectParams) -> PoolResult<MakeTlsConnector> {
    // native-tls cannot decrypt an encrypted PEM key.
    if params.sslpassword.is_some() {
        return Err(PoolError::Config(
            "sslpassword is not supported; client keys must be unencrypted PKCS#8 PEM".to_string(),
        ));
    }

    let mut builder = TlsConnector::builder();

    let policy = verification(params.sslmode, params.sslrootcert.is_some());
    builder.danger_accept_invalid_certs(policy.accept_invalid_certs);
    builder.danger_accept_invalid_hostnames(policy.accept_invalid_hostnames);

    if let Some(path) = &params.sslrootcert {
        apply_root_cert(&mut builder, path)?;
    }

    match (&params.sslcert, &params.sslkey) {
        (Some(cert), Some(key)) => apply_client_identity(&mut builder, cert, key)?,
        (Some(_), None) | (None, Some(_)) => {
            return Err(PoolError::Config(
                "sslcert and sslkey must be configured together".to_string(),
            ));
        }
        (None, None) => {}
    }

    let connector = builder
        .build()
        .map_err(|e| PoolError::Connect(format!("building TLS connector: {e}")))?;
    Ok(MakeTlsConnector::new(connector))
}

fn apply_root_cert(builder: &mut TlsConnectorBuilder, path: &str) -> PoolResult<()> {
    tracing::debug!(path = %path, "loading root certificate");
    let pem = fs::read(path)
        .map_err(|e| PoolError::Config(format!("reading root certificate {path}: {e}")))?;
    let cert = Certificate::from_pem(&pem)
        .map_err(|e| PoolError::Config(format!("parsing root certificate {path}: {e}")))?;
    builder.add_root_certificate(cert);
    Ok(())
}

fn apply_client_identity(
    builder: &mut TlsConnectorBuilder,
    cert_path: &str,
    key_path: &str,
) -> PoolResult<()> {
    tracing::debug!(cert = %cert_path, key = %key_path, "loading client certificate");
    let cert = fs::read(cert_path)
        .map_err(|e| PoolError::Config(format!("reading client certificate {cert_path}: {e}")))?;
    let key = fs::read(key_path)
        .map_err(|e| PoolError::Config(format!("reading client key {key_path}: {e}")))?;
    let identity = Identity::from_pkcs8(&cert, &key)
        .map_err(|e| PoolError::Config(format!("invalid client certificate or key: {e}")))?;
    builder.identity(identity);
    Ok(())
}
