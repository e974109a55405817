use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::config::Config;

/// Build a TLS acceptor from the configured PEM files, or `None` when TLS is
/// not configured.
pub fn load_tls_acceptor(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both COURTSIDE_TLS_CERT and COURTSIDE_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates found in {cert_path}"),
        ));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    server_config.alpn_protocols = vec![b"postgresql".to_vec()];

    tracing::info!("TLS enabled with certificate {cert_path}");
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_paths() {
        assert!(load_tls_acceptor(&Config::default()).unwrap().is_none());
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        let config = Config {
            tls_cert: Some("/nonexistent/courtside-cert.pem".into()),
            tls_key: Some("/nonexistent/courtside-key.pem".into()),
            ..Config::default()
        };
        let Err(err) = load_tls_acceptor(&config) else {
            panic!("missing cert file accepted");
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn half_configured_is_rejected() {
        let config = Config {
            tls_key: Some("key.pem".into()),
            ..Config::default()
        };
        let Err(err) = load_tls_acceptor(&config) else {
            panic!("key without cert accepted");
        };
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
