use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::config::Config;

/// Build the TLS acceptor from `MEDSLOT_TLS_CERT` / `MEDSLOT_TLS_KEY`.
/// Plaintext when neither is set; half a pair is a configuration error.
pub fn acceptor_from_config(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => load_tls_acceptor(cert, key).map(Some),
        _ => Err(io::Error::new(
            ErrorKind::InvalidInput,
            "MEDSLOT_TLS_CERT and MEDSLOT_TLS_KEY must be set together",
        )),
    }
}

/// Load a PEM certificate chain and private key.
pub fn load_tls_acceptor(cert_path: &str, key_path: &str) -> io::Result<TlsAcceptor> {
    let open = |path: &str| {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| io::Error::new(e.kind(), format!("{path}: {e}")))
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut open(cert_path)?).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("{cert_path}: no certificates found"),
        ));
    }
    let key = rustls_pemfile::private_key(&mut open(key_path)?)?.ok_or_else(|| {
        io::Error::new(ErrorKind::InvalidInput, format!("{key_path}: no private key found"))
    })?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    server_config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_when_unset() {
        let acceptor = acceptor_from_config(&Config::default()).unwrap();
        assert!(acceptor.is_none());
    }

    #[test]
    fn half_a_pair_is_rejected() {
        let config = Config {
            tls_cert: Some("/etc/medslot/cert.pem".into()),
            ..Config::default()
        };
        let err = acceptor_from_config(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_files_name_the_path() {
        let err = load_tls_acceptor("/nonexistent/medslot.crt", "/nonexistent/medslot.key")
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("/nonexistent/medslot.crt"));
    }

    #[test]
    fn empty_certificate_file_is_rejected() {
        let dir = std::env::temp_dir().join("medslot_test_tls");
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty.crt");
        std::fs::write(&cert, "").unwrap();
        let err = load_tls_acceptor(cert.to_str().unwrap(), "/nonexistent/medslot.key")
            .err()
            .unwrap();
        assert!(err.to_string().contains("no certificates found"));
    }
}
