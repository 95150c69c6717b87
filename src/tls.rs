//! TLS client configuration.

use crate::error::Error;
use crate::settings::TlsSettings;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::warn;

/// Builds the shared rustls client config from [`TlsSettings`]. Called
/// once, on the first HTTPS peer.
pub(crate) fn client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>, Error> {
    let mut roots = RootCertStore::empty();
    let mut loaded_any = false;

    if let Some(ca_file) = &settings.ca_file {
        add_pem_roots(&mut roots, ca_file)?;
        loaded_any = true;
    }
    if let Some(ca_dir) = &settings.ca_dir {
        let entries = std::fs::read_dir(ca_dir)
            .map_err(|e| Error::TlsError(format!("{}: {e}", ca_dir.display())))?;
        for entry in entries.flatten() {
            if entry.path().is_file() {
                add_pem_roots(&mut roots, &entry.path())?;
            }
        }
        loaded_any = true;
    }
    if !loaded_any {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut config = match (&settings.cert_file, &settings.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let certs = load_certs(cert_file)?;
            let key = load_key(key_file)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::TlsError(format!("client cert: {e}")))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(Error::TlsError(
                "cert_file and key_file must be set together".into(),
            ));
        }
    };

    if settings.allow_invalid_certs {
        warn!("TLS certificate verification disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyCert::default()));
    }
    Ok(Arc::new(config))
}

fn add_pem_roots(roots: &mut RootCertStore, path: &Path) -> Result<(), Error> {
    let certs = load_certs(path)?;
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| Error::TlsError(format!("{}: {e}", path.display())))?;
    }
    Ok(())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsError(format!("{}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsError(format!("{}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsError(format!("{}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::TlsError(format!("{}: {e}", path.display())))?
        .ok_or_else(|| Error::TlsError(format!("{}: no private key found", path.display())))
}

/// Verifier that accepts every certificate. Only installed when
/// `allow_invalid_certs` is set; signatures are still checked so a
/// handshake with a peer that cannot sign at all still fails.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: CryptoProvider,
}

impl Default for AcceptAnyCert {
    fn default() -> Self {
        Self {
            provider: rustls::crypto::aws_lc_rs::default_provider(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        let config = client_config(&TlsSettings::default()).unwrap();
        assert!(!config.alpn_protocols.iter().any(|p| p == b"h2"));
    }

    #[test]
    fn mismatched_cert_key_is_rejected() {
        let settings = TlsSettings {
            cert_file: Some("/nonexistent/cert.pem".into()),
            key_file: None,
            ..TlsSettings::default()
        };
        assert!(client_config(&settings).is_err());
    }
}
