//! rustls setup for `wss://` connections.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_tungstenite::Connector;
use tracing::{debug, warn};

use crate::config::TlsOptions;
use crate::error::{HubError, HubResult};

/// Build the TLS connector for a `wss://` hub.
pub fn connector(options: &TlsOptions) -> HubResult<Connector> {
    Ok(Connector::Rustls(Arc::new(client_config(options)?)))
}

/// Build the rustls client configuration for the given options.
pub fn client_config(options: &TlsOptions) -> HubResult<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| HubError::Tls(e.to_string()))?;

    let config = if options.reject_unauthorized {
        builder
            .with_root_certificates(root_store(options.ca_cert_path.as_deref())?)
            .with_no_client_auth()
    } else {
        warn!("Server certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    };

    Ok(config)
}

/// Platform roots plus the certificates in `ca_cert_path`.
fn root_store(ca_cert_path: Option<&Path>) -> HubResult<RootCertStore> {
    let mut roots = RootCertStore::empty();

    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = roots.add_parsable_certificates(certs);
            debug!(added, ignored, "Loaded platform root certificates");
        }
        Err(e) => warn!(error = %e, "Could not load platform root certificates"),
    }

    if let Some(path) = ca_cert_path {
        for cert in load_certificates(path)? {
            roots
                .add(cert)
                .map_err(|e| HubError::Tls(format!("{}: {}", path.display(), e)))?;
        }
    }

    Ok(roots)
}

/// Read every PEM certificate in `path`.
pub fn load_certificates(path: &Path) -> HubResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        HubError::Tls(format!(
            "cannot open CA certificate {}: {}",
            path.display(),
            e
        ))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HubError::Tls(format!("{}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(HubError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Accepts any server certificate. Handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
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
        verify_tls12_signature(
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
        verify_tls13_signature(
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
    use std::io::Write;

    #[test]
    fn test_missing_ca_file_is_tls_error() {
        let result = load_certificates(Path::new("/nonexistent/ca.pem"));
        assert!(matches!(result, Err(HubError::Tls(_))));
    }

    #[test]
    fn test_file_without_certificates_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not a certificate").unwrap();

        let result = load_certificates(file.path());
        assert!(matches!(result, Err(HubError::Tls(msg)) if msg.contains("no certificates")));
    }

    #[test]
    fn test_insecure_config_builds_without_roots() {
        let options = TlsOptions {
            ca_cert_path: Some("/nonexistent/ca.pem".into()),
            reject_unauthorized: false,
        };
        // The CA path is not consulted when verification is off.
        assert!(client_config(&options).is_ok());
    }

    #[test]
    fn test_verifying_config_requires_readable_ca() {
        let options = TlsOptions {
            ca_cert_path: Some("/nonexistent/ca.pem".into()),
            reject_unauthorized: true,
        };
        assert!(matches!(client_config(&options), Err(HubError::Tls(_))));
    }
}
