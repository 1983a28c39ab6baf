//! TLS connector for server connections, with an external trust provider.

use crate::config::TlsConfig;
use crate::error::ClientError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Certificate trust owned outside the client.
pub trait TrustProvider: Send + Sync + fmt::Debug {
    /// Returns true when the server certificate is trusted without chain
    /// validation.
    fn is_trusted(&self, end_entity: &CertificateDer<'_>, intermediates: &[CertificateDer<'_>]) -> bool;

    /// Local certificate chain and key presented to the server, if any.
    fn local_keys(&self) -> Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        None
    }
}

/// Trust provider pinning the certificates of a PEM file.
#[derive(Debug, Default)]
pub struct PinnedCertificates {
    pinned: Vec<CertificateDer<'static>>,
}

impl PinnedCertificates {
    pub fn new(pinned: Vec<CertificateDer<'static>>) -> Self {
        Self { pinned }
    }

    pub fn from_pem(path: &Path) -> Result<Self, ClientError> {
        Ok(Self::new(load_certs(path)?))
    }
}

impl TrustProvider for PinnedCertificates {
    fn is_trusted(&self, end_entity: &CertificateDer<'_>, _: &[CertificateDer<'_>]) -> bool {
        self.pinned
            .iter()
            .any(|c| c.as_ref() == end_entity.as_ref())
    }
}

/// Asks the trust provider first and falls back to web PKI validation.
#[derive(Debug)]
struct ProviderVerifier {
    provider: Arc<dyn TrustProvider>,
    fallback: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for ProviderVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.provider.is_trusted(end_entity, intermediates) {
            tracing::debug!("Server certificate trusted by provider");
            return Ok(ServerCertVerified::assertion());
        }
        self.fallback
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.fallback.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.fallback.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.fallback.supported_verify_schemes()
    }
}

fn root_store(config: &TlsConfig) -> Result<RootCertStore, ClientError> {
    let mut store = RootCertStore::empty();
    if let Some(ref ca_path) = config.ca_cert_path {
        for cert in load_certs(ca_path)? {
            store
                .add(cert)
                .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert: {}", e)))?;
        }
    } else {
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    Ok(store)
}

fn provider_verifier(
    config: &TlsConfig,
    provider: Arc<dyn TrustProvider>,
) -> Result<Arc<ProviderVerifier>, ClientError> {
    let fallback = WebPkiServerVerifier::builder(Arc::new(root_store(config)?))
        .build()
        .map_err(|e| ClientError::TlsConfig(format!("cannot build verifier: {}", e)))?;
    Ok(Arc::new(ProviderVerifier { provider, fallback }))
}

/// Creates a TLS connector for `server_host`.
///
/// With a trust provider, its decision wins over chain validation and its
/// local keys are offered for client authentication.
pub fn create_tls_connector(
    config: &TlsConfig,
    server_host: &str,
    provider: Option<Arc<dyn TrustProvider>>,
) -> Result<(TlsConnector, ServerName<'static>), ClientError> {
    let client_config = match provider {
        Some(provider) => {
            let local_keys = provider.local_keys();
            let builder = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(provider_verifier(config, provider)?);
            match local_keys {
                Some((certs, key)) => builder.with_client_auth_cert(certs, key).map_err(|e| {
                    ClientError::TlsConfig(format!("invalid client cert/key: {}", e))
                })?,
                None => builder.with_no_client_auth(),
            }
        }
        None => rustls::ClientConfig::builder()
            .with_root_certificates(root_store(config)?)
            .with_no_client_auth(),
    };

    let connector = TlsConnector::from(Arc::new(client_config));

    let server_name_str = config.server_name.as_deref().unwrap_or(server_host);
    let server_name = ServerName::try_from(server_name_str.to_string())
        .map_err(|_| ClientError::TlsConfig(format!("invalid server name: {}", server_name_str)))?;

    Ok((connector, server_name))
}

/// Reads every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

/// Reads the first private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| ClientError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => {
                return Err(ClientError::TlsConfig(format!(
                    "no private key found in {:?}",
                    path
                )))
            }
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_invalid_cert_path() {
        let result = load_certs(Path::new("/nonexistent/cert.pem"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cannot open"));
    }

    #[test]
    fn test_load_key_missing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a pem file").unwrap();
        let err = load_private_key(file.path()).unwrap_err();
        assert!(err.to_string().contains("no private key"));
    }

    #[test]
    fn test_pinned_certificates() {
        let pinned = PinnedCertificates::new(vec![CertificateDer::from(vec![1u8, 2, 3])]);
        assert!(pinned.is_trusted(&CertificateDer::from(vec![1u8, 2, 3]), &[]));
        assert!(!pinned.is_trusted(&CertificateDer::from(vec![9u8]), &[]));
        assert!(pinned.local_keys().is_none());
    }

    #[test]
    fn test_provider_decides_before_fallback() {
        let cert = CertificateDer::from(vec![0x30u8, 0x03, 0x02, 0x01, 0x01]);
        let name = ServerName::try_from("login.example.com").unwrap();

        let trusting = provider_verifier(
            &TlsConfig::default(),
            Arc::new(PinnedCertificates::new(vec![cert.clone()])),
        )
        .unwrap();
        assert!(trusting
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .is_ok());

        let strict = provider_verifier(&TlsConfig::default(), Arc::new(PinnedCertificates::default())).unwrap();
        assert!(strict
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn test_connector_server_name() {
        let config = TlsConfig {
            enabled: true,
            server_name: Some("bos.example.com".to_string()),
            ca_cert_path: None,
        };
        let (_, name) = create_tls_connector(&config, "10.0.0.1", None).unwrap();
        assert_eq!(format!("{:?}", name), format!("{:?}", ServerName::try_from("bos.example.com").unwrap()));
    }
}
