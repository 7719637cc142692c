//! PEM loading and rustls configuration for both ends of the channel.

use std::{path::Path, sync::Arc};

use rustls::{
    ClientConfig, ConfigBuilder, RootCertStore, ServerConfig, WantsVerifier,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
};

use crate::{
    config::{ALPN_PROTOCOLS, SecurityMode},
    error::ChatError,
};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn alpn_protocols() -> Vec<Vec<u8>> {
    ALPN_PROTOCOLS.iter().map(|protocol| protocol.to_vec()).collect()
}

fn client_builder() -> Result<ConfigBuilder<ClientConfig, WantsVerifier>, ChatError> {
    ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|err| ChatError::HandshakeFailed(err.to_string()))
}

fn server_builder() -> Result<ConfigBuilder<ServerConfig, WantsVerifier>, ChatError> {
    ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|err| ChatError::HandshakeFailed(err.to_string()))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ChatError> {
    std::fs::read(path).map_err(|source| ChatError::CredentialNotFound {
        path: path.to_path_buf(),
        source,
    })
}

fn invalid(path: &Path, reason: impl ToString) -> ChatError {
    ChatError::InvalidCredential {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

pub(crate) fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, ChatError> {
    let pem = read_pem(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| invalid(path, err))?;
    if certs.is_empty() {
        return Err(invalid(path, "no certificates in file"));
    }
    Ok(certs)
}

pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ChatError> {
    let pem = read_pem(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|err| invalid(path, err))?
        .ok_or_else(|| invalid(path, "no private key in file"))
}

pub(crate) fn load_trust_anchor(path: &Path) -> Result<RootCertStore, ChatError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certificates(path)? {
        roots.add(cert).map_err(|err| invalid(path, err))?;
    }
    Ok(roots)
}

/// Client-side TLS config, or `None` for plaintext.
pub(crate) fn client_config(security: &SecurityMode) -> Result<Option<Arc<ClientConfig>>, ChatError> {
    let mut config = match security {
        SecurityMode::Plaintext => return Ok(None),
        SecurityMode::ServerAuth { trust_anchor, .. } => {
            let anchor = trust_anchor.as_deref().ok_or(ChatError::CredentialNotConfigured("trust anchor"))?;
            client_builder()?
                .with_root_certificates(load_trust_anchor(anchor)?)
                .with_no_client_auth()
        }
        SecurityMode::Mutual(paths) => {
            let roots = load_trust_anchor(&paths.trust_anchor)?;
            let chain = load_certificates(&paths.certificate)?;
            let key = load_private_key(&paths.private_key)?;
            client_builder()?
                .with_root_certificates(roots)
                .with_client_auth_cert(chain, key)
                .map_err(|err| invalid(&paths.private_key, err))?
        }
    };

    config.alpn_protocols = alpn_protocols();
    Ok(Some(Arc::new(config)))
}

/// Server-side TLS config, or `None` for plaintext.
pub(crate) fn server_config(security: &SecurityMode) -> Result<Option<Arc<ServerConfig>>, ChatError> {
    let mut config = match security {
        SecurityMode::Plaintext => return Ok(None),
        SecurityMode::ServerAuth { identity, .. } => {
            let Some((cert_path, key_path)) = identity else {
                return Err(ChatError::CredentialNotConfigured("server certificate"));
            };
            let chain = load_certificates(cert_path)?;
            let key = load_private_key(key_path)?;
            server_builder()?
                .with_no_client_auth()
                .with_single_cert(chain, key)
                .map_err(|err| invalid(key_path, err))?
        }
        SecurityMode::Mutual(paths) => {
            let roots = load_trust_anchor(&paths.trust_anchor)?;
            let chain = load_certificates(&paths.certificate)?;
            let key = load_private_key(&paths.private_key)?;
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
                .build()
                .map_err(|err| invalid(&paths.trust_anchor, err))?;
            server_builder()?
                .with_client_cert_verifier(verifier)
                .with_single_cert(chain, key)
                .map_err(|err| invalid(&paths.private_key, err))?
        }
    };

    config.alpn_protocols = alpn_protocols();
    Ok(Some(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialPaths;

    #[test]
    fn plaintext_needs_no_material() {
        assert!(client_config(&SecurityMode::Plaintext).unwrap().is_none());
        assert!(server_config(&SecurityMode::Plaintext).unwrap().is_none());
    }

    #[test]
    fn missing_files_are_credential_not_found() {
        let paths = CredentialPaths {
            certificate: "/definitely/missing/client.pem".into(),
            private_key: "/definitely/missing/client.key".into(),
            trust_anchor: "/definitely/missing/ca.pem".into(),
        };
        let err = client_config(&SecurityMode::Mutual(paths)).unwrap_err();
        assert!(matches!(err, ChatError::CredentialNotFound { .. }));
    }

    #[test]
    fn server_auth_client_requires_an_anchor() {
        let security = SecurityMode::ServerAuth {
            identity: None,
            trust_anchor: None,
        };
        let err = client_config(&security).unwrap_err();
        assert!(matches!(err, ChatError::CredentialNotConfigured("trust anchor")));
        assert_eq!(err.to_string(), "no trust anchor configured");
    }

    #[test]
    fn non_pem_file_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, b"this is not a certificate").expect("write");
        let err = load_trust_anchor(&path).unwrap_err();
        assert!(matches!(err, ChatError::InvalidCredential { .. }));
    }
}
