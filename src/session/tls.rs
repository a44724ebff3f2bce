//! TLS material for `ssl://` brokers.
//!
//! Certificates are read from the configured paths. `insecure=true` swaps
//! the server certificate check for a verifier that accepts anything.

use std::fs;
use std::io::BufReader;
use std::sync::Arc;

use rumqttc::TlsConfiguration;
use rumqttc::tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};

use crate::config::TlsSettings;
use crate::utils::error::{BridgeError, Result};

/// Builds the TLS configuration. `None` means the default trust roots.
pub(super) fn load_tls(tls: &TlsSettings) -> Result<Option<TlsConfiguration>> {
    if tls.insecure {
        return insecure_config(tls).map(Some);
    }

    let client_auth = match (&tls.cert_file, &tls.cert_key_file) {
        (Some(cert), Some(key)) => Some((fs::read(cert)?, fs::read(key)?)),
        _ => None,
    };

    match &tls.ca_file {
        Some(ca_file) => Ok(Some(TlsConfiguration::Simple {
            ca: fs::read(ca_file)?,
            alpn: None,
            client_auth,
        })),
        None if client_auth.is_some() => Err(BridgeError::validation(
            "ca_file",
            "a client certificate requires ca_file",
        )),
        None => Ok(None),
    }
}

fn insecure_config(tls: &TlsSettings) -> Result<TlsConfiguration> {
    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification));

    let config = match (&tls.cert_file, &tls.cert_key_file) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certificates(cert)?, load_private_key(key)?)
            .map_err(|err| {
                BridgeError::validation("cert_file", format!("invalid client cert/key: {err}"))
            })?,
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConfiguration::Rustls(Arc::new(config)))
}

fn load_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(BridgeError::validation(
            "cert_file",
            format!("no certificates found in {path}"),
        ));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        BridgeError::validation("cert_key_file", format!("no private key found in {path}"))
    })
}

/// Accepts any server certificate.
#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
