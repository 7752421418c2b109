/*
 * SPDX-License-Identifier: Apache-2.0
 */

use std::io;
use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio_rustls::TlsConnector;

use crate::config::{FtpTlsConfig, FtpTlsVersions};
use crate::error::FtpConfigError;

mod verify;

pub use verify::{
    FtpCertificateBus, FtpCertificatePolicy, FtpCertificateReport, TrustedHostCertificatePolicy,
    WebPkiCertificatePolicy,
};

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, FtpConfigError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| FtpConfigError::InvalidServerName(host.to_string()))
}

pub(crate) fn build_connector(
    tls: &FtpTlsConfig,
    bus: &Arc<FtpCertificateBus>,
) -> Result<TlsConnector, FtpConfigError> {
    let versions: &[&rustls::SupportedProtocolVersion] = match tls.versions {
        FtpTlsVersions::All => rustls::ALL_VERSIONS,
        FtpTlsVersions::Tls12Only => &[&rustls::version::TLS12],
        FtpTlsVersions::Tls13Only => &[&rustls::version::TLS13],
    };

    let builder = rustls::ClientConfig::builder_with_protocol_versions(versions)
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verify::BusVerifier::new(bus.clone())));

    let config = if tls.has_client_certificate() {
        let chain: Vec<CertificateDer<'static>> = tls
            .client_cert_chain
            .iter()
            .map(|der| CertificateDer::from(der.clone()))
            .collect();
        let key = tls
            .client_key_pkcs8
            .clone()
            .ok_or(FtpConfigError::EmptyClientCertChain)?;
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key));
        builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| FtpConfigError::BadClientCertificate(e.to_string()))?
    } else {
        builder.with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Whether a handshake error came from the validation bus rejecting the
/// peer, as opposed to an I/O or protocol failure.
pub(crate) fn is_validation_rejection(e: &io::Error) -> bool {
    e.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(|e| {
            matches!(
                e,
                rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure
                )
            )
        })
        .unwrap_or(false)
}
