/*
 * SPDX-License-Identifier: Apache-2.0
 */

use std::fmt;
use std::sync::{Arc, RwLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

/// What the platform verifier concluded about the peer certificate,
/// handed to subscribed policies for the final decision.
#[derive(Clone, Debug)]
pub struct FtpCertificateReport {
    /// The name presented for SNI.
    pub server_name: String,
    /// True when the chain verified against the bundled web-pki roots.
    pub chain_verified: bool,
    /// The verifier's complaint when `chain_verified` is false.
    pub finding: Option<String>,
}

/// A subscriber on the certificate validation bus.
///
/// Policies run in subscription order and may set or clear the shared
/// accept flag; the flag's final state decides the handshake.
pub trait FtpCertificatePolicy: Send + Sync {
    fn review(&self, report: &FtpCertificateReport, accept: &mut bool);
}

/// Accepts every certificate. Subscribed on cloned sessions, which talk
/// to a host whose certificate the original session already accepted.
pub struct TrustedHostCertificatePolicy;

impl FtpCertificatePolicy for TrustedHostCertificatePolicy {
    fn review(&self, _report: &FtpCertificateReport, accept: &mut bool) {
        *accept = true;
    }
}

/// Accepts certificates that verified against the web-pki roots.
pub struct WebPkiCertificatePolicy;

impl FtpCertificatePolicy for WebPkiCertificatePolicy {
    fn review(&self, report: &FtpCertificateReport, accept: &mut bool) {
        if report.chain_verified {
            *accept = true;
        }
    }
}

/// Dispatch point for TLS peer validation decisions. With no subscribers
/// every certificate is rejected.
#[derive(Default)]
pub struct FtpCertificateBus {
    policies: RwLock<Vec<Arc<dyn FtpCertificatePolicy>>>,
}

impl FtpCertificateBus {
    pub fn subscribe(&self, policy: Arc<dyn FtpCertificatePolicy>) {
        self.policies.write().unwrap().push(policy);
    }

    pub fn has_subscribers(&self) -> bool {
        !self.policies.read().unwrap().is_empty()
    }

    pub(crate) fn dispatch(&self, report: &FtpCertificateReport) -> bool {
        let policies = self.policies.read().unwrap();
        let mut accept = false;
        for policy in policies.iter() {
            policy.review(report, &mut accept);
        }
        accept
    }
}

impl fmt::Debug for FtpCertificateBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpCertificateBus")
            .field("policies", &self.policies.read().unwrap().len())
            .finish()
    }
}

/// rustls-facing adapter: runs the web-pki verifier for findings, then
/// lets the bus decide. Signature checks stay with the crypto provider.
#[derive(Debug)]
pub(crate) struct BusVerifier {
    bus: Arc<FtpCertificateBus>,
    webpki: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl BusVerifier {
    pub(crate) fn new(bus: Arc<FtpCertificateBus>) -> Self {
        let provider = CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let webpki =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .ok();
        BusVerifier {
            bus,
            webpki,
            provider,
        }
    }
}

impl ServerCertVerifier for BusVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let finding = match &self.webpki {
            Some(verifier) => verifier
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .err()
                .map(|e| e.to_string()),
            None => Some("web-pki verifier unavailable".to_string()),
        };
        let report = FtpCertificateReport {
            server_name: server_name.to_str().into_owned(),
            chain_verified: finding.is_none(),
            finding,
        };
        if self.bus.dispatch(&report) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
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
