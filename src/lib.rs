/*
 * SPDX-License-Identifier: Apache-2.0
 */

//! Async FTP / FTPS client core.
//!
//! This crate implements the control-connection protocol engine of an FTP
//! client: session establishment with explicit or implicit TLS, USER/PASS
//! authentication, command execution with RFC 959 multi-line reply
//! parsing, FEAT capability discovery, and passive/active data channel
//! setup with protected-channel (PBSZ/PROT) coordination. Higher layers
//! build file operations and listing parsers on top of [`FtpSession`].

mod config;
mod debug;
mod error;
mod feature;
mod reply;
mod session;
mod stream;
mod tls;
mod transfer;

pub use config::{
    FtpControlConfig, FtpDataChannelConfig, FtpDataChannelMode, FtpEncryptionMode, FtpIpPreference,
    FtpListingParserHint, FtpLocalAddressResolver, FtpSessionConfig, FtpTlsConfig, FtpTlsVersions,
    FTPS_IMPLICIT_PORT, FTP_DEFAULT_PORT,
};
pub use debug::{FTP_DEBUG_LOG_LEVEL, FTP_DEBUG_LOG_TARGET};
pub use error::{
    FtpCommandError, FtpConfigError, FtpConnectError, FtpReplyError, FtpTransferSetupError,
};
pub use feature::{FtpFeatureSet, FtpHashAlgorithm, FtpServerFeatures};
pub use reply::{FtpReply, FtpReplyCategory};
pub use session::FtpSession;
pub use stream::{FtpStream, FtpTextEncoding};
pub use tls::{
    FtpCertificateBus, FtpCertificatePolicy, FtpCertificateReport, TrustedHostCertificatePolicy,
    WebPkiCertificatePolicy,
};
pub use transfer::{FtpDataChannel, FtpTransferType};
