/*
 * SPDX-License-Identifier: Apache-2.0
 */

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FtpConfigError {
    #[error("retry attempts must be at least 1")]
    ZeroRetryAttempts,
    #[error("client certificate chain is empty")]
    EmptyClientCertChain,
    #[error("active port set may not contain port 0")]
    ZeroActivePort,
    #[error("host '{0}' is not a valid TLS server name")]
    InvalidServerName(String),
    #[error("client certificate rejected: {0}")]
    BadClientCertificate(String),
}
