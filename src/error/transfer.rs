/*
 * SPDX-License-Identifier: Apache-2.0
 */

use std::io;

use thiserror::Error;

use super::{FtpCommandError, FtpConfigError};
use crate::reply::FtpReply;

#[derive(Debug, Error)]
pub enum FtpTransferSetupError {
    #[error("server refused {0}: {1}")]
    Refused(&'static str, FtpReply),
    #[error("invalid PASV reply: {0}")]
    InvalidPasvReply(FtpReply),
    #[error("invalid EPSV reply: {0}")]
    InvalidEpsvReply(FtpReply),
    #[error("data connection failed: {0:?}")]
    DataConnectFailed(io::Error),
    #[error("timed out to connect data channel")]
    DataConnectTimedOut,
    #[error("accept on data listener failed: {0:?}")]
    AcceptFailed(io::Error),
    #[error("timed out to accept data connection")]
    AcceptTimedOut,
    #[error("no usable local port for active mode: {0:?}")]
    NoUsableLocalPort(io::Error),
    #[error("control connection address unavailable: {0:?}")]
    ControlAddressUnavailable(io::Error),
    #[error("PORT requires an IPv4 local address")]
    AddressFamilyMismatch,
    #[error("invalid TLS configuration: {0}")]
    InvalidTlsConfig(FtpConfigError),
    #[error("TLS wrap of data channel failed: {0:?}")]
    TlsWrapFailed(io::Error),
    #[error("command failed: {0}")]
    CommandError(#[from] FtpCommandError),
}

impl FtpTransferSetupError {
    /// Whether an automatic-mode prober may try the legacy command after
    /// this failure: only a permanent (5xx) refusal qualifies.
    pub(crate) fn can_fall_back(&self) -> bool {
        matches!(self, FtpTransferSetupError::Refused(_, reply) if reply.is_permanent())
    }
}
