/*
 * SPDX-License-Identifier: Apache-2.0
 */

use std::io;

use thiserror::Error;

use super::{FtpCommandError, FtpConfigError, FtpReplyError};
use crate::reply::FtpReply;

#[derive(Debug, Error)]
pub enum FtpConnectError {
    #[error("session is closed")]
    SessionClosed,
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] FtpConfigError),
    #[error("address resolution failed: {0:?}")]
    ResolveFailed(io::Error),
    #[error("no server address was reachable")]
    NetworkUnreachable,
    #[error("timed out to connect")]
    ConnectTimedOut,
    #[error("greeting failed: {0}")]
    GreetingFailed(FtpReplyError),
    #[error("server rejected session: {0}")]
    GreetingRejected(FtpReply),
    #[error("server refused AUTH TLS: {0}")]
    TlsNotAvailable(FtpReply),
    #[error("TLS handshake failed: {0:?}")]
    TlsHandshakeFailed(io::Error),
    #[error("no certificate policy accepted the server certificate")]
    TlsPeerRejected,
    #[error("login failed: {0}")]
    LoginFailed(FtpReply),
    #[error("data protection setup failed: {0}")]
    ProtectionSetupFailed(FtpReply),
    #[error("command failed: {0}")]
    CommandError(#[from] FtpCommandError),
}
