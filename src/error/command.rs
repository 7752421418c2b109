/*
 * SPDX-License-Identifier: Apache-2.0
 */

use std::io;

use thiserror::Error;

use super::{FtpConnectError, FtpReplyError};

#[derive(Debug, Error)]
pub enum FtpCommandError {
    #[error("session is closed")]
    SessionClosed,
    #[error("not connected")]
    NotConnected,
    #[error("unable to send command: {0:?}")]
    SendFailed(io::Error),
    #[error("unable to recv reply: {0}")]
    RecvFailed(#[from] FtpReplyError),
    #[error("reconnect before command failed: {0}")]
    ReconnectFailed(Box<FtpConnectError>),
}
