/*
 * SPDX-License-Identifier: Apache-2.0
 */

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FtpReplyError {
    #[error("read failed: {0:?}")]
    ReadFailed(io::Error),
    #[error("connection closed while waiting for a reply")]
    UnexpectedEof { partial: Vec<String> },
    #[error("reply line too long")]
    LineTooLong,
    #[error("invalid reply line format")]
    InvalidLineFormat,
    #[error("invalid reply code {0}")]
    InvalidReplyCode(u16),
    #[error("too many lines in reply")]
    TooManyLines,
    #[error("read reply for stage '{0}' timed out")]
    ReadTimedOut(&'static str),
}

impl FtpReplyError {
    /// Lines accumulated before the stream went away, if any.
    pub fn partial_lines(&self) -> &[String] {
        match self {
            FtpReplyError::UnexpectedEof { partial } => partial.as_slice(),
            _ => &[],
        }
    }
}
