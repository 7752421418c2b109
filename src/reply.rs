/*
 * SPDX-License-Identifier: Apache-2.0
 */

use std::fmt;

use crate::error::FtpReplyError;

/// Reply categories per the leading code digit. Codes in the 6xx range
/// are protected replies carried over an encrypted channel (RFC 2228).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FtpReplyCategory {
    PositivePreliminary,
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
    Protected,
}

/// A single parsed server reply.
///
/// `message` is the text of the terminating line, `info_lines` holds any
/// lines that arrived before it (multi-line replies).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FtpReply {
    code: u16,
    message: String,
    info_lines: Vec<String>,
}

impl FtpReply {
    pub(crate) fn new(code: u16, message: String, info_lines: Vec<String>) -> Self {
        FtpReply {
            code,
            message,
            info_lines,
        }
    }

    /// A locally generated reply that never touched the wire.
    pub(crate) fn synthetic(code: u16, message: &str) -> Self {
        FtpReply {
            code,
            message: message.to_string(),
            info_lines: Vec::new(),
        }
    }

    #[inline]
    pub fn code(&self) -> u16 {
        self.code
    }

    #[inline]
    pub fn message(&self) -> &str {
        self.message.as_str()
    }

    #[inline]
    pub fn info_lines(&self) -> &[String] {
        self.info_lines.as_slice()
    }

    pub fn info_messages(&self) -> String {
        self.info_lines.join("\n")
    }

    pub fn category(&self) -> FtpReplyCategory {
        match self.code / 100 {
            1 => FtpReplyCategory::PositivePreliminary,
            2 => FtpReplyCategory::PositiveCompletion,
            3 => FtpReplyCategory::PositiveIntermediate,
            4 => FtpReplyCategory::TransientNegative,
            6 => FtpReplyCategory::Protected,
            _ => FtpReplyCategory::PermanentNegative,
        }
    }

    /// True for 1xx, 2xx and 3xx replies.
    #[inline]
    pub fn success(&self) -> bool {
        (100..400).contains(&self.code)
    }

    #[inline]
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    #[inline]
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    #[inline]
    pub fn is_permanent(&self) -> bool {
        (500..600).contains(&self.code)
    }
}

impl fmt::Display for FtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

macro_rules! char_to_u16 {
    ($c:expr) => {
        ($c - b'0') as u16
    };
}

fn leading_code(line: &str) -> Option<u16> {
    let b = line.as_bytes();
    if b.len() < 3 {
        return None;
    }
    if !b[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    Some(char_to_u16!(b[0]) * 100 + char_to_u16!(b[1]) * 10 + char_to_u16!(b[2]))
}

/// Line-fed reply assembler implementing the RFC 959 multi-line rule:
/// `DDD ` terminates, `DDD-` opens a multi-line reply that ends with the
/// same code followed by a space. Lines in between are informational.
pub(crate) struct FtpReplyParser {
    end_code: Option<u16>,
    lines: Vec<String>,
    max_lines: usize,
}

impl FtpReplyParser {
    pub(crate) fn new(max_lines: usize) -> Self {
        FtpReplyParser {
            end_code: None,
            lines: Vec::new(),
            max_lines,
        }
    }

    /// Bytes of server output seen so far, for diagnostics on EOF.
    pub(crate) fn into_partial(self) -> Vec<String> {
        self.lines
    }

    pub(crate) fn feed_line(&mut self, line: &str) -> Result<Option<FtpReply>, FtpReplyError> {
        if self.lines.len() >= self.max_lines {
            return Err(FtpReplyError::TooManyLines);
        }
        let line = line.trim_end();

        if let Some(end_code) = self.end_code {
            if let Some(code) = leading_code(line) {
                if code == end_code && line.as_bytes().get(3).copied() == Some(b' ') {
                    let message = line[4..].to_string();
                    let info_lines = std::mem::take(&mut self.lines);
                    return Ok(Some(FtpReply::new(code, message, info_lines)));
                }
            }
            self.lines.push(line.to_string());
            return Ok(None);
        }

        match leading_code(line) {
            Some(code) => match line.as_bytes().get(3).copied() {
                Some(b' ') => {
                    check_code(code)?;
                    let message = line[4..].to_string();
                    let info_lines = std::mem::take(&mut self.lines);
                    Ok(Some(FtpReply::new(code, message, info_lines)))
                }
                Some(b'-') => {
                    check_code(code)?;
                    self.end_code = Some(code);
                    self.lines.push(line[4..].to_string());
                    Ok(None)
                }
                None => {
                    // bare "DDD" terminator with an empty message
                    check_code(code)?;
                    let info_lines = std::mem::take(&mut self.lines);
                    Ok(Some(FtpReply::new(code, String::new(), info_lines)))
                }
                Some(_) => Err(FtpReplyError::InvalidLineFormat),
            },
            None => {
                if self.lines.is_empty() {
                    // the very first line of a reply must carry a code
                    Err(FtpReplyError::InvalidLineFormat)
                } else {
                    self.lines.push(line.to_string());
                    Ok(None)
                }
            }
        }
    }
}

fn check_code(code: u16) -> Result<(), FtpReplyError> {
    if (100..700).contains(&code) {
        Ok(())
    } else {
        Err(FtpReplyError::InvalidReplyCode(code))
    }
}
