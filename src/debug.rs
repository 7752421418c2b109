/*
 * SPDX-License-Identifier: Apache-2.0
 */

use log::Level;

pub const FTP_DEBUG_LOG_LEVEL: Level = Level::Debug;
pub const FTP_DEBUG_LOG_TARGET: &str = "ftpkit";

#[macro_export]
macro_rules! log_msg {
    ($s:literal, $($arg:tt)+) => (
        log::log!(target: $crate::FTP_DEBUG_LOG_TARGET, $crate::FTP_DEBUG_LOG_LEVEL, $s, $($arg)+)
    )
}

/// Command text safe for any log sink: a `PASS` argument never reaches one.
pub(crate) fn redact_command(command: &str) -> &str {
    let verb = command.trim_start();
    if verb.len() >= 4 && verb.as_bytes()[..4].eq_ignore_ascii_case(b"PASS") {
        "PASS ******"
    } else {
        command
    }
}

#[cfg(feature = "log-raw-io")]
#[inline]
pub(crate) fn log_cmd(command: &str) {
    log::log!(
        target: FTP_DEBUG_LOG_TARGET,
        FTP_DEBUG_LOG_LEVEL,
        "> {}",
        redact_command(command)
    );
}

#[cfg(feature = "log-raw-io")]
#[inline]
pub(crate) fn log_rsp(line: &str) {
    log::log!(
        target: FTP_DEBUG_LOG_TARGET,
        FTP_DEBUG_LOG_LEVEL,
        "< {}",
        line
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_arguments_are_redacted() {
        assert_eq!(redact_command("PASS hunter2"), "PASS ******");
        assert_eq!(redact_command("pass hunter2"), "PASS ******");
        assert_eq!(redact_command("  PASS hunter2"), "PASS ******");
        assert_eq!(redact_command("PASS"), "PASS ******");
    }

    #[test]
    fn other_commands_pass_through() {
        assert_eq!(redact_command("USER demo"), "USER demo");
        assert_eq!(redact_command("PWD"), "PWD");
        assert_eq!(redact_command("PA"), "PA");
    }
}
