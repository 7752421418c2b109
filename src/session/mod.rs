/*
 * SPDX-License-Identifier: Apache-2.0
 */

use std::io;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::{FtpEncryptionMode, FtpListingParserHint, FtpSessionConfig};
use crate::error::{FtpCommandError, FtpConnectError, FtpReplyError};
use crate::feature::{FtpFeatureSet, FtpHashAlgorithm, FtpServerFeatures};
use crate::log_msg;
use crate::reply::{FtpReply, FtpReplyParser};
use crate::stream::{self, FtpLineStream, FtpStream, FtpTextEncoding};
use crate::tls::{self, FtpCertificateBus, TrustedHostCertificatePolicy};
use crate::transfer::{FtpActiveFlavor, FtpPassiveFlavor, FtpTransferType};

/// An FTP control connection.
///
/// All operations serialize on one internal lock, so a session never has
/// more than one command in flight. For concurrent transfers create
/// sibling sessions with [`FtpSession::clone_session`].
pub struct FtpSession {
    pub(crate) core: Mutex<SessionCore>,
    pub(crate) cert_bus: Arc<FtpCertificateBus>,
}

pub(crate) struct SessionCore {
    pub(crate) config: FtpSessionConfig,
    pub(crate) stream: Option<FtpLineStream>,
    pub(crate) disposed: bool,
    pub(crate) is_clone: bool,
    pub(crate) encoding: FtpTextEncoding,
    pub(crate) greeting: Option<FtpReply>,
    pub(crate) system_type: Option<String>,
    pub(crate) features: FtpServerFeatures,
    pub(crate) transfer_type: FtpTransferType,
    pub(crate) data_protected: bool,
    pub(crate) passive_memo: Option<FtpPassiveFlavor>,
    pub(crate) active_memo: Option<FtpActiveFlavor>,
    pub(crate) listing_hint: FtpListingParserHint,
}

impl FtpSession {
    pub fn new(config: FtpSessionConfig) -> Self {
        let encoding = config.encoding;
        FtpSession {
            core: Mutex::new(SessionCore {
                config,
                stream: None,
                disposed: false,
                is_clone: false,
                encoding,
                greeting: None,
                system_type: None,
                features: FtpServerFeatures::default(),
                transfer_type: FtpTransferType::Ascii,
                data_protected: false,
                passive_memo: None,
                active_memo: None,
                listing_hint: FtpListingParserHint::Auto,
            }),
            cert_bus: Arc::new(FtpCertificateBus::default()),
        }
    }

    /// The bus consulted for TLS peer validation. Subscribe a policy
    /// before connecting; with no subscribers every handshake fails.
    pub fn certificate_bus(&self) -> &Arc<FtpCertificateBus> {
        &self.cert_bus
    }

    pub async fn connect(&self) -> Result<(), FtpConnectError> {
        let mut core = self.core.lock().await;
        core.connect_procedure(&self.cert_bus).await
    }

    /// Send one command and return the server's reply, whatever its code.
    ///
    /// A disconnected session reconnects first, except for `QUIT`, which
    /// yields a synthetic `200` without touching the network. When the
    /// stale-data check finds unread bytes on an unencrypted stream they
    /// are drained, logged and the connection is replaced.
    pub async fn execute(&self, command: &str) -> Result<FtpReply, FtpCommandError> {
        let mut core = self.core.lock().await;
        if core.disposed {
            return Err(FtpCommandError::SessionClosed);
        }

        if core.config.stale_data_check {
            let poisoned = match core.stream.as_mut() {
                Some(stream)
                    if !stream.is_tls()
                        && !stream.is_broken()
                        && stream.bytes_available() > 0 =>
                {
                    let stale = stream.take_stale_bytes();
                    log_msg!(
                        "discarded {} stale bytes before '{}': {:?}",
                        stale.len(),
                        crate::debug::redact_command(command),
                        String::from_utf8_lossy(&stale)
                    );
                    stream.shutdown().await;
                    true
                }
                _ => false,
            };
            if poisoned {
                core.stream = None;
            }
        }

        if !core.is_connected() {
            if command.trim().eq_ignore_ascii_case("QUIT") {
                return Ok(FtpReply::synthetic(200, "Connection already closed."));
            }
            core.connect_procedure(&self.cert_bus)
                .await
                .map_err(|e| FtpCommandError::ReconnectFailed(Box::new(e)))?;
        }

        core.send_command(command).await?;
        core.read_reply_timed("command").await
    }

    /// Read the next reply without sending anything, for callers that
    /// wrote to the stream themselves (e.g. after a transfer command).
    pub async fn get_reply(&self) -> Result<FtpReply, FtpCommandError> {
        let mut core = self.core.lock().await;
        if core.disposed {
            return Err(FtpCommandError::SessionClosed);
        }
        core.read_reply_timed("reply").await
    }

    /// Write raw bytes on the control stream, for callers that speak the
    /// protocol themselves and collect replies with [`FtpSession::get_reply`].
    pub async fn write_raw(&self, buf: &[u8]) -> Result<(), FtpCommandError> {
        let mut core = self.core.lock().await;
        if core.disposed {
            return Err(FtpCommandError::SessionClosed);
        }
        let stream = core.stream.as_mut().ok_or(FtpCommandError::NotConnected)?;
        stream.write_raw(buf).await.map_err(FtpCommandError::SendFailed)
    }

    /// Read raw bytes off the control stream. Returns 0 on EOF.
    pub async fn read_raw(&self, buf: &mut [u8]) -> Result<usize, FtpCommandError> {
        let mut core = self.core.lock().await;
        if core.disposed {
            return Err(FtpCommandError::SessionClosed);
        }
        let stream = core.stream.as_mut().ok_or(FtpCommandError::NotConnected)?;
        stream
            .read_raw(buf)
            .await
            .map_err(|e| FtpCommandError::RecvFailed(FtpReplyError::ReadFailed(e)))
    }

    /// Graceful teardown: QUIT (unless configured ungraceful, or the
    /// stream already died) and close. Errors during shutdown are
    /// expected and swallowed. A no-op when already disconnected.
    pub async fn disconnect(&self) {
        let mut core = self.core.lock().await;
        core.disconnect_procedure().await;
    }

    /// Dispose of the session: disconnect, release the socket and refuse
    /// all further operations. Safe to call any number of times.
    pub async fn close(&self) {
        let mut core = self.core.lock().await;
        if core.disposed {
            return;
        }
        core.disconnect_procedure().await;
        core.disposed = true;
    }

    pub async fn is_connected(&self) -> bool {
        self.core.lock().await.is_connected()
    }

    pub async fn is_closed(&self) -> bool {
        self.core.lock().await.disposed
    }

    pub async fn is_clone(&self) -> bool {
        self.core.lock().await.is_clone
    }

    pub async fn has_feature(&self, feature: FtpFeatureSet) -> bool {
        self.core.lock().await.features.has(feature)
    }

    pub async fn features(&self) -> FtpServerFeatures {
        self.core.lock().await.features.clone()
    }

    pub async fn hash_algorithms(&self) -> Vec<FtpHashAlgorithm> {
        self.core.lock().await.features.hash_algorithms().to_vec()
    }

    pub async fn system_type(&self) -> Option<String> {
        self.core.lock().await.system_type.clone()
    }

    pub async fn welcome_reply(&self) -> Option<FtpReply> {
        self.core.lock().await.greeting.clone()
    }

    pub async fn encoding(&self) -> FtpTextEncoding {
        self.core.lock().await.encoding
    }

    pub async fn listing_parser_hint(&self) -> FtpListingParserHint {
        self.core.lock().await.listing_hint
    }

    /// Change configuration fields; they apply to subsequent operations.
    pub async fn update_config<F>(&self, f: F)
    where
        F: FnOnce(&mut FtpSessionConfig),
    {
        let mut core = self.core.lock().await;
        f(&mut core.config);
    }

    /// Keep-alive reaches the live socket immediately, unlike other
    /// configuration fields.
    pub async fn set_keep_alive(&self, enable: bool) -> io::Result<()> {
        let mut core = self.core.lock().await;
        core.config.keep_alive = enable;
        match core.stream.as_ref() {
            Some(stream) => stream.set_keep_alive(enable),
            None => Ok(()),
        }
    }

    /// Probe the socket if the poll interval elapsed since the last I/O.
    pub async fn poll_liveness(&self) -> bool {
        let mut core = self.core.lock().await;
        let interval = core.config.poll_interval;
        match core.stream.as_mut() {
            Some(stream) => stream.poll_liveness(interval),
            None => false,
        }
    }

    /// A disconnected sibling session sharing this session's
    /// configuration, capability set and data-channel memos.
    ///
    /// The sibling trusts the server certificate outright (the original
    /// session already accepted it) and skips capability discovery on
    /// connect. It owns its socket and is closed independently.
    pub async fn clone_session(&self) -> FtpSession {
        let core = self.core.lock().await;
        let bus = Arc::new(FtpCertificateBus::default());
        bus.subscribe(Arc::new(TrustedHostCertificatePolicy));
        FtpSession {
            core: Mutex::new(SessionCore {
                config: core.config.clone(),
                stream: None,
                disposed: false,
                is_clone: true,
                encoding: core.encoding,
                greeting: None,
                system_type: core.system_type.clone(),
                features: core.features.clone(),
                transfer_type: FtpTransferType::Ascii,
                data_protected: false,
                passive_memo: core.passive_memo,
                active_memo: core.active_memo,
                listing_hint: core.listing_hint,
            }),
            cert_bus: bus,
        }
    }
}

impl SessionCore {
    pub(crate) fn is_connected(&self) -> bool {
        self.stream.as_ref().map(|s| !s.is_broken()).unwrap_or(false)
    }

    pub(crate) async fn connect_procedure(
        &mut self,
        bus: &Arc<FtpCertificateBus>,
    ) -> Result<(), FtpConnectError> {
        match self.connect_inner(bus).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(mut stream) = self.stream.take() {
                    stream.shutdown().await;
                }
                Err(e)
            }
        }
    }

    async fn connect_inner(&mut self, bus: &Arc<FtpCertificateBus>) -> Result<(), FtpConnectError> {
        if self.disposed {
            return Err(FtpConnectError::SessionClosed);
        }
        self.config.validate()?;
        if self.is_connected() {
            self.disconnect_procedure().await;
        }

        self.encoding = self.config.encoding;
        self.greeting = None;
        self.system_type = None;
        self.data_protected = false;

        let host = self.config.host.clone();
        let port = self.config.effective_port();
        let tcp = stream::connect_tcp(
            &host,
            port,
            self.config.ip_preference,
            self.config.control.connect_timeout,
        )
        .await?;
        let line_stream = FtpLineStream::new(FtpStream::Plain(tcp), self.config.control.max_line_len);
        if self.config.keep_alive {
            let _ = line_stream.set_keep_alive(true);
        }
        self.stream = Some(line_stream);

        if self.config.encryption == FtpEncryptionMode::Implicit {
            self.activate_tls(bus, &host).await?;
        }

        let greeting = self
            .read_reply_timed("greeting")
            .await
            .map_err(connect_recv_error)?;
        if !greeting.success() {
            return Err(FtpConnectError::GreetingRejected(greeting));
        }
        self.greeting = Some(greeting);

        if self.config.encryption == FtpEncryptionMode::Explicit {
            let reply = self.execute_raw("AUTH TLS", "auth tls").await?;
            if !reply.success() {
                return Err(FtpConnectError::TlsNotAvailable(reply));
            }
            self.activate_tls(bus, &host).await?;
        }

        if !self.config.username.is_empty() {
            self.authenticate().await?;
        }

        let encrypted = self.stream.as_ref().map(|s| s.is_tls()).unwrap_or(false);
        if encrypted && self.config.encrypt_data_channel {
            let reply = self.execute_raw("PBSZ 0", "pbsz").await?;
            if !reply.success() {
                return Err(FtpConnectError::ProtectionSetupFailed(reply));
            }
            let reply = self.execute_raw("PROT P", "prot").await?;
            if !reply.success() {
                return Err(FtpConnectError::ProtectionSetupFailed(reply));
            }
            self.data_protected = true;
        }

        if !self.is_clone {
            let reply = self.execute_raw("FEAT", "feat").await?;
            self.features = if reply.success() {
                FtpServerFeatures::parse_feat_lines(reply.info_lines().iter().map(String::as_str))
            } else {
                FtpServerFeatures::default()
            };
        }

        if self.config.auto_utf8
            && self.encoding == FtpTextEncoding::Ascii
            && self.features.has(FtpFeatureSet::UTF8)
        {
            self.encoding = FtpTextEncoding::Utf8;
            // advisory; servers already in UTF-8 mode may refuse it
            let _ = self.execute_raw("OPTS UTF8 ON", "opts utf8").await;
        }

        let reply = self.execute_raw("SYST", "syst").await?;
        if reply.success() {
            self.system_type = Some(reply.message().to_string());
        }
        self.listing_hint = self.config.listing_parser;

        Ok(())
    }

    async fn activate_tls(
        &mut self,
        bus: &Arc<FtpCertificateBus>,
        host: &str,
    ) -> Result<(), FtpConnectError> {
        let connector = tls::build_connector(&self.config.tls, bus)?;
        let name = tls::server_name(host)?;
        let stream = self
            .stream
            .take()
            .ok_or(FtpCommandError::NotConnected)
            .map_err(FtpConnectError::CommandError)?;
        match stream.into_tls(&connector, name).await {
            Ok(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                if tls::is_validation_rejection(&e) {
                    Err(FtpConnectError::TlsPeerRejected)
                } else {
                    Err(FtpConnectError::TlsHandshakeFailed(e))
                }
            }
        }
    }

    /// USER, then PASS when the server asks for it. A 2xx after USER
    /// means no password is required.
    async fn authenticate(&mut self) -> Result<(), FtpConnectError> {
        let user = format!("USER {}", self.config.username);
        let reply = self.execute_raw(&user, "user").await?;
        if reply.is_completion() {
            return Ok(());
        }
        if !reply.is_intermediate() {
            return Err(FtpConnectError::LoginFailed(reply));
        }
        let pass = format!("PASS {}", self.config.password);
        let reply = self.execute_raw(&pass, "pass").await?;
        if reply.is_completion() {
            Ok(())
        } else {
            Err(FtpConnectError::LoginFailed(reply))
        }
    }

    pub(crate) async fn disconnect_procedure(&mut self) {
        let alive = self.stream.as_ref().map(|s| !s.is_broken()).unwrap_or(false);
        if alive && !self.config.ungraceful_disconnect {
            if self.send_command("QUIT").await.is_ok() {
                let _ = self.read_reply_timed("quit").await;
            }
        }
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await;
        }
    }

    pub(crate) async fn execute_raw(
        &mut self,
        command: &str,
        stage: &'static str,
    ) -> Result<FtpReply, FtpCommandError> {
        self.send_command(command).await?;
        self.read_reply_timed(stage).await
    }

    pub(crate) async fn send_command(&mut self, command: &str) -> Result<(), FtpCommandError> {
        let encoding = self.encoding;
        let stream = self.stream.as_mut().ok_or(FtpCommandError::NotConnected)?;
        #[cfg(feature = "log-raw-io")]
        crate::debug::log_cmd(command);
        stream
            .write_line(encoding, command)
            .await
            .map_err(FtpCommandError::SendFailed)
    }

    pub(crate) async fn read_reply_timed(
        &mut self,
        stage: &'static str,
    ) -> Result<FtpReply, FtpCommandError> {
        let timeout = self.config.control.read_timeout;
        match tokio::time::timeout(timeout, self.read_reply()).await {
            Ok(r) => r,
            Err(_) => Err(FtpCommandError::RecvFailed(FtpReplyError::ReadTimedOut(
                stage,
            ))),
        }
    }

    async fn read_reply(&mut self) -> Result<FtpReply, FtpCommandError> {
        let encoding = self.encoding;
        let max_lines = self.config.control.max_multi_lines;
        let stream = self.stream.as_mut().ok_or(FtpCommandError::NotConnected)?;
        let mut parser = FtpReplyParser::new(max_lines);
        loop {
            match stream.read_line(encoding).await {
                Ok(Some(line)) => {
                    #[cfg(feature = "log-raw-io")]
                    crate::debug::log_rsp(&line);
                    if let Some(reply) =
                        parser.feed_line(&line).map_err(FtpCommandError::RecvFailed)?
                    {
                        return Ok(reply);
                    }
                }
                Ok(None) => {
                    return Err(FtpCommandError::RecvFailed(FtpReplyError::UnexpectedEof {
                        partial: parser.into_partial(),
                    }));
                }
                Err(FtpReplyError::UnexpectedEof { partial }) => {
                    let mut lines = parser.into_partial();
                    lines.extend(partial);
                    return Err(FtpCommandError::RecvFailed(FtpReplyError::UnexpectedEof {
                        partial: lines,
                    }));
                }
                Err(e) => return Err(FtpCommandError::RecvFailed(e)),
            }
        }
    }
}

fn connect_recv_error(e: FtpCommandError) -> FtpConnectError {
    match e {
        FtpCommandError::RecvFailed(reply_err) => FtpConnectError::GreetingFailed(reply_err),
        other => FtpConnectError::CommandError(other),
    }
}
