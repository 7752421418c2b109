/*
 * SPDX-License-Identifier: Apache-2.0
 */

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::FtpConfigError;
use crate::stream::FtpTextEncoding;

pub const FTP_DEFAULT_PORT: u16 = 21;
pub const FTPS_IMPLICIT_PORT: u16 = 990;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FtpEncryptionMode {
    #[default]
    None,
    Explicit,
    Implicit,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FtpTlsVersions {
    #[default]
    All,
    Tls12Only,
    Tls13Only,
}

/// How the data channel for the next transfer gets established.
///
/// The `Auto*` modes probe the extended command first and fall back to the
/// legacy one, remembering the outcome for the rest of the session.
/// `PasvNat` is PASV with the advertised host replaced by the control-peer
/// host whenever the server announces an unroutable address.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FtpDataChannelMode {
    #[default]
    AutoPassive,
    AutoActive,
    Pasv,
    PasvNat,
    Epsv,
    Port,
    Eprt,
}

impl FtpDataChannelMode {
    pub(crate) fn is_active(&self) -> bool {
        matches!(
            self,
            FtpDataChannelMode::AutoActive | FtpDataChannelMode::Port | FtpDataChannelMode::Eprt
        )
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FtpIpPreference {
    #[default]
    Any,
    Ipv4Only,
    Ipv6Only,
}

/// Hint for the listing parser selected by higher layers; the core only
/// stores and transports it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FtpListingParserHint {
    #[default]
    Auto,
    Unix,
    Dos,
    Machine,
    Vms,
}

/// Source of the local address announced in PORT/EPRT, for clients that
/// sit behind NAT and must advertise their external address.
pub trait FtpLocalAddressResolver: Send + Sync {
    fn announced_ip(&self) -> IpAddr;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FtpControlConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_line_len: usize,
    pub max_multi_lines: usize,
}

impl Default for FtpControlConfig {
    fn default() -> Self {
        FtpControlConfig {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(15),
            max_line_len: 2048,
            max_multi_lines: 128,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FtpDataChannelConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for FtpDataChannelConfig {
    fn default() -> Self {
        FtpDataChannelConfig {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(15),
        }
    }
}

/// TLS material and constraints for both control and data channels.
///
/// Certificates and the key are raw DER; the key is PKCS#8.
#[derive(Clone, Default)]
pub struct FtpTlsConfig {
    pub versions: FtpTlsVersions,
    pub client_cert_chain: Vec<Vec<u8>>,
    pub client_key_pkcs8: Option<Vec<u8>>,
}

impl FtpTlsConfig {
    pub fn set_client_certificate(&mut self, chain_der: Vec<Vec<u8>>, key_pkcs8_der: Vec<u8>) {
        self.client_cert_chain = chain_der;
        self.client_key_pkcs8 = Some(key_pkcs8_der);
    }

    pub(crate) fn has_client_certificate(&self) -> bool {
        self.client_key_pkcs8.is_some()
    }
}

impl fmt::Debug for FtpTlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpTlsConfig")
            .field("versions", &self.versions)
            .field("client_cert_chain", &self.client_cert_chain.len())
            .field("client_key_pkcs8", &self.client_key_pkcs8.is_some())
            .finish()
    }
}

/// Everything a session needs to know. Fields may be changed while the
/// session is connected; they are read again on each subsequent operation.
#[derive(Clone)]
pub struct FtpSessionConfig {
    pub host: String,
    /// 0 means infer from the encryption mode (21, or 990 for implicit TLS).
    pub port: u16,
    pub username: String,
    pub password: String,
    pub encryption: FtpEncryptionMode,
    pub tls: FtpTlsConfig,
    pub data_channel_mode: FtpDataChannelMode,
    pub encrypt_data_channel: bool,
    pub ip_preference: FtpIpPreference,
    pub control: FtpControlConfig,
    pub data: FtpDataChannelConfig,
    pub poll_interval: Duration,
    pub keep_alive: bool,
    pub stale_data_check: bool,
    pub ungraceful_disconnect: bool,
    pub transfer_chunk_size: usize,
    pub retry_attempts: u32,
    pub upload_rate_kbps: Option<u64>,
    pub download_rate_kbps: Option<u64>,
    pub listing_parser: FtpListingParserHint,
    pub listing_culture: Option<String>,
    pub time_offset_minutes: i32,
    pub auto_utf8: bool,
    pub encoding: FtpTextEncoding,
    pub address_resolver: Option<Arc<dyn FtpLocalAddressResolver>>,
    /// Local ports allowed for active-mode listeners; empty means ephemeral.
    pub active_ports: Vec<u16>,
}

impl Default for FtpSessionConfig {
    fn default() -> Self {
        FtpSessionConfig {
            host: String::new(),
            port: 0,
            username: "anonymous".to_string(),
            password: "anonymous".to_string(),
            encryption: FtpEncryptionMode::None,
            tls: FtpTlsConfig::default(),
            data_channel_mode: FtpDataChannelMode::AutoPassive,
            encrypt_data_channel: true,
            ip_preference: FtpIpPreference::Any,
            control: FtpControlConfig::default(),
            data: FtpDataChannelConfig::default(),
            poll_interval: Duration::from_secs(15),
            keep_alive: false,
            stale_data_check: true,
            ungraceful_disconnect: false,
            transfer_chunk_size: 65536,
            retry_attempts: 1,
            upload_rate_kbps: None,
            download_rate_kbps: None,
            listing_parser: FtpListingParserHint::Auto,
            listing_culture: None,
            time_offset_minutes: 0,
            auto_utf8: true,
            encoding: FtpTextEncoding::Ascii,
            address_resolver: None,
            active_ports: Vec::new(),
        }
    }
}

impl FtpSessionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        FtpSessionConfig {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn effective_port(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        match self.encryption {
            FtpEncryptionMode::Implicit => FTPS_IMPLICIT_PORT,
            _ => FTP_DEFAULT_PORT,
        }
    }

    pub fn validate(&self) -> Result<(), FtpConfigError> {
        if self.retry_attempts < 1 {
            return Err(FtpConfigError::ZeroRetryAttempts);
        }
        if self.active_ports.contains(&0) {
            return Err(FtpConfigError::ZeroActivePort);
        }
        if self.tls.client_key_pkcs8.is_some() && self.tls.client_cert_chain.is_empty() {
            return Err(FtpConfigError::EmptyClientCertChain);
        }
        Ok(())
    }
}

impl fmt::Debug for FtpSessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpSessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("encryption", &self.encryption)
            .field("tls", &self.tls)
            .field("data_channel_mode", &self.data_channel_mode)
            .field("encrypt_data_channel", &self.encrypt_data_channel)
            .field("ip_preference", &self.ip_preference)
            .field("control", &self.control)
            .field("data", &self.data)
            .field("keep_alive", &self.keep_alive)
            .field("stale_data_check", &self.stale_data_check)
            .field("ungraceful_disconnect", &self.ungraceful_disconnect)
            .field("encoding", &self.encoding)
            .field("active_ports", &self.active_ports)
            .finish_non_exhaustive()
    }
}
