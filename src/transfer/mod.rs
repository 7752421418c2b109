/*
 * SPDX-License-Identifier: Apache-2.0
 */

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::ServerName;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;

use crate::config::FtpDataChannelMode;
use crate::error::{FtpCommandError, FtpTransferSetupError};
use crate::reply::FtpReply;
use crate::session::{FtpSession, SessionCore};
use crate::stream::FtpStream;
use crate::tls::{self, FtpCertificateBus};

/// Representation negotiated with TYPE before a transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FtpTransferType {
    Ascii,
    Image,
}

impl FtpTransferType {
    fn command(&self) -> &'static str {
        match self {
            FtpTransferType::Ascii => "TYPE A",
            FtpTransferType::Image => "TYPE I",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum FtpPassiveFlavor {
    Epsv,
    Pasv,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum FtpActiveFlavor {
    Eprt,
    Port,
}

/// A data channel in the making.
///
/// Passive channels are connected when handed out; active channels hold
/// the announced listener. Either way the caller sends its transfer
/// command on the control connection and then calls [`establish`] to get
/// the byte stream.
///
/// [`establish`]: FtpDataChannel::establish
pub struct FtpDataChannel {
    kind: ChannelKind,
}

enum ChannelKind {
    Connected(FtpStream),
    Listening {
        listener: TcpListener,
        accept_timeout: Duration,
        tls: Option<(TlsConnector, ServerName<'static>)>,
    },
}

impl FtpDataChannel {
    fn connected(stream: FtpStream) -> Self {
        FtpDataChannel {
            kind: ChannelKind::Connected(stream),
        }
    }

    fn listening(
        listener: TcpListener,
        accept_timeout: Duration,
        tls: Option<(TlsConnector, ServerName<'static>)>,
    ) -> Self {
        FtpDataChannel {
            kind: ChannelKind::Listening {
                listener,
                accept_timeout,
                tls,
            },
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.kind, ChannelKind::Listening { .. })
    }

    /// Complete the channel: for active mode accept exactly one inbound
    /// connection (then stop listening) and wrap it in TLS when the
    /// channel is protected. The returned stream is owned by the caller.
    pub async fn establish(self) -> Result<FtpStream, FtpTransferSetupError> {
        match self.kind {
            ChannelKind::Connected(stream) => Ok(stream),
            ChannelKind::Listening {
                listener,
                accept_timeout,
                tls,
            } => {
                let (tcp, _peer) = match tokio::time::timeout(accept_timeout, listener.accept())
                    .await
                {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => return Err(FtpTransferSetupError::AcceptFailed(e)),
                    Err(_) => return Err(FtpTransferSetupError::AcceptTimedOut),
                };
                drop(listener);
                let stream = FtpStream::Plain(tcp);
                match tls {
                    Some((connector, name)) => stream
                        .into_tls(&connector, name)
                        .await
                        .map_err(FtpTransferSetupError::TlsWrapFailed),
                    None => Ok(stream),
                }
            }
        }
    }
}

impl FtpSession {
    /// Open a data channel in the configured mode.
    pub async fn open_data_channel(
        &self,
        transfer_type: FtpTransferType,
    ) -> Result<FtpDataChannel, FtpTransferSetupError> {
        let mut core = self.core.lock().await;
        if core.disposed {
            return Err(FtpCommandError::SessionClosed.into());
        }
        let mode = core.config.data_channel_mode;
        if mode.is_active() {
            core.open_active_channel(&self.cert_bus, mode, transfer_type).await
        } else {
            core.open_passive_channel(&self.cert_bus, mode, transfer_type).await
        }
    }

    /// Open a passive data channel, honoring the configured passive
    /// flavor when one is set (automatic probing otherwise).
    pub async fn open_passive_data_channel(
        &self,
        transfer_type: FtpTransferType,
    ) -> Result<FtpDataChannel, FtpTransferSetupError> {
        let mut core = self.core.lock().await;
        if core.disposed {
            return Err(FtpCommandError::SessionClosed.into());
        }
        let mode = match core.config.data_channel_mode {
            mode if !mode.is_active() => mode,
            _ => FtpDataChannelMode::AutoPassive,
        };
        core.open_passive_channel(&self.cert_bus, mode, transfer_type).await
    }

    /// Open an active data channel, honoring the configured active
    /// flavor when one is set (automatic probing otherwise).
    pub async fn open_active_data_channel(
        &self,
        transfer_type: FtpTransferType,
    ) -> Result<FtpDataChannel, FtpTransferSetupError> {
        let mut core = self.core.lock().await;
        if core.disposed {
            return Err(FtpCommandError::SessionClosed.into());
        }
        let mode = match core.config.data_channel_mode {
            mode if mode.is_active() => mode,
            _ => FtpDataChannelMode::AutoActive,
        };
        core.open_active_channel(&self.cert_bus, mode, transfer_type).await
    }
}

impl SessionCore {
    async fn ensure_transfer_type(
        &mut self,
        transfer_type: FtpTransferType,
    ) -> Result<(), FtpTransferSetupError> {
        if self.transfer_type == transfer_type {
            return Ok(());
        }
        let reply = self.execute_raw(transfer_type.command(), "type").await?;
        if !reply.success() {
            return Err(FtpTransferSetupError::Refused("TYPE", reply));
        }
        self.transfer_type = transfer_type;
        Ok(())
    }

    fn control_peer(&self) -> Result<SocketAddr, FtpTransferSetupError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or(FtpCommandError::NotConnected)?;
        stream
            .peer_addr()
            .map_err(FtpTransferSetupError::ControlAddressUnavailable)
    }

    fn control_local(&self) -> Result<SocketAddr, FtpTransferSetupError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or(FtpCommandError::NotConnected)?;
        stream
            .local_addr()
            .map_err(FtpTransferSetupError::ControlAddressUnavailable)
    }

    fn data_tls_params(
        &self,
        bus: &Arc<FtpCertificateBus>,
    ) -> Result<Option<(TlsConnector, ServerName<'static>)>, FtpTransferSetupError> {
        let control_is_tls = self.stream.as_ref().map(|s| s.is_tls()).unwrap_or(false);
        if !(control_is_tls && self.data_protected) {
            return Ok(None);
        }
        let connector = tls::build_connector(&self.config.tls, bus)
            .map_err(FtpTransferSetupError::InvalidTlsConfig)?;
        let name = tls::server_name(&self.config.host)
            .map_err(FtpTransferSetupError::InvalidTlsConfig)?;
        Ok(Some((connector, name)))
    }

    pub(crate) async fn open_passive_channel(
        &mut self,
        bus: &Arc<FtpCertificateBus>,
        mode: FtpDataChannelMode,
        transfer_type: FtpTransferType,
    ) -> Result<FtpDataChannel, FtpTransferSetupError> {
        if !self.is_connected() {
            return Err(FtpCommandError::NotConnected.into());
        }
        self.ensure_transfer_type(transfer_type).await?;

        let nat_fix = mode == FtpDataChannelMode::PasvNat;
        let endpoint = match mode {
            FtpDataChannelMode::Epsv => self.request_epsv().await?,
            FtpDataChannelMode::Pasv | FtpDataChannelMode::PasvNat => {
                self.request_pasv(nat_fix).await?
            }
            _ => match self.passive_memo {
                Some(FtpPassiveFlavor::Epsv) => self.request_epsv().await?,
                Some(FtpPassiveFlavor::Pasv) => self.request_pasv(nat_fix).await?,
                None => match self.request_epsv().await {
                    Ok(endpoint) => {
                        self.passive_memo = Some(FtpPassiveFlavor::Epsv);
                        endpoint
                    }
                    Err(e) if e.can_fall_back() => {
                        self.passive_memo = Some(FtpPassiveFlavor::Pasv);
                        self.request_pasv(nat_fix).await?
                    }
                    Err(e) => return Err(e),
                },
            },
        };

        let connect_timeout = self.config.data.connect_timeout;
        let tcp = match tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => return Err(FtpTransferSetupError::DataConnectFailed(e)),
            Err(_) => return Err(FtpTransferSetupError::DataConnectTimedOut),
        };

        let stream = match self.data_tls_params(bus)? {
            Some((connector, name)) => FtpStream::Plain(tcp)
                .into_tls(&connector, name)
                .await
                .map_err(FtpTransferSetupError::TlsWrapFailed)?,
            None => FtpStream::Plain(tcp),
        };
        Ok(FtpDataChannel::connected(stream))
    }

    async fn request_epsv(&mut self) -> Result<SocketAddr, FtpTransferSetupError> {
        let reply = self.execute_raw("EPSV", "epsv").await?;
        if !reply.success() {
            return Err(FtpTransferSetupError::Refused("EPSV", reply));
        }
        let port = parse_epsv_reply(&reply)
            .ok_or_else(|| FtpTransferSetupError::InvalidEpsvReply(reply.clone()))?;
        let mut endpoint = self.control_peer()?;
        endpoint.set_port(port);
        Ok(endpoint)
    }

    async fn request_pasv(&mut self, nat_fix: bool) -> Result<SocketAddr, FtpTransferSetupError> {
        let reply = self.execute_raw("PASV", "pasv").await?;
        if !reply.success() {
            return Err(FtpTransferSetupError::Refused("PASV", reply));
        }
        let advertised = parse_pasv_reply(&reply)
            .ok_or_else(|| FtpTransferSetupError::InvalidPasvReply(reply.clone()))?;
        if nat_fix && is_unroutable(advertised.ip()) {
            let peer = self.control_peer()?;
            return Ok(SocketAddr::new(peer.ip(), advertised.port()));
        }
        Ok(advertised)
    }

    pub(crate) async fn open_active_channel(
        &mut self,
        bus: &Arc<FtpCertificateBus>,
        mode: FtpDataChannelMode,
        transfer_type: FtpTransferType,
    ) -> Result<FtpDataChannel, FtpTransferSetupError> {
        if !self.is_connected() {
            return Err(FtpCommandError::NotConnected.into());
        }
        self.ensure_transfer_type(transfer_type).await?;

        let local = self.control_local()?;
        let announced_ip = match self.config.address_resolver.as_ref() {
            Some(resolver) => resolver.announced_ip(),
            None => local.ip(),
        };

        let active_ports = self.config.active_ports.clone();
        let listener = bind_active_listener(local.ip(), &active_ports).await?;
        let port = listener
            .local_addr()
            .map_err(FtpTransferSetupError::ControlAddressUnavailable)?
            .port();

        match mode {
            FtpDataChannelMode::Eprt => {
                self.announce_eprt(announced_ip, port).await?;
            }
            FtpDataChannelMode::Port => {
                self.announce_port(announced_ip, port).await?;
            }
            _ => match self.active_memo {
                Some(FtpActiveFlavor::Eprt) => self.announce_eprt(announced_ip, port).await?,
                Some(FtpActiveFlavor::Port) => self.announce_port(announced_ip, port).await?,
                None => match self.announce_eprt(announced_ip, port).await {
                    Ok(()) => self.active_memo = Some(FtpActiveFlavor::Eprt),
                    Err(e) if e.can_fall_back() => {
                        self.active_memo = Some(FtpActiveFlavor::Port);
                        self.announce_port(announced_ip, port).await?;
                    }
                    Err(e) => return Err(e),
                },
            },
        }

        let tls = self.data_tls_params(bus)?;
        Ok(FtpDataChannel::listening(
            listener,
            self.config.data.connect_timeout,
            tls,
        ))
    }

    async fn announce_eprt(
        &mut self,
        ip: IpAddr,
        port: u16,
    ) -> Result<(), FtpTransferSetupError> {
        let command = eprt_command(ip, port);
        let reply = self.execute_raw(&command, "eprt").await?;
        if !reply.success() {
            return Err(FtpTransferSetupError::Refused("EPRT", reply));
        }
        Ok(())
    }

    async fn announce_port(
        &mut self,
        ip: IpAddr,
        port: u16,
    ) -> Result<(), FtpTransferSetupError> {
        let ip = match ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => return Err(FtpTransferSetupError::AddressFamilyMismatch),
        };
        let command = port_command(ip, port);
        let reply = self.execute_raw(&command, "port").await?;
        if !reply.success() {
            return Err(FtpTransferSetupError::Refused("PORT", reply));
        }
        Ok(())
    }
}

async fn bind_active_listener(
    ip: IpAddr,
    ports: &[u16],
) -> Result<TcpListener, FtpTransferSetupError> {
    if ports.is_empty() {
        return TcpListener::bind(SocketAddr::new(ip, 0))
            .await
            .map_err(FtpTransferSetupError::NoUsableLocalPort);
    }
    let mut last_err = None;
    for port in ports {
        match TcpListener::bind(SocketAddr::new(ip, *port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(FtpTransferSetupError::NoUsableLocalPort(
        last_err.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::AddrInUse)),
    ))
}

/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
pub(crate) fn parse_pasv_reply(reply: &FtpReply) -> Option<SocketAddr> {
    let line = reply.message();
    let bytes = line.as_bytes();
    let p_start = memchr::memchr(b'(', bytes)?;
    let p_end = memchr::memchr(b')', &bytes[p_start..])? + p_start;

    let a: Vec<&str> = line[p_start + 1..p_end].split(',').collect();
    if a.len() != 6 {
        return None;
    }

    let h1 = u8::from_str(a[0]).ok()?;
    let h2 = u8::from_str(a[1]).ok()?;
    let h3 = u8::from_str(a[2]).ok()?;
    let h4 = u8::from_str(a[3]).ok()?;
    let p1 = u8::from_str(a[4]).ok()?;
    let p2 = u8::from_str(a[5]).ok()?;

    let ip = IpAddr::V4(Ipv4Addr::new(h1, h2, h3, h4));
    let port = ((p1 as u16) << 8) + (p2 as u16);
    Some(SocketAddr::new(ip, port))
}

/// `229 Entering Extended Passive Mode (|||port|)`
pub(crate) fn parse_epsv_reply(reply: &FtpReply) -> Option<u16> {
    let line = reply.message();
    let bytes = line.as_bytes();
    let p_start = memchr::memchr(b'(', bytes)?;
    let p_end = memchr::memchr(b')', &bytes[p_start..])? + p_start;

    if !line[p_start + 1..p_end].starts_with("|||") {
        return None;
    }
    if p_end - 1 <= p_start + 4 {
        return None;
    }
    if bytes[p_end - 1] != b'|' {
        return None;
    }
    u16::from_str(&line[p_start + 4..p_end - 1]).ok()
}

/// Addresses a NAT-ed server may advertise but a client cannot reach.
pub(crate) fn is_unroutable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || (seg[0] & 0xfe00) == 0xfc00
                || (seg[0] & 0xffc0) == 0xfe80
        }
    }
}

pub(crate) fn port_command(ip: Ipv4Addr, port: u16) -> String {
    let o = ip.octets();
    format!(
        "PORT {},{},{},{},{},{}",
        o[0],
        o[1],
        o[2],
        o[3],
        port >> 8,
        port & 0xff
    )
}

pub(crate) fn eprt_command(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("EPRT |1|{v4}|{port}|"),
        IpAddr::V6(v6) => format!("EPRT |2|{v6}|{port}|"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(code: u16, message: &str) -> FtpReply {
        FtpReply::new(code, message.to_string(), Vec::new())
    }

    #[test]
    fn pasv_reply_endpoint() {
        let r = reply(227, "Entering Passive Mode (127,0,0,1,234,5)");
        let endpoint = parse_pasv_reply(&r).unwrap();
        assert_eq!(endpoint, "127.0.0.1:59909".parse().unwrap());
    }

    #[test]
    fn pasv_reply_malformed() {
        assert!(parse_pasv_reply(&reply(227, "Entering Passive Mode")).is_none());
        assert!(parse_pasv_reply(&reply(227, "ok (1,2,3,4,5)")).is_none());
        assert!(parse_pasv_reply(&reply(227, "ok (300,0,0,1,0,1)")).is_none());
    }

    #[test]
    fn epsv_reply_port() {
        let r = reply(229, "Entering Extended Passive Mode (|||52311|)");
        assert_eq!(parse_epsv_reply(&r), Some(52311));
    }

    #[test]
    fn epsv_reply_malformed() {
        assert!(parse_epsv_reply(&reply(229, "ok (52311)")).is_none());
        assert!(parse_epsv_reply(&reply(229, "ok (||||)")).is_none());
        assert!(parse_epsv_reply(&reply(229, "ok (|||70000|)")).is_none());
    }

    #[test]
    fn unroutable_addresses() {
        assert!(is_unroutable("10.0.0.1".parse().unwrap()));
        assert!(is_unroutable("192.168.4.4".parse().unwrap()));
        assert!(is_unroutable("127.0.0.1".parse().unwrap()));
        assert!(is_unroutable("169.254.0.9".parse().unwrap()));
        assert!(!is_unroutable("93.184.216.34".parse().unwrap()));
        assert!(is_unroutable("fe80::1".parse().unwrap()));
        assert!(is_unroutable("fd00::1".parse().unwrap()));
        assert!(!is_unroutable("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn port_command_encodes_port_bytes() {
        assert_eq!(
            port_command(Ipv4Addr::new(192, 168, 1, 2), 1025),
            "PORT 192,168,1,2,4,1"
        );
    }

    #[test]
    fn eprt_command_families() {
        assert_eq!(
            eprt_command("132.235.1.2".parse().unwrap(), 6275),
            "EPRT |1|132.235.1.2|6275|"
        );
        assert_eq!(
            eprt_command("1080::8:800:200c:417a".parse().unwrap(), 5282),
            "EPRT |2|1080::8:800:200c:417a|5282|"
        );
    }
}
