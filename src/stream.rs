/*
 * SPDX-License-Identifier: Apache-2.0
 */

use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use rustls_pki_types::ServerName;
use socket2::SockRef;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::FtpIpPreference;
use crate::error::{FtpConnectError, FtpReplyError};

const WRITE_BUF_SIZE: usize = 1024;
const READ_BUF_SIZE: usize = 8192;

/// Text encoding of the control channel.
///
/// Servers start out in ASCII; UTF-8 is negotiated through FEAT/OPTS, and
/// a handful of legacy servers speak a regional single-byte charset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FtpTextEncoding {
    Ascii,
    Utf8,
    Legacy(&'static encoding_rs::Encoding),
}

impl FtpTextEncoding {
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            FtpTextEncoding::Ascii | FtpTextEncoding::Utf8 => {
                String::from_utf8_lossy(bytes).into_owned()
            }
            FtpTextEncoding::Legacy(encoding) => encoding.decode(bytes).0.into_owned(),
        }
    }

    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            FtpTextEncoding::Ascii | FtpTextEncoding::Utf8 => text.as_bytes().to_vec(),
            FtpTextEncoding::Legacy(encoding) => encoding.encode(text).0.into_owned(),
        }
    }
}

/// A duplex byte stream that is either plain TCP or TLS over TCP.
pub enum FtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl FtpStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, FtpStream::Tls(_))
    }

    fn tcp_ref(&self) -> &TcpStream {
        match self {
            FtpStream::Plain(tcp) => tcp,
            FtpStream::Tls(tls) => tls.get_ref().0,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp_ref().local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp_ref().peer_addr()
    }

    pub(crate) async fn into_tls(
        self,
        connector: &TlsConnector,
        name: ServerName<'static>,
    ) -> io::Result<FtpStream> {
        match self {
            FtpStream::Plain(tcp) => {
                let tls = connector.connect(name, tcp).await?;
                Ok(FtpStream::Tls(Box::new(tls)))
            }
            FtpStream::Tls(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream is already TLS",
            )),
        }
    }
}

impl AsyncRead for FtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            FtpStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            FtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            FtpStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            FtpStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            FtpStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Resolve `host` and connect, preferring address families per
/// `ip_preference`. Every candidate gets its own connect timeout; the
/// first to succeed wins.
pub(crate) async fn connect_tcp(
    host: &str,
    port: u16,
    ip_preference: FtpIpPreference,
    connect_timeout: Duration,
) -> Result<TcpStream, FtpConnectError> {
    let resolved = tokio::net::lookup_host((host, port))
        .await
        .map_err(FtpConnectError::ResolveFailed)?;

    let mut timed_out = false;
    let mut attempted = false;
    for addr in resolved {
        let usable = match ip_preference {
            FtpIpPreference::Any => true,
            FtpIpPreference::Ipv4Only => addr.is_ipv4(),
            FtpIpPreference::Ipv6Only => addr.is_ipv6(),
        };
        if !usable {
            continue;
        }
        attempted = true;
        match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(tcp)) => return Ok(tcp),
            Ok(Err(_)) => {}
            Err(_) => timed_out = true,
        }
    }

    if attempted && timed_out {
        Err(FtpConnectError::ConnectTimedOut)
    } else {
        Err(FtpConnectError::NetworkUnreachable)
    }
}

fn peek_socket(tcp: &TcpStream) -> io::Result<usize> {
    let sock = SockRef::from(tcp);
    let mut buf = [MaybeUninit::<u8>::uninit(); 256];
    sock.peek(&mut buf)
}

/// Buffered line-oriented view of an [`FtpStream`].
///
/// Owns the read buffer, a reusable write buffer and the last-I/O
/// timestamp used for liveness polling.
pub(crate) struct FtpLineStream {
    reader: BufReader<FtpStream>,
    write_buf: BytesMut,
    max_line_len: usize,
    last_io: Instant,
    broken: bool,
}

impl FtpLineStream {
    pub(crate) fn new(stream: FtpStream, max_line_len: usize) -> Self {
        FtpLineStream {
            reader: BufReader::with_capacity(READ_BUF_SIZE, stream),
            write_buf: BytesMut::with_capacity(WRITE_BUF_SIZE),
            max_line_len,
            last_io: Instant::now(),
            broken: false,
        }
    }

    #[inline]
    pub(crate) fn is_tls(&self) -> bool {
        self.reader.get_ref().is_tls()
    }

    #[inline]
    pub(crate) fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.reader.get_ref().local_addr()
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.reader.get_ref().peer_addr()
    }

    /// Upgrade the plain transport to TLS in place. Any bytes buffered at
    /// this point belong to the cleartext phase and are discarded, which
    /// is correct only right after a complete reply has been consumed.
    pub(crate) async fn into_tls(
        self,
        connector: &TlsConnector,
        name: ServerName<'static>,
    ) -> io::Result<Self> {
        let max_line_len = self.max_line_len;
        let stream = self.reader.into_inner().into_tls(connector, name).await?;
        Ok(FtpLineStream::new(stream, max_line_len))
    }

    /// Next CRLF- or LF-terminated line, terminator stripped, decoded
    /// with `encoding`. `None` on a clean EOF at a line boundary.
    pub(crate) async fn read_line(
        &mut self,
        encoding: FtpTextEncoding,
    ) -> Result<Option<String>, FtpReplyError> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let buf = self
                .reader
                .fill_buf()
                .await
                .map_err(FtpReplyError::ReadFailed)?;
            if buf.is_empty() {
                self.broken = true;
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(FtpReplyError::UnexpectedEof {
                    partial: vec![encoding.decode(&line)],
                });
            }
            if let Some(pos) = memchr::memchr(b'\n', buf) {
                line.extend_from_slice(&buf[..pos]);
                self.reader.consume(pos + 1);
                break;
            }
            let len = buf.len();
            line.extend_from_slice(buf);
            self.reader.consume(len);
            if line.len() > self.max_line_len {
                return Err(FtpReplyError::LineTooLong);
            }
        }
        if line.len() > self.max_line_len {
            return Err(FtpReplyError::LineTooLong);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        self.last_io = Instant::now();
        Ok(Some(encoding.decode(&line)))
    }

    pub(crate) async fn write_line(
        &mut self,
        encoding: FtpTextEncoding,
        text: &str,
    ) -> io::Result<()> {
        self.write_buf.clear();
        self.write_buf.extend_from_slice(&encoding.encode(text));
        self.write_buf.extend_from_slice(b"\r\n");
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf).await?;
        stream.flush().await?;
        self.last_io = Instant::now();
        Ok(())
    }

    pub(crate) async fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf).await?;
        self.last_io = Instant::now();
        Ok(n)
    }

    pub(crate) async fn write_raw(&mut self, buf: &[u8]) -> io::Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(buf).await?;
        stream.flush().await?;
        self.last_io = Instant::now();
        Ok(())
    }

    /// Receive-buffer bytes observable without blocking. Always 0 over
    /// TLS, where the ciphertext gives no usable count.
    pub(crate) fn bytes_available(&self) -> usize {
        let stream = self.reader.get_ref();
        if stream.is_tls() {
            return 0;
        }
        let buffered = self.reader.buffer().len();
        match stream {
            FtpStream::Plain(tcp) => buffered + peek_socket(tcp).unwrap_or(0),
            FtpStream::Tls(_) => buffered,
        }
    }

    /// Pull everything currently readable off the wire without waiting.
    /// Marks the stream broken: leftover data means a reply was never
    /// consumed and the exchange state is unknown.
    pub(crate) fn take_stale_bytes(&mut self) -> Vec<u8> {
        let buffered = self.reader.buffer().to_vec();
        self.reader.consume(buffered.len());
        let mut out = buffered;
        if let FtpStream::Plain(tcp) = self.reader.get_ref() {
            let mut buf = [0u8; 4096];
            loop {
                match tcp.try_read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => out.extend_from_slice(&buf[..n]),
                    Err(_) => break,
                }
            }
        }
        self.broken = true;
        out
    }

    /// If `interval` elapsed since the last I/O, probe the socket.
    /// Returns whether the stream still looks alive.
    pub(crate) fn poll_liveness(&mut self, interval: Duration) -> bool {
        if self.broken {
            return false;
        }
        if self.last_io.elapsed() < interval {
            return true;
        }
        self.last_io = Instant::now();
        match peek_socket(self.reader.get_ref().tcp_ref()) {
            Ok(0) => {
                self.broken = true;
                false
            }
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => {
                self.broken = true;
                false
            }
        }
    }

    pub(crate) fn set_keep_alive(&self, enable: bool) -> io::Result<()> {
        let sock = SockRef::from(self.reader.get_ref().tcp_ref());
        sock.set_keepalive(enable)
    }

    pub(crate) async fn shutdown(&mut self) {
        self.broken = true;
        let _ = self.reader.get_mut().shutdown().await;
    }
}
