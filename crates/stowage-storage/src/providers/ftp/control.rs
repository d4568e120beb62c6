//! FTP control connection (RFC 959, with RFC 4217 explicit TLS).

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::client::{TransferError, TransferResult};

/// Byte stream usable as a control or data connection.
pub trait FtpStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> FtpStream for T {}

/// Boxed plain or TLS stream.
pub type BoxedStream = Box<dyn FtpStream>;

/// A server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit reply code.
    pub code: u16,
    /// Text of the last reply line.
    pub text: String,
}

impl Reply {
    /// Check if the code is a positive completion (2xx).
    pub fn is_complete(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Classify an unexpected reply.
pub fn reply_error(command: &str, reply: &Reply) -> TransferError {
    let message = format!("FTP {command}: {} {}", reply.code, reply.text);
    match reply.code {
        530 | 532 | 553 => TransferError::fatal(message),
        _ => TransferError::recoverable(message),
    }
}

/// Data connection that is either connected (passive) or waiting for the
/// server to connect (active).
pub enum DataChannel {
    /// Passive mode: already connected.
    Connected(TcpStream),
    /// Active mode: listening for the server.
    Listening(TcpListener),
}

/// The control connection.
pub struct Control {
    stream: Option<BufReader<BoxedStream>>,
    peer: IpAddr,
    local: IpAddr,
    timeout: Duration,
    domain: String,
    tls: Option<tokio_native_tls::TlsConnector>,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("peer", &self.peer)
            .field("domain", &self.domain)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Control {
    /// Connect and read the greeting.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> TransferResult<Self> {
        let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransferError::recoverable(format!("FTP connect to {host}:{port} timed out")))?
            .map_err(|e| TransferError::recoverable(format!("FTP connect to {host}:{port}: {e}")))?;
        let peer = tcp.peer_addr()?.ip();
        let local = tcp.local_addr()?.ip();

        let mut control = Self {
            stream: Some(BufReader::new(Box::new(tcp) as BoxedStream)),
            peer,
            local,
            timeout,
            domain: host.to_string(),
            tls: None,
        };
        let greeting = control.read_reply().await?;
        if greeting.code != 220 {
            return Err(reply_error("greeting", &greeting));
        }
        Ok(control)
    }

    /// Negotiate explicit TLS and protect the data channel.
    pub async fn upgrade_tls(&mut self, verify: bool) -> TransferResult<()> {
        self.expect("AUTH TLS", &[234]).await?;

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(!verify)
            .danger_accept_invalid_hostnames(!verify)
            .build()
            .map_err(|e| TransferError::fatal(format!("FTPS setup: {e}")))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let plain = self
            .stream
            .take()
            .ok_or_else(|| TransferError::recoverable("FTP control connection is closed"))?
            .into_inner();
        let secured = tokio::time::timeout(self.timeout, connector.connect(&self.domain, plain))
            .await
            .map_err(|_| TransferError::recoverable("FTPS handshake timed out"))?
            .map_err(|e| TransferError::fatal(format!("FTPS handshake: {e}")))?;
        self.stream = Some(BufReader::new(Box::new(secured) as BoxedStream));
        self.tls = Some(connector);

        self.expect("PBSZ 0", &[200]).await?;
        self.expect("PROT P", &[200]).await?;
        Ok(())
    }

    fn stream(&mut self) -> TransferResult<&mut BufReader<BoxedStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| TransferError::recoverable("FTP control connection is closed"))
    }

    async fn read_line(&mut self) -> TransferResult<String> {
        let timeout = self.timeout;
        let stream = self.stream()?;
        let mut line = String::new();
        let n = tokio::time::timeout(timeout, stream.read_line(&mut line))
            .await
            .map_err(|_| TransferError::recoverable("FTP server did not reply in time"))??;
        if n == 0 {
            return Err(TransferError::recoverable("FTP server closed the connection"));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read one (possibly multi-line) reply.
    pub async fn read_reply(&mut self) -> TransferResult<Reply> {
        let first = self.read_line().await?;
        let code = parse_code(&first)?;
        let mut last = first.clone();
        if first.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{code} ");
            loop {
                last = self.read_line().await?;
                if last.starts_with(&terminator) || last == code.to_string() {
                    break;
                }
            }
        }
        Ok(Reply {
            code,
            text: last.get(4..).unwrap_or_default().to_string(),
        })
    }

    /// Send a command and read its reply.
    pub async fn command(&mut self, command: &str) -> TransferResult<Reply> {
        let shown = if command.starts_with("PASS ") { "PASS ****" } else { command };
        tracing::trace!(command = shown, "FTP command");
        let timeout = self.timeout;
        let stream = self.stream()?;
        let line = format!("{command}\r\n");
        tokio::time::timeout(timeout, async {
            stream.get_mut().write_all(line.as_bytes()).await?;
            stream.get_mut().flush().await
        })
        .await
        .map_err(|_| TransferError::recoverable("FTP command write timed out"))??;
        let reply = self.read_reply().await?;
        tracing::trace!(code = reply.code, text = %reply.text, "FTP reply");
        Ok(reply)
    }

    /// Send a command and require one of `ok` as the reply code.
    pub async fn expect(&mut self, command: &str, ok: &[u16]) -> TransferResult<Reply> {
        let reply = self.command(command).await?;
        if ok.contains(&reply.code) {
            Ok(reply)
        } else {
            let verb = command.split(' ').next().unwrap_or(command);
            Err(reply_error(verb, &reply))
        }
    }

    /// Prepare a data connection for the next transfer command.
    pub async fn data_channel(&mut self, passive: bool) -> TransferResult<DataChannel> {
        if passive {
            let reply = self.expect("PASV", &[227]).await?;
            let port = parse_pasv_port(&reply.text)?;
            // The advertised host is often a private address behind NAT.
            let addr = SocketAddr::new(self.peer, port);
            let tcp = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| TransferError::recoverable("FTP data connection timed out"))?
                .map_err(|e| TransferError::recoverable(format!("FTP data connection: {e}")))?;
            return Ok(DataChannel::Connected(tcp));
        }

        let IpAddr::V4(local) = self.local else {
            return Err(TransferError::fatal("Active FTP requires an IPv4 control connection"));
        };
        let listener = TcpListener::bind((self.local, 0)).await?;
        let port = listener.local_addr()?.port();
        let [a, b, c, d] = local.octets();
        self.expect(
            &format!("PORT {a},{b},{c},{d},{},{}", port >> 8, port & 0xff),
            &[200],
        )
        .await?;
        Ok(DataChannel::Listening(listener))
    }

    /// Finish opening a data connection after the transfer command was
    /// accepted, wrapping it in TLS when the channel is protected.
    pub async fn open_data(&self, channel: DataChannel) -> TransferResult<BoxedStream> {
        let tcp = match channel {
            DataChannel::Connected(tcp) => tcp,
            DataChannel::Listening(listener) => {
                tokio::time::timeout(self.timeout, listener.accept())
                    .await
                    .map_err(|_| TransferError::recoverable("FTP server never opened the data connection"))??
                    .0
            }
        };
        match &self.tls {
            Some(connector) => {
                let secured = tokio::time::timeout(self.timeout, connector.connect(&self.domain, tcp))
                    .await
                    .map_err(|_| TransferError::recoverable("FTPS data handshake timed out"))?
                    .map_err(|e| TransferError::recoverable(format!("FTPS data handshake: {e}")))?;
                Ok(Box::new(secured))
            }
            None => Ok(Box::new(tcp)),
        }
    }

    /// Per-operation timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn parse_code(line: &str) -> TransferResult<u16> {
    line.get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| TransferError::recoverable(format!("Malformed FTP reply: {line}")))
}

/// Port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
fn parse_pasv_port(text: &str) -> TransferResult<u16> {
    let start = text.find('(').map_or(0, |i| i + 1);
    let end = text[start..].find(')').map_or(text.len(), |i| start + i);
    let numbers: Vec<u16> = text[start..end]
        .split(',')
        .filter_map(|n| n.trim().parse().ok())
        .collect();
    match numbers.as_slice() {
        [_, _, _, _, p1, p2] if *p1 <= 255 && *p2 <= 255 => Ok(p1 * 256 + p2),
        _ => Err(TransferError::recoverable(format!("Malformed PASV reply: {text}"))),
    }
}
