//! SOCKS5 wire handling (RFC 1928/1929), restricted to the subset a
//! pluggable transport listener needs: methods NO-AUTH and
//! USERNAME/PASSWORD, the CONNECT command, and IPv4/hostname/IPv6 targets.
//!
//! The CONNECT reply is deliberately *not* sent here; the session emits it
//! once the transport handshake has succeeded or failed, so the reply code
//! can reflect the real outcome.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{Error, Result};

pub const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERNAME_PASSWORD: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const AUTH_SUCCESS: u8 = 0x00;
const AUTH_FAILURE: u8 = 0x01;

/// Reply codes for the CONNECT response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Protocol violations by the SOCKS client.  The short error reply, where
/// one exists for the phase, has already been sent when this surfaces.
#[derive(Debug, PartialEq, Eq)]
pub enum SocksError {
    InvalidVersion(u8),
    InvalidAuthVersion(u8),
    NoAcceptableMethods,
    UnsupportedCommand(u8),
    UnsupportedAddressType(u8),
    CredentialsNotUtf8,
    MalformedHostname,
}

impl std::error::Error for SocksError {}

impl fmt::Display for SocksError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocksError::InvalidVersion(v) => write!(f, "invalid protocol version {v:#04x}"),
            SocksError::InvalidAuthVersion(v) => {
                write!(f, "invalid auth sub-negotiation version {v:#04x}")
            }
            SocksError::NoAcceptableMethods => write!(f, "no acceptable authentication method"),
            SocksError::UnsupportedCommand(c) => write!(f, "unsupported command {c:#04x}"),
            SocksError::UnsupportedAddressType(a) => {
                write!(f, "unsupported address type {a:#04x}")
            }
            SocksError::CredentialsNotUtf8 => write!(f, "credentials are not valid utf-8"),
            SocksError::MalformedHostname => write!(f, "target hostname is not valid utf-8"),
        }
    }
}

/// A CONNECT target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TargetAddr::Ip(sa) => write!(f, "{sa}"),
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Outcome of a completed negotiation, reply still pending.
#[derive(Debug)]
pub struct Request {
    pub target: TargetAddr,
    /// `UNAME || PASSWD`, Tor's NUL placeholder password stripped.
    pub credentials: Option<String>,
}

/// Drives the SOCKS5 negotiation up to (but not including) the CONNECT
/// reply.  `want_credentials` selects USERNAME/PASSWORD instead of NO-AUTH
/// so per-method arguments can ride along.
pub(crate) async fn negotiate<T>(stream: &mut T, want_credentials: bool) -> Result<Request>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    // Method selection: VER NMETHODS METHODS...
    let mut hdr = [0u8; 2];
    stream.read_exact(&mut hdr).await?;
    if hdr[0] != SOCKS_VERSION {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(SocksError::InvalidVersion(hdr[0]).into());
    }
    let nmethods = hdr[1] as usize;
    let mut methods = [0u8; 255];
    stream.read_exact(&mut methods[..nmethods]).await?;

    let desired = if want_credentials {
        METHOD_USERNAME_PASSWORD
    } else {
        METHOD_NO_AUTH
    };
    if !methods[..nmethods].contains(&desired) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(SocksError::NoAcceptableMethods.into());
    }
    stream.write_all(&[SOCKS_VERSION, desired]).await?;

    // Optional RFC 1929 sub-negotiation.
    let credentials = if want_credentials {
        let mut ver = [0u8; 1];
        stream.read_exact(&mut ver).await?;
        if ver[0] != AUTH_VERSION {
            stream.write_all(&[AUTH_VERSION, AUTH_FAILURE]).await?;
            return Err(SocksError::InvalidAuthVersion(ver[0]).into());
        }

        let mut len = [0u8; 1];
        stream.read_exact(&mut len).await?;
        let mut uname = vec![0u8; len[0] as usize];
        stream.read_exact(&mut uname).await?;

        stream.read_exact(&mut len).await?;
        let mut passwd = vec![0u8; len[0] as usize];
        stream.read_exact(&mut passwd).await?;

        // The credential fields cannot carry validity information at this
        // layer; always acknowledge and let the transport's parameter parse
        // surface problems on the CONNECT reply.
        stream.write_all(&[AUTH_VERSION, AUTH_SUCCESS]).await?;

        // Tor sets the password to a single NUL when the arguments fit in
        // the username field alone.
        let mut raw = uname;
        if !(passwd.len() == 1 && passwd[0] == 0x00) {
            raw.extend_from_slice(&passwd);
        }
        match String::from_utf8(raw) {
            Ok(s) if s.is_empty() => None,
            Ok(s) => Some(s),
            Err(_) => return Err(SocksError::CredentialsNotUtf8.into()),
        }
    } else {
        None
    };

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    if req[0] != SOCKS_VERSION {
        return Err(SocksError::InvalidVersion(req[0]).into());
    }
    if req[1] != CMD_CONNECT {
        send_reply(stream, Reply::CommandNotSupported, None).await?;
        return Err(SocksError::UnsupportedCommand(req[1]).into());
    }

    let target = match req[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::from(addr), port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut host = vec![0u8; len[0] as usize];
            stream.read_exact(&mut host).await?;
            let port = read_port(stream).await?;
            let host =
                String::from_utf8(host).map_err(|_| Error::from(SocksError::MalformedHostname))?;
            TargetAddr::Domain(host, port)
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::from(addr), port))
        }
        other => {
            send_reply(stream, Reply::AddressTypeNotSupported, None).await?;
            return Err(SocksError::UnsupportedAddressType(other).into());
        }
    };

    debug!("socks5 negotiation complete");

    Ok(Request {
        target,
        credentials,
    })
}

async fn read_port<T: AsyncRead + Unpin>(stream: &mut T) -> Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

/// Sends the CONNECT reply.  `bind` carries the local address of the
/// outbound socket on success; error replies use the all-zero address.
pub(crate) async fn send_reply<T>(
    stream: &mut T,
    reply: Reply,
    bind: Option<SocketAddr>,
) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&[SOCKS_VERSION, reply as u8, 0x00]);
    match bind {
        Some(SocketAddr::V4(sa)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&sa.ip().octets());
            buf.extend_from_slice(&sa.port().to_be_bytes());
        }
        Some(SocketAddr::V6(sa)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&sa.ip().octets());
            buf.extend_from_slice(&sa.port().to_be_bytes());
        }
        None => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&[0u8; 6]);
        }
    }
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}
