//! The supported client transports behind one establish/relay contract.
//!
//! Exactly three transports exist, so they are modeled as a tagged variant
//! rather than a trait object: the dispatcher picks one per listener, the
//! session calls [`Transport::establish`], and the resulting [`PtStream`]
//! relays bytes whichever variant it holds.

use std::io::Error as IoError;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::obfs2::{self, Obfs2Stream};
use crate::obfs3::{self, Obfs3Stream};
use crate::scramblesuit::{self, SsParams, SsStream};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Obfs2,
    Obfs3,
    ScrambleSuit,
}

/// Per-session parameters, parsed from the SOCKS5 credentials.
#[derive(Debug)]
pub enum Params {
    None,
    ScrambleSuit(SsParams),
}

impl Transport {
    pub const fn name(&self) -> &'static str {
        match self {
            Transport::Obfs2 => obfs2::NAME,
            Transport::Obfs3 => obfs3::NAME,
            Transport::ScrambleSuit => scramblesuit::NAME,
        }
    }

    pub fn from_name(name: &str) -> Option<Transport> {
        match name {
            obfs2::NAME => Some(Transport::Obfs2),
            obfs3::NAME => Some(Transport::Obfs3),
            scramblesuit::NAME => Some(Transport::ScrambleSuit),
            _ => None,
        }
    }

    pub const fn supported() -> [Transport; 3] {
        [Transport::Obfs2, Transport::Obfs3, Transport::ScrambleSuit]
    }

    /// Whether the SOCKS5 listener should negotiate USERNAME/PASSWORD to
    /// collect per-session arguments.
    pub const fn wants_credentials(&self) -> bool {
        matches!(self, Transport::ScrambleSuit)
    }

    /// Parses the raw credential string into per-method parameters.
    pub fn parse_params(&self, raw: Option<&str>) -> Result<Params> {
        match self {
            // obfs2 and obfs3 take no arguments; anything present is
            // ignored rather than rejected.
            Transport::Obfs2 | Transport::Obfs3 => Ok(Params::None),
            Transport::ScrambleSuit => {
                let raw = raw.ok_or_else(|| {
                    Error::Params("scramblesuit requires a password argument".to_string())
                })?;
                Ok(Params::ScrambleSuit(SsParams::parse(raw)?))
            }
        }
    }

    /// Performs the transport handshake over a connected stream.
    pub async fn establish<T>(&self, stream: T, params: &Params) -> Result<PtStream<T>>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match (self, params) {
            (Transport::Obfs2, _) => Ok(PtStream::Obfs2(obfs2::handshake(stream).await?)),
            (Transport::Obfs3, _) => Ok(PtStream::Obfs3(obfs3::handshake(stream).await?)),
            (Transport::ScrambleSuit, Params::ScrambleSuit(p)) => Ok(PtStream::ScrambleSuit(
                scramblesuit::handshake(stream, p).await?,
            )),
            (Transport::ScrambleSuit, Params::None) => Err(Error::Params(
                "scramblesuit requires a password argument".to_string(),
            )),
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An established, obfuscated connection to the bridge.
#[pin_project(project = PtStreamProj)]
pub enum PtStream<T> {
    Obfs2(#[pin] Obfs2Stream<T>),
    Obfs3(#[pin] Obfs3Stream<T>),
    ScrambleSuit(#[pin] SsStream<T>),
}

impl<T> AsyncRead for PtStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::result::Result<(), IoError>> {
        match self.project() {
            PtStreamProj::Obfs2(s) => s.poll_read(cx, buf),
            PtStreamProj::Obfs3(s) => s.poll_read(cx, buf),
            PtStreamProj::ScrambleSuit(s) => s.poll_read(cx, buf),
        }
    }
}

impl<T> AsyncWrite for PtStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::result::Result<usize, IoError>> {
        match self.project() {
            PtStreamProj::Obfs2(s) => s.poll_write(cx, buf),
            PtStreamProj::Obfs3(s) => s.poll_write(cx, buf),
            PtStreamProj::ScrambleSuit(s) => s.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::result::Result<(), IoError>> {
        match self.project() {
            PtStreamProj::Obfs2(s) => s.poll_flush(cx),
            PtStreamProj::Obfs3(s) => s.poll_flush(cx),
            PtStreamProj::ScrambleSuit(s) => s.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::result::Result<(), IoError>> {
        match self.project() {
            PtStreamProj::Obfs2(s) => s.poll_shutdown(cx),
            PtStreamProj::Obfs3(s) => s.poll_shutdown(cx),
            PtStreamProj::ScrambleSuit(s) => s.poll_shutdown(cx),
        }
    }
}
