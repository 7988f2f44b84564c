use std::fmt::Display;
use std::string::FromUtf8Error;

use hex::FromHexError;
use sha2::digest::InvalidLength;

use crate::scramblesuit::framing::FrameError;
use crate::socks5::proto::SocksError;

/// Result type returning [`Error`] or `T`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while dispatching transport sessions, including
/// wrapped errors from dependencies.
#[derive(Debug)]
pub enum Error {
    Other(Box<dyn std::error::Error + Send + Sync>),
    IOError(std::io::Error),
    Utf8Error(FromUtf8Error),
    RngSourceErr(getrandom::Error),
    Crypto(String),

    /// The pluggable transport environment or CLI configuration is unusable.
    Config(String),

    /// The per-method SOCKS5 credentials failed to parse.
    Params(String),

    /// The peer violated the SOCKS5 protocol.
    Socks(SocksError),

    /// The transport handshake failed (bad magic, oversized padding, MAC
    /// mismatch, missing mark).
    Handshake(String),

    /// The handshake deadline expired.
    HandshakeTimeout,

    /// A ScrambleSuit frame failed to encode or decode.
    Frame(FrameError),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            Error::Other(e) => write!(f, "{}", e),
            Error::IOError(e) => write!(f, "{}", e),
            Error::Utf8Error(e) => write!(f, "{}", e),
            Error::RngSourceErr(e) => write!(f, "rng failure: {}", e),
            Error::Crypto(e) => write!(f, "cryptographic err: {}", e),
            Error::Config(e) => write!(f, "configuration err: {}", e),
            Error::Params(e) => write!(f, "bad transport parameters: {}", e),
            Error::Socks(e) => write!(f, "socks5: {}", e),
            Error::Handshake(e) => write!(f, "handshake failed: {}", e),
            Error::HandshakeTimeout => write!(f, "handshake timed out"),
            Error::Frame(e) => write!(f, "framing error: {}", e),
        }
    }
}

impl Error {
    pub fn new<T: Into<Box<dyn std::error::Error + Send + Sync>>>(e: T) -> Self {
        Error::Other(e.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IOError(e)
    }
}

impl From<FromUtf8Error> for Error {
    fn from(e: FromUtf8Error) -> Self {
        Error::Utf8Error(e)
    }
}

impl From<getrandom::Error> for Error {
    fn from(e: getrandom::Error) -> Self {
        Error::RngSourceErr(e)
    }
}

impl From<FromHexError> for Error {
    fn from(e: FromHexError) -> Self {
        Error::Params(format!("invalid hex: {e}"))
    }
}

impl From<InvalidLength> for Error {
    fn from(e: InvalidLength) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e.into())
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.into())
    }
}

impl From<SocksError> for Error {
    fn from(e: SocksError) -> Self {
        Error::Socks(e)
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::Frame(e)
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::IOError(io_err) => io_err,
            e => std::io::Error::new(std::io::ErrorKind::Other, format!("{e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_other_error() {
        let err = Error::new("some other error");
        assert_eq!(format!("{}", err), "some other error");
    }

    #[test]
    fn display_io_error() {
        let err = Error::IOError(std::io::Error::new(
            std::io::ErrorKind::Other,
            "some io error",
        ));
        assert_eq!(format!("{}", err), "some io error");
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "some io error");
        let err = Error::from(io_err);
        assert_eq!(format!("{}", err), "some io error");
    }

    #[test]
    fn io_error_round_trip() {
        let err = Error::HandshakeTimeout;
        let io_err: std::io::Error = err.into();
        assert_eq!(io_err.kind(), std::io::ErrorKind::Other);
        assert_eq!(format!("{io_err}"), "handshake timed out");
    }
}
