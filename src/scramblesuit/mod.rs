//! # ScrambleSuit (client side)
//!
//! A polymorphic transport: session-ticket or UniformDH handshake
//! authenticated by an out-of-band shared secret, followed by a framed
//! relay whose frame lengths and timing are drawn from distributions seeded
//! during the handshake.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::Result;

pub mod framing;
pub mod params;
pub(crate) mod handshake;
mod proto;

pub use params::SsParams;
pub use proto::SsStream;

use framing::SsCodec;

pub const NAME: &str = "scramblesuit";

/// Runs the client handshake appropriate for `params` and returns the
/// framed relay stream.
pub async fn handshake<T>(mut stream: T, params: &SsParams) -> Result<SsStream<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (keys, leftover) = match &params.ticket {
        Some(ticket) => {
            let keys = handshake::ticket(&mut stream, &params.shared_secret, ticket).await?;
            (keys, bytes::BytesMut::new())
        }
        None => handshake::uniform_dh(&mut stream, &params.shared_secret).await?,
    };

    let codec = SsCodec::new(&keys.send, &keys.recv, &keys.len_seed);
    Ok(SsStream::new(stream, codec, &keys.len_seed, &leftover))
}
