//! ScrambleSuit link framing.
//!
//! The wire frame is:
//!
//! ```txt
//!     tag     [u8; 16];  // HMAC-SHA256-128, encrypt-then-MAC
//!     length  u16;       // obfuscated, big endian
//!     body    [u8];      // AES-256-CTR ciphertext
//! ```
//!
//! and the decrypted body is `payload_len: u16 || payload || zero padding`.
//! The length field is the body length XORed with the next 16 bit mask from
//! a hash DRBG both peers seeded from the handshake, so lengths never appear
//! in the clear.  The AES-CTR IV is an 8 byte nonce prefix from the key
//! material followed by a big endian frame counter starting at 1; the
//! counter wrapping is fatal for the session.

use bytes::{Buf, BufMut, BytesMut};
use cipher::{KeyIvInit, StreamCipher};
use hmac::Mac;
use tokio_util::codec::{Decoder, Encoder};
use zeroize::Zeroizing;

use crate::common::{ct, drbg, HmacSha256};
use crate::{Error, Result};

use super::handshake::DirectionKeys;

/// MaximumFrameLength is the largest whole frame, overhead included.
pub const MAX_FRAME_LENGTH: usize = 1448;

pub const TAG_LENGTH: usize = 16;
pub const LENGTH_LENGTH: usize = 2;
pub const HEADER_LENGTH: usize = TAG_LENGTH + LENGTH_LENGTH;

/// Length prefix inside the encrypted body.
pub const PAYLOAD_LENGTH_LENGTH: usize = 2;

pub const MAX_BODY_LENGTH: usize = MAX_FRAME_LENGTH - HEADER_LENGTH;
pub const MAX_PAYLOAD_LENGTH: usize = MAX_BODY_LENGTH - PAYLOAD_LENGTH_LENGTH;
pub const MIN_BODY_LENGTH: usize = PAYLOAD_LENGTH_LENGTH;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

const NONCE_PREFIX_LENGTH: usize = 8;
const NONCE_LENGTH: usize = 16;

impl std::error::Error for FrameError {}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// The payload handed to [`encode`] does not fit a frame.
    InvalidPayloadLength(usize),

    /// A decoded frame length is outside the permitted bounds.
    InvalidFrameLength(u16),

    /// The frame tag failed to authenticate (FATAL).
    TagMismatch,

    /// The frame counter wrapped (FATAL).
    NonceCounterWrapped,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FrameError::InvalidPayloadLength(s) => {
                write!(f, "framing: invalid payload length: {s}")
            }
            FrameError::InvalidFrameLength(l) => write!(f, "framing: invalid frame length: {l}"),
            FrameError::TagMismatch => write!(f, "framing: HMAC tag mismatch"),
            FrameError::NonceCounterWrapped => write!(f, "framing: nonce counter wrapped"),
        }
    }
}

/// One outgoing frame: payload plus the padding that rounds the frame out to
/// the sampled wire length.
pub(crate) struct FrameSpec {
    pub payload: BytesMut,
    pub pad_len: usize,
}

/// Per-direction CTR nonce management.
struct NonceBox {
    prefix: [u8; NONCE_PREFIX_LENGTH],
    counter: u64,
}

impl NonceBox {
    fn new(prefix: [u8; NONCE_PREFIX_LENGTH]) -> Self {
        Self { prefix, counter: 1 }
    }

    fn next(&mut self) -> std::result::Result<[u8; NONCE_LENGTH], FrameError> {
        if self.counter == u64::MAX {
            return Err(FrameError::NonceCounterWrapped);
        }
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce[..NONCE_PREFIX_LENGTH].copy_from_slice(&self.prefix);
        nonce[NONCE_PREFIX_LENGTH..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        Ok(nonce)
    }
}

struct SsEncoder {
    key: Zeroizing<[u8; 32]>,
    hmac_key: Zeroizing<[u8; 32]>,
    nonce: NonceBox,
    drbg: drbg::Drbg,
}

struct SsDecoder {
    key: Zeroizing<[u8; 32]>,
    hmac_key: Zeroizing<[u8; 32]>,
    nonce: NonceBox,
    drbg: drbg::Drbg,

    // Header already consumed for the frame still in flight; 0 length means
    // no header has been read yet.
    next_length: usize,
    next_tag: [u8; TAG_LENGTH],
    next_length_bytes: [u8; LENGTH_LENGTH],
}

/// Frame codec for one established session.
pub struct SsCodec {
    encoder: SsEncoder,
    decoder: SsDecoder,
}

impl SsCodec {
    pub(crate) fn new(send: &DirectionKeys, recv: &DirectionKeys, len_seed: &drbg::Seed) -> Self {
        Self {
            encoder: SsEncoder {
                key: send.aes_key.clone(),
                hmac_key: send.hmac_key.clone(),
                nonce: NonceBox::new(send.nonce_prefix),
                // Fixed-length seed, construction cannot fail.
                drbg: drbg::Drbg::new(Some(len_seed.clone())).unwrap(),
            },
            decoder: SsDecoder {
                key: recv.aes_key.clone(),
                hmac_key: recv.hmac_key.clone(),
                nonce: NonceBox::new(recv.nonce_prefix),
                drbg: drbg::Drbg::new(Some(len_seed.clone())).unwrap(),
                next_length: 0,
                next_tag: [0u8; TAG_LENGTH],
                next_length_bytes: [0u8; LENGTH_LENGTH],
            },
        }
    }
}

fn frame_tag(hmac_key: &[u8], length_bytes: &[u8], body: &[u8]) -> Result<[u8; TAG_LENGTH]> {
    let mut m = HmacSha256::new_from_slice(hmac_key)?;
    m.update(length_bytes);
    m.update(body);
    let digest = m.finalize().into_bytes();
    Ok(digest[..TAG_LENGTH].try_into().unwrap())
}

impl Encoder<FrameSpec> for SsCodec {
    type Error = Error;

    fn encode(&mut self, item: FrameSpec, dst: &mut BytesMut) -> Result<()> {
        let body_len = PAYLOAD_LENGTH_LENGTH + item.payload.len() + item.pad_len;
        if item.payload.len() > MAX_PAYLOAD_LENGTH || body_len > MAX_BODY_LENGTH {
            return Err(FrameError::InvalidPayloadLength(item.payload.len()).into());
        }

        let mut body = BytesMut::with_capacity(body_len);
        body.put_u16(item.payload.len() as u16);
        body.put_slice(&item.payload);
        body.put_bytes(0, item.pad_len);

        let nonce = self.encoder.nonce.next()?;
        let key: &[u8; 32] = &self.encoder.key;
        let mut cipher = Aes256Ctr::new(key.into(), &nonce.into());
        cipher.apply_keystream(&mut body);

        let mask = self.encoder.drbg.length_mask();
        let obfs_len = (body_len as u16) ^ mask;
        let length_bytes = obfs_len.to_be_bytes();

        let tag = frame_tag(&*self.encoder.hmac_key, &length_bytes, &body)?;

        dst.reserve(HEADER_LENGTH + body_len);
        dst.put_slice(&tag);
        dst.put_slice(&length_bytes);
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for SsCodec {
    type Item = BytesMut;
    type Error = Error;

    // Frames that carry no payload (pure padding) are consumed in place, so
    // a successful decode either yields payload bytes or asks for more data.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let d = &mut self.decoder;
        loop {
            if d.next_length == 0 {
                if src.len() < HEADER_LENGTH {
                    return Ok(None);
                }

                d.next_tag.copy_from_slice(&src[..TAG_LENGTH]);
                src.advance(TAG_LENGTH);
                d.next_length_bytes.copy_from_slice(&src[..LENGTH_LENGTH]);
                src.advance(LENGTH_LENGTH);

                let obfs_len = u16::from_be_bytes(d.next_length_bytes);
                let length = obfs_len ^ d.drbg.length_mask();
                if (length as usize) < MIN_BODY_LENGTH || (length as usize) > MAX_BODY_LENGTH {
                    return Err(FrameError::InvalidFrameLength(length).into());
                }
                d.next_length = length as usize;
            }

            if src.len() < d.next_length {
                src.reserve(d.next_length - src.len());
                return Ok(None);
            }

            let mut body = src.split_to(d.next_length);
            d.next_length = 0;

            let tag = frame_tag(&*d.hmac_key, &d.next_length_bytes, &body)?;
            if !ct::bytes_eq(&tag, &d.next_tag) {
                return Err(FrameError::TagMismatch.into());
            }

            let nonce = d.nonce.next()?;
            let key: &[u8; 32] = &d.key;
            let mut cipher = Aes256Ctr::new(key.into(), &nonce.into());
            cipher.apply_keystream(&mut body);

            let payload_len = u16::from_be_bytes(body[..2].try_into().unwrap()) as usize;
            if payload_len > body.len() - PAYLOAD_LENGTH_LENGTH {
                return Err(FrameError::InvalidPayloadLength(payload_len).into());
            }

            if payload_len == 0 {
                // Padding-only frame; keep draining.
                continue;
            }

            body.advance(PAYLOAD_LENGTH_LENGTH);
            body.truncate(payload_len);
            return Ok(Some(body));
        }
    }
}
