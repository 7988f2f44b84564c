//! # obfs3 - The Threebfuscator (client side)
//!
//! A UniformDH exchange: the initiator sends its 192 byte public value
//! followed by random padding, the responder answers with its own public
//! value, padding, and an HMAC delimiter keyed by the shared secret.  The
//! initiator cannot tell padding from the delimiter a priori, so it scans
//! the stream for a marker that verifies for some padding length.  Session
//! keys come from HKDF-SHA256 over the shared secret; steady state is
//! length-preserving AES-CTR like obfs2.

use bytes::BytesMut;
use cipher::KeyIvInit;
use hkdf::Hkdf;
use hmac::Mac;
use rand::Rng;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::common::{ct, uniform_dh, HmacSha256, SecureBuffer};
use crate::stream::{Aes128Ctr, CipherStream};
use crate::{Error, Result};

pub const NAME: &str = "obfs3";

const MAX_PADDING: usize = 8194;
const PUBLIC_KEY_LENGTH: usize = uniform_dh::KEY_LENGTH;
const MARK_LENGTH: usize = 32;
const KEY_MATERIAL_LENGTH: usize = 64;

pub type Obfs3Stream<T> = CipherStream<T, Aes128Ctr>;

/// Runs the initiator side of the obfs3 handshake.
pub async fn handshake<T>(stream: T) -> Result<Obfs3Stream<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let padlen = rand::thread_rng().gen_range(0..=MAX_PADDING);
    handshake_with_padding(stream, padlen).await
}

async fn handshake_with_padding<T>(mut stream: T, padlen: usize) -> Result<Obfs3Stream<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    debug!("starting obfs3 handshake");

    let keypair = uniform_dh::Keypair::generate()?;

    // X || rand[PADLEN]
    stream.write_all(keypair.public()).await?;
    if padlen > 0 {
        let mut padding = vec![0u8; padlen];
        getrandom::getrandom(&mut padding)?;
        stream.write_all(&padding).await?;
    }
    stream.flush().await?;

    // Read at least the responder public value, then hunt for the HMAC
    // delimiter that terminates the responder padding.
    let mut buf = BytesMut::with_capacity(PUBLIC_KEY_LENGTH + MAX_PADDING + MARK_LENGTH);
    while buf.len() < PUBLIC_KEY_LENGTH {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::Handshake(
                "eof before responder public value".to_string(),
            ));
        }
    }
    let peer_public = buf.split_to(PUBLIC_KEY_LENGTH);
    let shared = keypair.shared_secret(&peer_public)?;

    // A marker beginning n bytes past the public value must verify as
    // HMAC(SHARED, 0x00 || n); everything before it is padding.
    let mut checked = 0usize;
    let leftover = 'scan: loop {
        while checked + MARK_LENGTH <= buf.len() {
            if checked > MAX_PADDING {
                return Err(Error::Handshake(
                    "no delimiter within the padding bound".to_string(),
                ));
            }
            let mark = delimiter_mark(&shared, checked)?;
            if ct::bytes_eq(&mark, &buf[checked..checked + MARK_LENGTH]) {
                break 'scan buf.split_off(checked + MARK_LENGTH);
            }
            checked += 1;
        }
        if checked > MAX_PADDING {
            return Err(Error::Handshake(
                "no delimiter within the padding bound".to_string(),
            ));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::Handshake("eof while scanning for delimiter".to_string()));
        }
    };

    let (enc, dec) = derive_ciphers(&shared)?;
    info!("finished obfs3 handshake");

    Ok(CipherStream::with_read_leftover(stream, enc, dec, &leftover))
}

fn delimiter_mark(shared: &SecureBuffer, padlen: usize) -> Result<[u8; MARK_LENGTH]> {
    let mut m = HmacSha256::new_from_slice(shared)?;
    m.update(&[0u8]);
    m.update(&(padlen as u32).to_be_bytes());
    Ok(m.finalize().into_bytes().into())
}

// HKDF(SHARED) -> INIT_KEY || INIT_IV || RESP_KEY || RESP_IV
fn derive_ciphers(shared: &SecureBuffer) -> Result<(Aes128Ctr, Aes128Ctr)> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut okm = Zeroizing::new([0u8; KEY_MATERIAL_LENGTH]);
    hk.expand(&[], &mut *okm)
        .map_err(|_| Error::Crypto("hkdf expand length invalid".to_string()))?;

    let key_a: [u8; 16] = okm[..16].try_into().unwrap();
    let iv_a: [u8; 16] = okm[16..32].try_into().unwrap();
    let key_b: [u8; 16] = okm[32..48].try_into().unwrap();
    let iv_b: [u8; 16] = okm[48..64].try_into().unwrap();

    Ok((
        Aes128Ctr::new(&key_a.into(), &iv_a.into()),
        Aes128Ctr::new(&key_b.into(), &iv_b.into()),
    ))
}
