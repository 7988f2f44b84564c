//! # obfs2 - The Twobfuscator (client side)
//!
//! The handshake is a seed exchange: each side sends a 16 byte seed followed
//! by an encrypted magic/padding-length header and that much padding, keyed
//! off `MAC(label, seed)` where `MAC(K, M) = SHA256(K || M || K)`.  Session
//! keys are derived from both seeds once the responder header validates.
//! Steady state is plain AES-CTR in each direction, length preserving.

use cipher::{KeyIvInit, StreamCipher};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::common::mac::obfs2_mac;
use crate::stream::{Aes128Ctr, CipherStream};
use crate::{Error, Result};

pub const NAME: &str = "obfs2";

pub const MAGIC_VALUE: u32 = 0x2BF5_CA7E;
pub const SEED_LENGTH: usize = 16;
pub const MAX_PADDING: usize = 8192;
const KEY_LENGTH: usize = 16;

pub const INIT_PAD_KEY_LABEL: &[u8] = b"Initiator obfuscation padding";
pub const RESP_PAD_KEY_LABEL: &[u8] = b"Responder obfuscation padding";
pub const INIT_DATA_LABEL: &[u8] = b"Initiator obfuscated data";
pub const RESP_DATA_LABEL: &[u8] = b"Responder obfuscated data";

pub type Obfs2Stream<T> = CipherStream<T, Aes128Ctr>;

/// The MAC digest doubles as key material: first half AES-128 key, second
/// half the CTR IV.
pub fn cipher_from_digest(digest: &[u8; 32]) -> Aes128Ctr {
    let key: [u8; KEY_LENGTH] = digest[..KEY_LENGTH].try_into().unwrap();
    let iv: [u8; 16] = digest[KEY_LENGTH..].try_into().unwrap();
    Aes128Ctr::new(&key.into(), &iv.into())
}

// 8192 divides 2^32 so the modulo is exact, not merely close to uniform.
fn pad_length() -> Result<usize> {
    let mut b = [0u8; 4];
    getrandom::getrandom(&mut b)?;
    Ok(u32::from_be_bytes(b) as usize % MAX_PADDING)
}

/// Runs the initiator side of the obfs2 handshake over `stream`, returning
/// the keyed relay stream once the responder header validates.
pub async fn handshake<T>(mut stream: T) -> Result<Obfs2Stream<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    debug!("starting obfs2 handshake");

    let mut init_seed = Zeroizing::new([0u8; SEED_LENGTH]);
    getrandom::getrandom(&mut *init_seed)?;

    let init_pad_key = Zeroizing::new(obfs2_mac(INIT_PAD_KEY_LABEL, &*init_seed));
    let mut init_cipher = cipher_from_digest(&init_pad_key);

    // INIT_SEED || E(MAGIC || PADLEN) || E(rand[PADLEN])
    let padlen = pad_length()?;
    let mut hdr = [0u8; 8];
    hdr[..4].copy_from_slice(&MAGIC_VALUE.to_be_bytes());
    hdr[4..].copy_from_slice(&(padlen as u32).to_be_bytes());
    init_cipher.apply_keystream(&mut hdr);

    stream.write_all(&*init_seed).await?;
    stream.write_all(&hdr).await?;

    if padlen > 0 {
        let mut padding = vec![0u8; padlen];
        getrandom::getrandom(&mut padding)?;
        init_cipher.apply_keystream(&mut padding);
        stream.write_all(&padding).await?;
    }
    stream.flush().await?;

    // RESP_SEED and the encrypted responder header.
    let mut resp_seed = Zeroizing::new([0u8; SEED_LENGTH]);
    stream.read_exact(&mut *resp_seed).await?;

    let resp_pad_key = Zeroizing::new(obfs2_mac(RESP_PAD_KEY_LABEL, &*resp_seed));
    let mut resp_cipher = cipher_from_digest(&resp_pad_key);

    let mut resp_hdr = [0u8; 8];
    stream.read_exact(&mut resp_hdr).await?;
    resp_cipher.apply_keystream(&mut resp_hdr);

    let magic = u32::from_be_bytes(resp_hdr[..4].try_into().unwrap());
    if magic != MAGIC_VALUE {
        warn!("received invalid magic value from peer");
        return Err(Error::Handshake(format!("bad magic value 0x{magic:08x}")));
    }
    let resp_pad_len = u32::from_be_bytes(resp_hdr[4..].try_into().unwrap()) as usize;
    if resp_pad_len > MAX_PADDING {
        warn!("peer claims to have sent too much padding: {resp_pad_len}");
        return Err(Error::Handshake(format!(
            "peer padding length {resp_pad_len} exceeds {MAX_PADDING}"
        )));
    }

    // Drain the responder padding; it is keystream-covered noise and never
    // reaches the client.
    let mut remaining = resp_pad_len;
    let mut scratch = [0u8; 512];
    while remaining > 0 {
        let want = remaining.min(scratch.len());
        let n = stream.read(&mut scratch[..want]).await?;
        if n == 0 {
            return Err(Error::Handshake("eof while draining padding".to_string()));
        }
        remaining -= n;
    }

    // INIT_SECRET = MAC("Initiator obfuscated data", INIT_SEED | RESP_SEED)
    // RESP_SECRET = MAC("Responder obfuscated data", INIT_SEED | RESP_SEED)
    let seeds = {
        let mut m = Zeroizing::new([0u8; SEED_LENGTH * 2]);
        m[..SEED_LENGTH].copy_from_slice(&*init_seed);
        m[SEED_LENGTH..].copy_from_slice(&*resp_seed);
        m
    };
    let init_secret = Zeroizing::new(obfs2_mac(INIT_DATA_LABEL, &*seeds));
    let resp_secret = Zeroizing::new(obfs2_mac(RESP_DATA_LABEL, &*seeds));

    info!("finished obfs2 handshake");

    Ok(CipherStream::new(
        stream,
        cipher_from_digest(&init_secret),
        cipher_from_digest(&resp_secret),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::DuplexStream;

    struct FakeBridge {
        stream: DuplexStream,
        init_cipher: Aes128Ctr,
        resp_cipher: Aes128Ctr,
    }

    /// Runs the responder side of the handshake the way a real obfs2 bridge
    /// would, with a caller-chosen seed, magic, and padding length.
    async fn fake_bridge(
        mut stream: DuplexStream,
        resp_seed: [u8; SEED_LENGTH],
        magic: u32,
        padlen: usize,
    ) -> FakeBridge {
        // Consume the initiator seed and header, decrypt, sanity check.
        let mut init_seed = [0u8; SEED_LENGTH];
        stream.read_exact(&mut init_seed).await.unwrap();
        let init_pad_key = obfs2_mac(INIT_PAD_KEY_LABEL, &init_seed);
        let mut init_pad_cipher = cipher_from_digest(&init_pad_key);

        let mut hdr = [0u8; 8];
        stream.read_exact(&mut hdr).await.unwrap();
        init_pad_cipher.apply_keystream(&mut hdr);
        assert_eq!(u32::from_be_bytes(hdr[..4].try_into().unwrap()), MAGIC_VALUE);
        let client_padlen = u32::from_be_bytes(hdr[4..].try_into().unwrap()) as usize;
        assert!(client_padlen < MAX_PADDING);

        let mut pad = vec![0u8; client_padlen];
        stream.read_exact(&mut pad).await.unwrap();

        // Respond with our own seed and header.
        let resp_pad_key = obfs2_mac(RESP_PAD_KEY_LABEL, &resp_seed);
        let mut resp_pad_cipher = cipher_from_digest(&resp_pad_key);

        let mut resp_hdr = [0u8; 8];
        resp_hdr[..4].copy_from_slice(&magic.to_be_bytes());
        resp_hdr[4..].copy_from_slice(&(padlen as u32).to_be_bytes());
        resp_pad_cipher.apply_keystream(&mut resp_hdr);

        // The client drops its end mid-write in the failure scenarios, so
        // these sends are best-effort.
        let _ = stream.write_all(&resp_seed).await;
        let _ = stream.write_all(&resp_hdr).await;
        if padlen > 0 {
            let mut padding = vec![0u8; padlen.min(MAX_PADDING)];
            resp_pad_cipher.apply_keystream(&mut padding);
            let _ = stream.write_all(&padding).await;
        }

        let seeds = [init_seed, resp_seed].concat();
        FakeBridge {
            stream,
            init_cipher: cipher_from_digest(&obfs2_mac(INIT_DATA_LABEL, &seeds)),
            resp_cipher: cipher_from_digest(&obfs2_mac(RESP_DATA_LABEL, &seeds)),
        }
    }

    #[tokio::test]
    async fn happy_path_relays_payload() {
        let (client_end, bridge_end) = tokio::io::duplex(64 * 1024);
        let seed: [u8; SEED_LENGTH] = core::array::from_fn(|i| i as u8);

        let bridge = tokio::spawn(fake_bridge(bridge_end, seed, MAGIC_VALUE, 0));
        let mut conn = handshake(client_end).await.unwrap();
        let mut bridge = bridge.await.unwrap();

        // Client payload shows up on the bridge as AES_CTR(K_init, payload).
        conn.write_all(b"hello").await.unwrap();
        conn.flush().await.unwrap();

        let mut wire = [0u8; 5];
        bridge.stream.read_exact(&mut wire).await.unwrap();
        assert_ne!(&wire, b"hello");
        bridge.init_cipher.apply_keystream(&mut wire);
        assert_eq!(&wire, b"hello");

        // And bridge data decrypts on the client side.
        let mut reply = *b"world";
        bridge.resp_cipher.apply_keystream(&mut reply);
        bridge.stream.write_all(&reply).await.unwrap();

        let mut got = [0u8; 5];
        conn.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"world");
    }

    #[tokio::test]
    async fn handshake_succeeds_with_max_padding() {
        let (client_end, bridge_end) = tokio::io::duplex(64 * 1024);
        let bridge = tokio::spawn(fake_bridge(bridge_end, [7u8; 16], MAGIC_VALUE, MAX_PADDING));
        let conn = handshake(client_end).await;
        assert!(conn.is_ok());
        drop(bridge.await.unwrap());
    }

    #[tokio::test]
    async fn bad_magic_is_fatal() {
        let (client_end, bridge_end) = tokio::io::duplex(64 * 1024);
        let bridge = tokio::spawn(fake_bridge(bridge_end, [7u8; 16], 0x0102_0304, 0));
        let err = handshake(client_end).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)), "got {err}");
        drop(bridge.await.unwrap());
    }

    #[tokio::test]
    async fn oversized_padding_is_fatal() {
        let (client_end, bridge_end) = tokio::io::duplex(64 * 1024);
        let bridge = tokio::spawn(fake_bridge(
            bridge_end,
            [7u8; 16],
            MAGIC_VALUE,
            MAX_PADDING + 1,
        ));
        let err = handshake(client_end).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)), "got {err}");
        drop(bridge.await.unwrap());
    }

    /// The initiator's first bytes decompose as
    /// `SEED || E(MAGIC || PADLEN) || E(rand[PADLEN])` under the seed-derived
    /// padding key.
    #[tokio::test]
    async fn initiator_bytes_reproducible_from_seed() {
        let (client_end, mut observer) = tokio::io::duplex(64 * 1024);
        // The handshake blocks on the responder; only its send matters here.
        let task = tokio::spawn(async move {
            let _ = handshake(client_end).await;
        });

        let mut seed = [0u8; SEED_LENGTH];
        observer.read_exact(&mut seed).await.unwrap();
        let mut cipher = cipher_from_digest(&obfs2_mac(INIT_PAD_KEY_LABEL, &seed));

        let mut hdr = [0u8; 8];
        observer.read_exact(&mut hdr).await.unwrap();
        cipher.apply_keystream(&mut hdr);

        assert_eq!(u32::from_be_bytes(hdr[..4].try_into().unwrap()), MAGIC_VALUE);
        let padlen = u32::from_be_bytes(hdr[4..].try_into().unwrap()) as usize;
        assert!(padlen < MAX_PADDING);

        let mut padding = vec![0u8; padlen];
        observer.read_exact(&mut padding).await.unwrap();

        drop(observer);
        task.await.unwrap();
    }
}
