//! ScrambleSuit handshakes: session-ticket redemption and UniformDH.
//!
//! Both variants authenticate to the bridge with HMAC-SHA256-128 under the
//! out-of-band shared secret `k_B` and carry an epoch-hour marker so stale
//! messages cannot be replayed indefinitely.  The ticket variant completes
//! without any server bytes; the UniformDH variant waits for the bridge's
//! public value and scans past its padding for the terminating MAC.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use hkdf::Hkdf;
use hmac::Mac;
use rand::Rng;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::common::{ct, drbg, uniform_dh, HmacSha256, SecureBuffer};
use crate::{Error, Result};

pub(crate) const MAC_LENGTH: usize = 16;
const EPOCH_LENGTH: usize = 8;
const EPOCH_GRANULARITY: u64 = 3600;

const TICKET_MAX_PADDING: usize = 1388;

/// Total on-the-wire bounds for a UniformDH handshake message.
const DH_MSG_MIN_LENGTH: usize = 1308;
const DH_MSG_MAX_PADDING: usize = 1308;
const DH_MSG_MAX_LENGTH: usize = DH_MSG_MIN_LENGTH + DH_MSG_MAX_PADDING;

const PUBLIC_KEY_LENGTH: usize = uniform_dh::KEY_LENGTH;

/// The fixed, non-padding portion of a UniformDH message.
const DH_MSG_OVERHEAD: usize = PUBLIC_KEY_LENGTH + MAC_LENGTH + EPOCH_LENGTH;

const AES_KEY_LENGTH: usize = 32;
const NONCE_PREFIX_LENGTH: usize = 8;
const HMAC_KEY_LENGTH: usize = 32;
const DIRECTION_KEY_LENGTH: usize = AES_KEY_LENGTH + NONCE_PREFIX_LENGTH + HMAC_KEY_LENGTH;

pub(crate) const KEY_MATERIAL_LENGTH: usize = 2 * DIRECTION_KEY_LENGTH + drbg::SEED_LENGTH;

/// Key material for one relay direction.
#[derive(Debug)]
pub(crate) struct DirectionKeys {
    pub aes_key: Zeroizing<[u8; AES_KEY_LENGTH]>,
    pub nonce_prefix: [u8; NONCE_PREFIX_LENGTH],
    pub hmac_key: Zeroizing<[u8; HMAC_KEY_LENGTH]>,
}

impl DirectionKeys {
    fn split(okm: &[u8]) -> Self {
        Self {
            aes_key: Zeroizing::new(okm[..AES_KEY_LENGTH].try_into().unwrap()),
            nonce_prefix: okm[AES_KEY_LENGTH..AES_KEY_LENGTH + NONCE_PREFIX_LENGTH]
                .try_into()
                .unwrap(),
            hmac_key: Zeroizing::new(
                okm[AES_KEY_LENGTH + NONCE_PREFIX_LENGTH..DIRECTION_KEY_LENGTH]
                    .try_into()
                    .unwrap(),
            ),
        }
    }
}

/// Everything the framed relay needs, both directions plus the shared
/// length/inter-arrival seed.
#[derive(Debug)]
pub(crate) struct SessionKeys {
    pub send: DirectionKeys,
    pub recv: DirectionKeys,
    pub len_seed: drbg::Seed,
}

/// HKDF-SHA256 expansion of the handshake secret into the session key block.
pub(crate) fn kdf(ikm: &SecureBuffer) -> Result<SessionKeys> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = Zeroizing::new([0u8; KEY_MATERIAL_LENGTH]);
    hk.expand(&[], &mut *okm)
        .map_err(|_| Error::Crypto("hkdf expand length invalid".to_string()))?;

    let send = DirectionKeys::split(&okm[..DIRECTION_KEY_LENGTH]);
    let recv = DirectionKeys::split(&okm[DIRECTION_KEY_LENGTH..2 * DIRECTION_KEY_LENGTH]);
    let len_seed = drbg::Seed::try_from(&okm[2 * DIRECTION_KEY_LENGTH..])?;

    Ok(SessionKeys {
        send,
        recv,
        len_seed,
    })
}

fn epoch_hour() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        / EPOCH_GRANULARITY
}

fn mac16(key: &SecureBuffer, parts: &[&[u8]]) -> Result<[u8; MAC_LENGTH]> {
    let mut m = HmacSha256::new_from_slice(key)?;
    for p in parts {
        m.update(p);
    }
    let digest = m.finalize().into_bytes();
    Ok(digest[..MAC_LENGTH].try_into().unwrap())
}

/// Redeems a session ticket: `T || MAC(k_B, T || P || E) || P || E`.
///
/// The server recognizes the ticket and sends nothing back; the session is
/// established as soon as the message is on the wire.
pub(crate) async fn ticket<T>(
    stream: &mut T,
    shared_secret: &SecureBuffer,
    session_ticket: &SecureBuffer,
) -> Result<SessionKeys>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    debug!("starting scramblesuit session-ticket handshake");

    let pad_len = rand::thread_rng().gen_range(0..=TICKET_MAX_PADDING);
    let mut padding = vec![0u8; pad_len];
    getrandom::getrandom(&mut padding)?;

    let epoch = epoch_hour().to_be_bytes();
    let mac = mac16(shared_secret, &[session_ticket, &padding, &epoch])?;

    let mut msg = Vec::with_capacity(session_ticket.len() + MAC_LENGTH + pad_len + EPOCH_LENGTH);
    msg.extend_from_slice(session_ticket);
    msg.extend_from_slice(&mac);
    msg.extend_from_slice(&padding);
    msg.extend_from_slice(&epoch);

    stream.write_all(&msg).await?;
    stream.flush().await?;

    info!("finished scramblesuit ticket handshake");

    kdf(&shared_secret.concat(session_ticket))
}

/// Runs the UniformDH handshake, returning the session keys and any bytes
/// that arrived after the server's terminator.
pub(crate) async fn uniform_dh<T>(
    stream: &mut T,
    shared_secret: &SecureBuffer,
) -> Result<(SessionKeys, BytesMut)>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    debug!("starting scramblesuit uniformdh handshake");

    let keypair = uniform_dh::Keypair::generate()?;

    // X || P || MAC(k_B, X || P || E) || E, total uniform in the message
    // length bounds.
    let total = rand::thread_rng().gen_range(DH_MSG_MIN_LENGTH..=DH_MSG_MAX_LENGTH);
    let pad_len = total - DH_MSG_OVERHEAD;
    let mut padding = vec![0u8; pad_len];
    getrandom::getrandom(&mut padding)?;

    let epoch = epoch_hour().to_be_bytes();
    let mac = mac16(shared_secret, &[keypair.public(), &padding, &epoch])?;

    let mut msg = Vec::with_capacity(total);
    msg.extend_from_slice(keypair.public());
    msg.extend_from_slice(&padding);
    msg.extend_from_slice(&mac);
    msg.extend_from_slice(&epoch);
    stream.write_all(&msg).await?;
    stream.flush().await?;

    // Server response: Y || P || MAC(k_B, Y || P || E) || E.
    let mut buf = BytesMut::with_capacity(DH_MSG_MAX_LENGTH);
    while buf.len() < PUBLIC_KEY_LENGTH {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::Handshake(
                "eof before responder public value".to_string(),
            ));
        }
    }
    let peer_public = buf.split_to(PUBLIC_KEY_LENGTH);

    // Locate the terminator: a MAC at padding offset n must verify as
    // MAC(k_B, Y || P[..n] || E) and be followed by that same E on the
    // wire.  Allow one hour of clock skew in either direction.
    let now = epoch_hour();
    let epochs: [[u8; EPOCH_LENGTH]; 3] = [
        now.wrapping_sub(1).to_be_bytes(),
        now.to_be_bytes(),
        (now + 1).to_be_bytes(),
    ];

    let max_pad = DH_MSG_MAX_LENGTH - DH_MSG_OVERHEAD;
    let mut scanned = 0usize;
    let leftover = 'scan: loop {
        while scanned + MAC_LENGTH + EPOCH_LENGTH <= buf.len() {
            if scanned > max_pad {
                return Err(Error::Handshake(
                    "no terminator within the padding bound".to_string(),
                ));
            }
            for e in &epochs {
                let mac = mac16(shared_secret, &[&peer_public, &buf[..scanned], e])?;
                let tag_at = &buf[scanned..scanned + MAC_LENGTH];
                let epoch_at = &buf[scanned + MAC_LENGTH..scanned + MAC_LENGTH + EPOCH_LENGTH];
                if ct::bytes_eq(&mac, tag_at) && ct::bytes_eq(e, epoch_at) {
                    break 'scan buf.split_off(scanned + MAC_LENGTH + EPOCH_LENGTH);
                }
            }
            scanned += 1;
        }
        if scanned > max_pad {
            return Err(Error::Handshake(
                "no terminator within the padding bound".to_string(),
            ));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::Handshake(
                "eof while scanning for terminator".to_string(),
            ));
        }
    };

    let shared = keypair.shared_secret(&peer_public)?;
    let keys = kdf(&shared_secret.concat(&shared))?;

    info!("finished scramblesuit uniformdh handshake");

    Ok((keys, leftover))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use tokio::io::DuplexStream;

    /// Deterministic key block for codec and stream tests.
    pub(crate) fn test_keys() -> (SessionKeys, drbg::Seed) {
        let ikm = SecureBuffer::from_slice(b"fixed ikm for framing tests");
        let keys = kdf(&ikm).unwrap();
        let seed = keys.len_seed.clone();
        (keys, seed)
    }

    fn secret() -> SecureBuffer {
        SecureBuffer::from_slice(b"0123456789ABCDEFGHIJ")
    }

    #[test]
    fn kdf_directions_differ() {
        let keys = kdf(&secret()).unwrap();
        assert_ne!(*keys.send.aes_key, *keys.recv.aes_key);
        assert_ne!(*keys.send.hmac_key, *keys.recv.hmac_key);
        assert_ne!(keys.send.nonce_prefix, keys.recv.nonce_prefix);
    }

    #[test]
    fn kdf_deterministic() {
        let a = kdf(&secret()).unwrap();
        let b = kdf(&secret()).unwrap();
        assert_eq!(*a.send.aes_key, *b.send.aes_key);
        assert_eq!(a.len_seed, b.len_seed);
    }

    #[tokio::test]
    async fn ticket_message_layout() {
        let k_b = secret();
        let t = SecureBuffer::from_slice(&[0x5a; crate::scramblesuit::params::TICKET_LENGTH]);

        let (mut client_end, mut observer) = tokio::io::duplex(16 * 1024);
        let keys = ticket(&mut client_end, &k_b, &t).await.unwrap();
        drop(client_end);

        let mut msg = Vec::new();
        observer.read_to_end(&mut msg).await.unwrap();

        // T || MAC || P || E
        let ticket_len = t.len();
        assert!(msg.len() >= ticket_len + MAC_LENGTH + EPOCH_LENGTH);
        assert!(msg.len() <= ticket_len + MAC_LENGTH + TICKET_MAX_PADDING + EPOCH_LENGTH);
        assert_eq!(&msg[..ticket_len], &t[..]);

        let mac = &msg[ticket_len..ticket_len + MAC_LENGTH];
        let padding = &msg[ticket_len + MAC_LENGTH..msg.len() - EPOCH_LENGTH];
        let epoch = &msg[msg.len() - EPOCH_LENGTH..];

        let expect = mac16(&k_b, &[&t, padding, epoch]).unwrap();
        assert_eq!(mac, &expect[..]);

        let e = u64::from_be_bytes(epoch.try_into().unwrap());
        let now = epoch_hour();
        assert!(e == now || e == now.wrapping_sub(1));

        // Keys come from k_B || T on both sides.
        let again = kdf(&k_b.concat(&t)).unwrap();
        assert_eq!(*keys.send.aes_key, *again.send.aes_key);
    }

    /// Responder half of the UniformDH handshake for tests: verifies the
    /// client message the way a bridge would, then answers in kind.
    async fn fake_bridge(mut stream: DuplexStream, k_b: SecureBuffer) -> SessionKeys {
        let keypair = uniform_dh::Keypair::generate().unwrap();

        let mut buf = BytesMut::new();
        while buf.len() < PUBLIC_KEY_LENGTH {
            assert_ne!(stream.read_buf(&mut buf).await.unwrap(), 0);
        }
        let x = buf.split_to(PUBLIC_KEY_LENGTH);

        // Scan for the client terminator exactly like the client side does.
        let now = epoch_hour();
        let epochs: Vec<[u8; EPOCH_LENGTH]> =
            vec![now.wrapping_sub(1).to_be_bytes(), now.to_be_bytes()];
        let mut scanned = 0;
        'outer: loop {
            while scanned + MAC_LENGTH + EPOCH_LENGTH <= buf.len() {
                for e in &epochs {
                    let mac = mac16(&k_b, &[&x, &buf[..scanned], e]).unwrap();
                    if mac[..] == buf[scanned..scanned + MAC_LENGTH]
                        && e[..] == buf[scanned + MAC_LENGTH..scanned + MAC_LENGTH + EPOCH_LENGTH]
                    {
                        break 'outer;
                    }
                }
                scanned += 1;
            }
            assert_ne!(stream.read_buf(&mut buf).await.unwrap(), 0);
        }

        // Answer: Y || P || MAC || E with a modest padding.
        let mut padding = vec![0u8; 99];
        getrandom::getrandom(&mut padding).unwrap();
        let epoch = epoch_hour().to_be_bytes();
        let mac = mac16(&k_b, &[keypair.public(), &padding, &epoch]).unwrap();

        let mut msg = Vec::new();
        msg.extend_from_slice(keypair.public());
        msg.extend_from_slice(&padding);
        msg.extend_from_slice(&mac);
        msg.extend_from_slice(&epoch);
        stream.write_all(&msg).await.unwrap();

        let shared = keypair.shared_secret(&x).unwrap();
        kdf(&k_b.concat(&shared)).unwrap()
    }

    #[tokio::test]
    async fn uniform_dh_round_trip() {
        let k_b = secret();
        let (mut client_end, bridge_end) = tokio::io::duplex(64 * 1024);

        let bridge = tokio::spawn(fake_bridge(bridge_end, secret()));
        let (client_keys, leftover) = uniform_dh(&mut client_end, &k_b).await.unwrap();
        let bridge_keys = bridge.await.unwrap();

        assert!(leftover.is_empty());
        assert_eq!(*client_keys.send.aes_key, *bridge_keys.send.aes_key);
        assert_eq!(*client_keys.recv.hmac_key, *bridge_keys.recv.hmac_key);
        assert_eq!(client_keys.len_seed, bridge_keys.len_seed);
    }

    #[tokio::test]
    async fn garbage_response_fails() {
        let k_b = secret();
        let (mut client_end, mut bridge_end) = tokio::io::duplex(256 * 1024);

        let writer = tokio::spawn(async move {
            let mut sink = vec![0u8; DH_MSG_MAX_LENGTH];
            // Drain the client hello first so neither side stalls.
            let mut seen = 0;
            while seen < DH_MSG_MIN_LENGTH {
                let n = bridge_end.read(&mut sink).await.unwrap();
                assert_ne!(n, 0);
                seen += n;
            }
            let mut junk = vec![0u8; DH_MSG_MAX_LENGTH + 64];
            getrandom::getrandom(&mut junk).unwrap();
            bridge_end.write_all(&junk).await.unwrap();
            bridge_end
        });

        let err = uniform_dh(&mut client_end, &k_b).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)), "got {err}");
        drop(writer.await.unwrap());
    }
}

