//! UniformDH: Diffie-Hellman with public values indistinguishable from
//! uniformly random strings.
//!
//! The group is the RFC 3526 1536-bit MODP group (group 5), generator 2.
//! The private exponent has its low bit cleared so it is even; the cleared
//! bit doubles as a blinding coin deciding whether `g^x mod p` or
//! `p - g^x mod p` goes on the wire.  Because the exponent is even, both
//! values produce the same shared secret, and the transmitted value is
//! computationally uniform over `[0, p)`.

use num_bigint_dig::BigUint;
use zeroize::Zeroize;

use crate::common::SecureBuffer;
use crate::{Error, Result};

/// Length of keys and shared secrets: the group modulus is 1536 bits.
pub const KEY_LENGTH: usize = 1536 / 8;

/// The RFC 3526 group 5 prime.
const MODP_1536: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                         29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
                         C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
                         83655D23DCA3AD961C62F356208552BB9ED529077096966D\
                         670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF";

const GENERATOR: u32 = 2;

fn group_prime() -> BigUint {
    // The constant is compile-time vetted hex, parse cannot fail.
    BigUint::parse_bytes(MODP_1536.as_bytes(), 16).unwrap()
}

/// Encode as exactly [`KEY_LENGTH`] big-endian bytes, zero padded.
fn to_fixed_bytes(n: &BigUint) -> [u8; KEY_LENGTH] {
    let raw = n.to_bytes_be();
    let mut out = [0u8; KEY_LENGTH];
    out[KEY_LENGTH - raw.len()..].copy_from_slice(&raw);
    out
}

/// An ephemeral UniformDH keypair.
pub struct Keypair {
    private: SecureBuffer,
    public: [u8; KEY_LENGTH],
}

impl Keypair {
    /// Generates a fresh keypair from system entropy.
    pub fn generate() -> Result<Self> {
        let mut private = SecureBuffer::from_entropy(KEY_LENGTH)?;

        // The low bit is the blinding coin; clearing it makes the exponent
        // even, which is what lets p - g^x stand in for g^x.
        let blind = private[KEY_LENGTH - 1] & 1 == 1;
        private[KEY_LENGTH - 1] &= !1;

        let p = group_prime();
        let x = BigUint::from_bytes_be(&private);
        let gx = BigUint::from(GENERATOR).modpow(&x, &p);

        let shown = if blind { &p - &gx } else { gx };

        Ok(Keypair {
            private,
            public: to_fixed_bytes(&shown),
        })
    }

    /// The transmitted public value.
    pub fn public(&self) -> &[u8; KEY_LENGTH] {
        &self.public
    }

    /// Computes `peer^x mod p` as [`KEY_LENGTH`] big-endian bytes.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<SecureBuffer> {
        if peer_public.len() != KEY_LENGTH {
            return Err(Error::Crypto(format!(
                "uniformdh public value must be {KEY_LENGTH}B, got {}B",
                peer_public.len()
            )));
        }

        let p = group_prime();
        let x = BigUint::from_bytes_be(&self.private);
        let y = BigUint::from_bytes_be(peer_public) % &p;
        let shared = y.modpow(&x, &p);

        let mut fixed = to_fixed_bytes(&shared);
        let out = SecureBuffer::from_slice(&fixed);
        fixed.zeroize();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_agrees() -> Result<()> {
        let alice = Keypair::generate()?;
        let bob = Keypair::generate()?;

        let s_a = alice.shared_secret(bob.public())?;
        let s_b = bob.shared_secret(alice.public())?;

        assert_eq!(s_a, s_b);
        assert_eq!(s_a.len(), KEY_LENGTH);
        Ok(())
    }

    #[test]
    fn blinded_value_agrees() -> Result<()> {
        // Because the exponent is even, peer^x == (p - peer)^x.
        let alice = Keypair::generate()?;
        let bob = Keypair::generate()?;

        let p = group_prime();
        let y = BigUint::from_bytes_be(bob.public());
        let y_neg = to_fixed_bytes(&(&p - &y));

        let s = alice.shared_secret(bob.public())?;
        let s_neg = alice.shared_secret(&y_neg)?;
        assert_eq!(s, s_neg);
        Ok(())
    }

    #[test]
    fn public_in_range() -> Result<()> {
        let p = group_prime();
        for _ in 0..8 {
            let kp = Keypair::generate()?;
            assert_eq!(kp.public().len(), KEY_LENGTH);
            assert!(BigUint::from_bytes_be(kp.public()) < p);
        }
        Ok(())
    }

    #[test]
    fn private_exponent_is_even() -> Result<()> {
        for _ in 0..8 {
            let kp = Keypair::generate()?;
            assert_eq!(kp.private[KEY_LENGTH - 1] & 1, 0);
        }
        Ok(())
    }

    #[test]
    fn rejects_short_public() {
        let kp = Keypair::generate().unwrap();
        assert!(kp.shared_secret(&[0u8; KEY_LENGTH - 1]).is_err());
    }
}
