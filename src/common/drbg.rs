//! Hash based Deterministic Random Bit Generator (DRBG).
//!
//! A SipHash-2-4 instance run in OFB mode. Both peers seed an instance from
//! the same handshake-derived value, so the keystream of length masks and
//! sampling blocks is reproducible on either end of a session.

use crate::{Error, Result};

use std::fmt;
use std::hash::Hasher;

use getrandom::getrandom;
use rand_core::{impls, Error as RandError, RngCore};
use siphasher::sip::SipHasher24;

pub(crate) const SIZE: usize = 8;
pub const SEED_LENGTH: usize = 16 + SIZE;

/// Hash-DRBG seed: a SipHash-2-4 key and the initial OFB block.
#[derive(Debug, PartialEq, Clone)]
pub struct Seed([u8; SEED_LENGTH]);

impl Seed {
    pub fn new() -> Result<Self> {
        let mut seed = Self([0_u8; SEED_LENGTH]);
        getrandom(&mut seed.0)?;
        Ok(seed)
    }

    // Calling unwraps here is safe because the seed length is fixed.
    fn to_pieces(&self) -> ([u8; 16], [u8; SIZE]) {
        let key: [u8; 16] = self.0[..16].try_into().unwrap();
        let ofb: [u8; SIZE] = self.0[16..].try_into().unwrap();
        (key, ofb)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; SEED_LENGTH]> for Seed {
    fn from(arr: [u8; SEED_LENGTH]) -> Self {
        Seed(arr)
    }
}

impl TryFrom<&[u8]> for Seed {
    type Error = Error;
    fn try_from(arr: &[u8]) -> Result<Self> {
        if arr.len() != SEED_LENGTH {
            let e = format!("incorrect drbg seed length {}!={SEED_LENGTH}", arr.len());
            return Err(Error::Other(e.into()));
        }

        Ok(Seed(arr.try_into().unwrap()))
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

pub struct Drbg {
    hash: SipHasher24,
    ofb: [u8; SIZE],
}

impl Drbg {
    /// Makes a 'Drbg' instance based off an optional seed.
    pub fn new(seed_in: Option<Seed>) -> Result<Self> {
        let seed = match seed_in {
            Some(s) => s,
            None => Seed::new()?,
        };
        let (key, ofb) = seed.to_pieces();
        Ok(Drbg {
            hash: SipHasher24::new_with_key(&key),
            ofb,
        })
    }

    /// Returns a uniformly distributed random uint [0, 1 << 64).
    pub fn uint64(&mut self) -> u64 {
        let ret: u64 = {
            self.hash.write(&self.ofb[..]);
            self.hash.finish().to_be()
        };
        self.ofb = ret.to_be_bytes();

        ret
    }

    /// Returns the next 8 byte DRBG block.
    pub fn next_block(&mut self) -> [u8; SIZE] {
        self.uint64().to_be_bytes()
    }

    /// Returns the next 16 bit length mask used to obfuscate frame lengths
    /// on the wire.
    pub fn length_mask(&mut self) -> u16 {
        let block = self.next_block();
        u16::from_be_bytes(block[..2].try_into().unwrap())
    }
}

impl RngCore for Drbg {
    fn next_u32(&mut self) -> u32 {
        self.uint64() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.uint64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), RandError> {
        self.fill_bytes(dest);
        Ok(())
    }
}
