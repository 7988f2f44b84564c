//! Byte container for key material that is zeroed before release.

use std::fmt;
use std::ops::{Deref, DerefMut};

use zeroize::{Zeroize, ZeroizeOnDrop};

/// A growable byte buffer whose backing storage is wiped when dropped.
///
/// Seeds, shared secrets, and derived key blocks live in one of these for
/// their whole lifetime; copying the contents into a plain `Vec<u8>` defeats
/// the point and is not provided.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecureBuffer(Vec<u8>);

impl SecureBuffer {
    pub fn new(len: usize) -> Self {
        Self(vec![0u8; len])
    }

    /// Draws `len` bytes from the system entropy source.
    pub fn from_entropy(len: usize) -> Result<Self, getrandom::Error> {
        let mut buf = Self::new(len);
        getrandom::getrandom(&mut buf.0)?;
        Ok(buf)
    }

    pub fn from_slice(b: &[u8]) -> Self {
        Self(b.to_vec())
    }

    /// Concatenate two buffers into a fresh one.
    pub fn concat(&self, other: &[u8]) -> Self {
        let mut out = Vec::with_capacity(self.0.len() + other.len());
        out.extend_from_slice(&self.0);
        out.extend_from_slice(other);
        Self(out)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Deref for SecureBuffer {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SecureBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl AsRef<[u8]> for SecureBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for SecureBuffer {
    fn from(mut v: Vec<u8>) -> Self {
        let out = Self(v.clone());
        v.zeroize();
        out
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SecureBuffer")
            .field(&format!("{}B", self.0.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_wiped() {
        let mut buf = SecureBuffer::from_slice(&[0xa5u8; 32]);
        assert!(buf.iter().all(|&b| b == 0xa5));

        // Zeroize clears the contents and truncates; drop runs the same wipe.
        buf.zeroize();
        assert!(buf.is_empty());
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn concat() {
        let a = SecureBuffer::from_slice(b"0123");
        let b = a.concat(b"4567");
        assert_eq!(&b[..], b"01234567");
    }

    #[test]
    fn from_entropy() {
        let a = SecureBuffer::from_entropy(16).unwrap();
        let b = SecureBuffer::from_entropy(16).unwrap();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
