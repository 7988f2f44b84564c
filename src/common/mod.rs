use hmac::Hmac;
use sha2::Sha256;

pub mod buffer;
pub mod ct;
pub mod drbg;
pub mod mac;
pub mod probdist;
pub mod uniform_dh;

pub use buffer::SecureBuffer;

pub(crate) type HmacSha256 = Hmac<Sha256>;
