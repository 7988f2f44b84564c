//! Per-connection arguments carried in the SOCKS5 credential fields.
//!
//! Tor hands transport arguments through the username/password sub
//! negotiation as `key=value` pairs separated by semicolons:
//! `password=<20 ASCII bytes>` is the bridge's shared secret and is
//! mandatory; `sessticket=<224 hex chars>` is an optional session ticket.

use crate::common::SecureBuffer;
use crate::{Error, Result};

pub const SHARED_SECRET_LENGTH: usize = 20;
pub const TICKET_LENGTH: usize = 112;

#[derive(Debug)]
pub struct SsParams {
    pub(crate) shared_secret: SecureBuffer,
    pub(crate) ticket: Option<SecureBuffer>,
}

impl SsParams {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut shared_secret = None;
        let mut ticket = None;

        for field in raw.split(';') {
            let Some((key, value)) = field.split_once('=') else {
                return Err(Error::Params(format!("malformed argument '{field}'")));
            };
            match key {
                "password" => {
                    if value.len() != SHARED_SECRET_LENGTH || !value.is_ascii() {
                        return Err(Error::Params(format!(
                            "password must be {SHARED_SECRET_LENGTH} ASCII bytes"
                        )));
                    }
                    shared_secret = Some(SecureBuffer::from_slice(value.as_bytes()));
                }
                "sessticket" => {
                    let bytes = hex::decode(value)?;
                    if bytes.len() != TICKET_LENGTH {
                        return Err(Error::Params(format!(
                            "session ticket must be {TICKET_LENGTH} bytes, got {}",
                            bytes.len()
                        )));
                    }
                    ticket = Some(SecureBuffer::from(bytes));
                }
                _ => return Err(Error::Params(format!("unknown argument '{key}'"))),
            }
        }

        let shared_secret = shared_secret
            .ok_or_else(|| Error::Params("missing mandatory 'password' argument".to_string()))?;

        Ok(SsParams {
            shared_secret,
            ticket,
        })
    }
}
