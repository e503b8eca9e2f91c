//! Fixed-layout login record exchanged during the session handshake.
//!
//! The record is packed without padding and uses little-endian integers so that
//! it is byte-for-byte identical to the packed C struct used by compatible peers:
//!
//! ```text
//!  0        8        16                 81                 146
//!  +--------+--------+------------------+------------------+
//!  |   id   |cur_time|  public key (65) |  signature (65)  |
//!  +--------+--------+------------------+------------------+
//! ```
//!
//! # Examples
//!
//! ```rust
//! use zvnet_core::login::{LoginRecord, LOGIN_LEN, PK_SIZE, SIGN_SIZE};
//!
//! let record = LoginRecord::new(7, 1_700_000_000, [1; PK_SIZE], [2; SIGN_SIZE]);
//! let bytes = record.to_bytes();
//! assert_eq!(bytes.len(), LOGIN_LEN);
//! assert_eq!(LoginRecord::decode(&bytes).unwrap(), record);
//! ```

use crate::error::{Error, Result};
use bytes::BufMut;
use sha2::{Digest, Sha256};
use std::fmt;

pub const PK_SIZE: usize = 65;
pub const SIGN_SIZE: usize = 65;
pub const LOGIN_LEN: usize = 8 + 8 + PK_SIZE + SIGN_SIZE;

/// Domain tag prefixed to every signed login digest. Bump the suffix when the
/// signed fields change.
pub const LOGIN_DOMAIN: &[u8] = b"zvnet-login-v1";

/// Identity of a node as proven by a verified login.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct NodeIdentity {
    pub id: u64,
    pub public_key: [u8; PK_SIZE],
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("id", &self.id)
            .field("public_key", &hex_prefix(&self.public_key))
            .finish()
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct LoginRecord {
    pub id: u64,
    pub cur_time: u64,
    pub public_key: [u8; PK_SIZE],
    pub signature: [u8; SIGN_SIZE],
}

impl LoginRecord {
    pub fn new(
        id: u64,
        cur_time: u64,
        public_key: [u8; PK_SIZE],
        signature: [u8; SIGN_SIZE],
    ) -> Self {
        Self {
            id,
            cur_time,
            public_key,
            signature,
        }
    }
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.id);
        buf.put_u64_le(self.cur_time);
        buf.put_slice(&self.public_key);
        buf.put_slice(&self.signature);
    }
    pub fn to_bytes(&self) -> [u8; LOGIN_LEN] {
        let mut out = [0u8; LOGIN_LEN];
        self.encode(&mut &mut out[..]);
        out
    }
    /// Decodes a record from the first [`LOGIN_LEN`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < LOGIN_LEN {
            return Err(Error::Truncated {
                len: buf.len(),
                required: LOGIN_LEN,
            });
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[0..8]);
        let mut cur_time = [0u8; 8];
        cur_time.copy_from_slice(&buf[8..16]);
        let mut public_key = [0u8; PK_SIZE];
        public_key.copy_from_slice(&buf[16..16 + PK_SIZE]);
        let mut signature = [0u8; SIGN_SIZE];
        signature.copy_from_slice(&buf[16 + PK_SIZE..LOGIN_LEN]);
        Ok(Self {
            id: u64::from_le_bytes(id),
            cur_time: u64::from_le_bytes(cur_time),
            public_key,
            signature,
        })
    }
    /// The digest the signature of this record must cover.
    pub fn digest(&self) -> [u8; 32] {
        signing_digest(self.id, self.cur_time)
    }
    /// Whether `cur_time` lies within `window_secs` of `now_secs`, in either direction.
    pub fn is_fresh(&self, now_secs: u64, window_secs: u64) -> bool {
        now_secs.abs_diff(self.cur_time) <= window_secs
    }
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            id: self.id,
            public_key: self.public_key,
        }
    }
}

impl fmt::Debug for LoginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRecord")
            .field("id", &self.id)
            .field("cur_time", &self.cur_time)
            .field("public_key", &hex_prefix(&self.public_key))
            .finish_non_exhaustive()
    }
}

/// `SHA-256(LOGIN_DOMAIN || id || cur_time)`, integers big-endian.
pub fn signing_digest(id: u64, cur_time: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(LOGIN_DOMAIN);
    hasher.update(id.to_be_bytes());
    hasher.update(cur_time.to_be_bytes());
    hasher.finalize().into()
}

fn hex_prefix(buf: &[u8]) -> String {
    buf.iter().take(6).map(|b| format!("{b:02x}")).collect()
}
