use std::io;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use zvnet_core::login::{signing_digest, LoginRecord, PK_SIZE, SIGN_SIZE};

use super::{LoginSigner, LoginVerifier};

/// Signs logins with an ed25519 key.
///
/// The 32-byte public key and 64-byte signature are stored at the front of the
/// 65-byte record fields, followed by a zero byte.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
        }
    }
    pub fn public_key(&self) -> [u8; PK_SIZE] {
        let mut pk = [0u8; PK_SIZE];
        pk[..32].copy_from_slice(self.key.verifying_key().as_bytes());
        pk
    }
}

impl LoginSigner for Ed25519Signer {
    fn sign_login(&self, id: u64, cur_time: u64) -> io::Result<LoginRecord> {
        let signature = self.key.sign(&signing_digest(id, cur_time));
        let mut sign = [0u8; SIGN_SIZE];
        sign[..64].copy_from_slice(&signature.to_bytes());
        Ok(LoginRecord::new(id, cur_time, self.public_key(), sign))
    }
}

#[derive(Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl LoginVerifier for Ed25519Verifier {
    fn verify(
        &self,
        public_key: &[u8; PK_SIZE],
        digest: &[u8; 32],
        signature: &[u8; SIGN_SIZE],
    ) -> bool {
        if public_key[32..].iter().any(|v| *v != 0) || signature[64] != 0 {
            return false;
        }
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&public_key[..32]);
        let Ok(key) = VerifyingKey::from_bytes(&pk) else {
            return false;
        };
        let mut sign = [0u8; 64];
        sign.copy_from_slice(&signature[..64]);
        key.verify_strict(digest, &Signature::from_bytes(&sign))
            .is_ok()
    }
}
