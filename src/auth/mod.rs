use std::io;
use std::sync::Arc;

use thiserror::Error;
use zvnet_core::login::{LoginRecord, NodeIdentity, PK_SIZE, SIGN_SIZE};

#[cfg(feature = "ed25519")]
mod ed25519;
#[cfg(feature = "ed25519")]
pub use ed25519::{Ed25519Signer, Ed25519Verifier};

/// Produces signed login records. Key material stays with the implementor.
pub trait LoginSigner: Send + Sync {
    /// Returns a record for `id` and `cur_time` whose signature covers
    /// [`signing_digest(id, cur_time)`](zvnet_core::login::signing_digest).
    fn sign_login(&self, id: u64, cur_time: u64) -> io::Result<LoginRecord>;
}

/// Checks a signature over a login digest.
pub trait LoginVerifier: Send + Sync {
    fn verify(
        &self,
        public_key: &[u8; PK_SIZE],
        digest: &[u8; 32],
        signature: &[u8; SIGN_SIZE],
    ) -> bool;
}

impl<F> LoginSigner for F
where
    F: Fn(u64, u64) -> io::Result<LoginRecord> + Send + Sync,
{
    fn sign_login(&self, id: u64, cur_time: u64) -> io::Result<LoginRecord> {
        self(id, cur_time)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("login from our own id")]
    SelfLogin,
    #[error("expected peer {expected} but got {actual}")]
    IdMismatch { expected: u64, actual: u64 },
    #[error("login time {cur_time} outside the freshness window at {now}")]
    Stale { cur_time: u64, now: u64 },
    #[error("bad signature")]
    BadSignature,
}

/// Produces the local login and verifies remote ones.
#[derive(Clone)]
pub struct Authenticator {
    local_id: u64,
    signer: Arc<dyn LoginSigner>,
    verifier: Arc<dyn LoginVerifier>,
    freshness_window: u64,
}

impl Authenticator {
    pub fn new(
        local_id: u64,
        signer: Arc<dyn LoginSigner>,
        verifier: Arc<dyn LoginVerifier>,
        freshness_window: u64,
    ) -> Self {
        Self {
            local_id,
            signer,
            verifier,
            freshness_window,
        }
    }
    pub fn local_id(&self) -> u64 {
        self.local_id
    }
    /// Asks the signer for a fresh record stamped `now_secs`.
    pub fn local_login(&self, now_secs: u64) -> io::Result<LoginRecord> {
        let record = self.signer.sign_login(self.local_id, now_secs)?;
        if record.id != self.local_id || record.cur_time != now_secs {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "signer returned a record for another id or time",
            ));
        }
        Ok(record)
    }
    /// Verifies a remote record. `expected` is the peer id an outbound attempt
    /// was made to, `None` for inbound logins.
    pub fn verify(
        &self,
        record: &LoginRecord,
        now_secs: u64,
        expected: Option<u64>,
    ) -> Result<NodeIdentity, AuthError> {
        if record.id == self.local_id {
            return Err(AuthError::SelfLogin);
        }
        if let Some(expected) = expected {
            if expected != record.id {
                return Err(AuthError::IdMismatch {
                    expected,
                    actual: record.id,
                });
            }
        }
        if !record.is_fresh(now_secs, self.freshness_window) {
            return Err(AuthError::Stale {
                cur_time: record.cur_time,
                now: now_secs,
            });
        }
        if !self
            .verifier
            .verify(&record.public_key, &record.digest(), &record.signature)
        {
            return Err(AuthError::BadSignature);
        }
        Ok(record.identity())
    }
}

/// Keyed-hash stand-in for a real signature scheme, used by tests.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    pub fn key_of(id: u64) -> [u8; PK_SIZE] {
        let mut pk = [0u8; PK_SIZE];
        pk[..8].copy_from_slice(&id.to_le_bytes());
        pk
    }

    fn mac(public_key: &[u8; PK_SIZE], digest: &[u8; 32]) -> [u8; SIGN_SIZE] {
        let mut sign = [0u8; SIGN_SIZE];
        for (i, v) in sign.iter_mut().enumerate() {
            *v = digest[i % 32] ^ public_key[i % 8];
        }
        sign
    }

    pub struct FakeSigner;

    impl LoginSigner for FakeSigner {
        fn sign_login(&self, id: u64, cur_time: u64) -> io::Result<LoginRecord> {
            let pk = key_of(id);
            let digest = zvnet_core::login::signing_digest(id, cur_time);
            Ok(LoginRecord::new(id, cur_time, pk, mac(&pk, &digest)))
        }
    }

    pub struct FakeVerifier;

    impl LoginVerifier for FakeVerifier {
        fn verify(
            &self,
            public_key: &[u8; PK_SIZE],
            digest: &[u8; 32],
            signature: &[u8; SIGN_SIZE],
        ) -> bool {
            &mac(public_key, digest) == signature
        }
    }

    pub fn authenticator(id: u64) -> Authenticator {
        Authenticator::new(id, Arc::new(FakeSigner), Arc::new(FakeVerifier), 300)
    }
}

#[cfg(test)]
mod test {
    use super::fake::*;
    use super::*;

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn accepts_fresh_signed_login() {
        let a = authenticator(1);
        let b = authenticator(2);
        let login = a.local_login(NOW).unwrap();
        let identity = b.verify(&login, NOW + 10, Some(1)).unwrap();
        assert_eq!(identity.id, 1);
        assert_eq!(identity.public_key, key_of(1));
        assert!(b.verify(&login, NOW, None).is_ok());
    }

    #[test]
    fn freshness_window_is_inclusive() {
        let a = authenticator(1);
        let b = authenticator(2);
        let login = a.local_login(NOW).unwrap();
        assert!(b.verify(&login, NOW + 300, None).is_ok());
        assert!(b.verify(&login, NOW - 300, None).is_ok());
        assert_eq!(
            b.verify(&login, NOW + 301, None),
            Err(AuthError::Stale {
                cur_time: NOW,
                now: NOW + 301
            })
        );
    }

    #[test]
    fn tampered_fields_fail() {
        let a = authenticator(1);
        let b = authenticator(2);
        let login = a.local_login(NOW).unwrap();

        let mut forged = login.clone();
        forged.cur_time += 1;
        assert_eq!(b.verify(&forged, NOW, None), Err(AuthError::BadSignature));

        let mut forged = login.clone();
        forged.id = 3;
        assert_eq!(b.verify(&forged, NOW, None), Err(AuthError::BadSignature));

        let mut forged = login.clone();
        forged.signature[5] ^= 1;
        assert_eq!(b.verify(&forged, NOW, None), Err(AuthError::BadSignature));
    }

    #[test]
    fn identity_checks() {
        let a = authenticator(1);
        let login = a.local_login(NOW).unwrap();
        assert_eq!(a.verify(&login, NOW, None), Err(AuthError::SelfLogin));
        let b = authenticator(2);
        assert_eq!(
            b.verify(&login, NOW, Some(9)),
            Err(AuthError::IdMismatch {
                expected: 9,
                actual: 1
            })
        );
    }

    #[test]
    fn closure_signer_must_match_request() {
        let signer = |id: u64, _cur_time: u64| -> io::Result<LoginRecord> {
            Ok(LoginRecord::new(id, 1, [0; PK_SIZE], [0; SIGN_SIZE]))
        };
        let auth = Authenticator::new(1, Arc::new(signer), Arc::new(FakeVerifier), 300);
        assert!(auth.local_login(NOW).is_err());
    }
}
