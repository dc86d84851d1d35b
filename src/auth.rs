//! Login authenticator.
//!
//! `spec.md` treats the login function as an external collaborator and
//! only specifies its shape: a 16-octet authenticator derived from
//! `(password, seed)`, described as "HMAC-style". Realized here as
//! HMAC-SHA256(password, seed as big-endian u32) truncated to 16 octets.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const LOGIN_HASH_LEN: usize = 16;

/// Compute the expected 16-octet login authenticator for `seed` under
/// `password`.
pub fn login_hash(password: &str, seed: u32) -> [u8; LOGIN_HASH_LEN] {
    let mut mac =
        HmacSha256::new_from_slice(password.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(&seed.to_be_bytes());
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; LOGIN_HASH_LEN];
    out.copy_from_slice(&full[..LOGIN_HASH_LEN]);
    out
}

/// Constant-time comparison of a client-submitted authenticator against the
/// expected one.
pub fn verify(password: &str, seed: u32, submitted: &[u8]) -> bool {
    if submitted.len() < LOGIN_HASH_LEN {
        return false;
    }
    let expected = login_hash(password, seed);
    let mut diff = 0u8;
    for (a, b) in expected.iter().zip(submitted[..LOGIN_HASH_LEN].iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_hash_identically() {
        assert_eq!(login_hash("hunter2", 42), login_hash("hunter2", 42));
    }

    #[test]
    fn different_seed_changes_hash() {
        assert_ne!(login_hash("hunter2", 42), login_hash("hunter2", 43));
    }

    #[test]
    fn verify_accepts_correct_authenticator() {
        let hash = login_hash("hunter2", 1234);
        assert!(verify("hunter2", 1234, &hash));
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let hash = login_hash("hunter2", 1234);
        assert!(!verify("wrong", 1234, &hash));
    }

    #[test]
    fn verify_rejects_short_input() {
        assert!(!verify("hunter2", 1234, &[0u8; 4]));
    }
}
