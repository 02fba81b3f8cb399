//! Tokens issued to remote nodes and verified on announce and put.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::trace;

type HmacSha256 = Hmac<Sha256>;

const SECRET_SIZE: usize = 32;

/// How many secrets remain valid at once: the current one and its
/// predecessor, so tokens survive exactly one rotation.
const MAX_SECRETS: usize = 2;

/// Generates and verifies address-bound tokens.
///
/// A token is `HMAC-SHA256(secret, "ip:port")`. Rotating prepends a fresh
/// secret and drops the eldest, so a previously issued token stays valid for
/// one more rotation period.
#[derive(Clone)]
pub(crate) struct TokenStore {
    /// Newest first.
    secrets: Vec<[u8; SECRET_SIZE]>,
}

impl Debug for TokenStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "TokenStore({} secrets)", self.secrets.len())
    }
}

impl TokenStore {
    pub fn new() -> TokenStore {
        TokenStore {
            secrets: vec![random_secret()],
        }
    }

    /// Generate a token bound to `addr` under the current secret.
    pub fn generate(&self, addr: &SocketAddr) -> Vec<u8> {
        compute_token(&self.secrets[0], addr)
    }

    /// Verify a returned token against every live secret, in constant time.
    pub fn verify(&self, token: &[u8], addr: &SocketAddr) -> bool {
        let mut ok = false;
        for secret in &self.secrets {
            ok |= mac_for(secret, addr).verify_slice(token).is_ok();
        }
        ok
    }

    /// Rotate in a fresh secret. To be called periodically.
    pub fn cycle(&mut self) {
        trace!("cycling token secret");

        self.secrets.insert(0, random_secret());
        self.secrets.truncate(MAX_SECRETS);
    }
}

fn mac_for(secret: &[u8; SECRET_SIZE], addr: &SocketAddr) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(addr.to_string().as_bytes());
    mac
}

fn compute_token(secret: &[u8; SECRET_SIZE], addr: &SocketAddr) -> Vec<u8> {
    mac_for(secret, addr).finalize().into_bytes().to_vec()
}

fn random_secret() -> [u8; SECRET_SIZE] {
    let mut bytes = [0u8; SECRET_SIZE];
    getrandom::getrandom(&mut bytes).expect("getrandom");
    bytes
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr1() -> SocketAddr {
        "192.0.2.1:1234".parse().unwrap()
    }

    fn addr2() -> SocketAddr {
        "192.0.2.2:1234".parse().unwrap()
    }

    #[test]
    fn generated_tokens_verify() {
        let store = TokenStore::new();
        let token = store.generate(&addr1());

        assert!(store.verify(&token, &addr1()));
    }

    #[test]
    fn bit_flips_fail() {
        let store = TokenStore::new();
        let mut token = store.generate(&addr1());

        for i in 0..token.len() {
            for bit in 0..8 {
                token[i] ^= 1 << bit;
                assert!(!store.verify(&token, &addr1()));
                token[i] ^= 1 << bit;
            }
        }

        assert!(store.verify(&token, &addr1()));
    }

    #[test]
    fn tokens_are_address_bound() {
        let store = TokenStore::new();
        let token = store.generate(&addr1());

        assert!(!store.verify(&token, &addr2()));
    }

    #[test]
    fn survives_one_cycle_not_two() {
        let mut store = TokenStore::new();
        let token = store.generate(&addr1());

        store.cycle();
        assert!(store.verify(&token, &addr1()));

        let newer = store.generate(&addr2());

        store.cycle();
        assert!(!store.verify(&token, &addr1()));
        assert!(store.verify(&newer, &addr2()));
    }
}
