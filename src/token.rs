//! Write tokens.
//!
//! A token is handed out by `get_peers` / `get` and must be echoed by the
//! following `announce_peer` / `put` from the same IP. Tokens are never
//! stored: they are a keyed blake3 MAC over `ip || target` under a secret that
//! rotates periodically. Verification accepts the current and the previous
//! secret, so a token survives exactly one rotation.
//!
//! Tokens are bound to the requester IP only, not the port.

use std::net::IpAddr;

use constant_time_eq::constant_time_eq;

use crate::config::TOKEN_LEN;
use crate::id::NodeId;

pub type WriteToken = [u8; TOKEN_LEN];

pub struct TokenSecrets {
    current: [u8; 32],
    previous: [u8; 32],
}

impl TokenSecrets {
    pub fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    /// Replace the previous secret with the current one and draw a new current.
    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
    }

    pub fn generate(&self, ip: IpAddr, target: &NodeId) -> WriteToken {
        mac(&self.current, ip, target)
    }

    pub fn verify(&self, token: &[u8], ip: IpAddr, target: &NodeId) -> bool {
        if token.len() != TOKEN_LEN {
            return false;
        }
        // Both secrets are always checked so timing does not reveal which matched.
        let current = constant_time_eq(token, &mac(&self.current, ip, target));
        let previous = constant_time_eq(token, &mac(&self.previous, ip, target));
        current | previous
    }
}

impl Default for TokenSecrets {
    fn default() -> Self {
        Self::new()
    }
}

fn mac(secret: &[u8; 32], ip: IpAddr, target: &NodeId) -> WriteToken {
    let mut input = Vec::with_capacity(16 + 20);
    match ip {
        IpAddr::V4(v4) => input.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => input.extend_from_slice(&v6.octets()),
    }
    input.extend_from_slice(target.as_bytes());

    let digest = blake3::keyed_hash(secret, &input);
    let mut out = [0u8; TOKEN_LEN];
    out.copy_from_slice(&digest.as_bytes()[..TOKEN_LEN]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_survives_one_rotation_only() {
        let mut secrets = TokenSecrets::new();
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        let target = NodeId::random();
        let token = secrets.generate(ip, &target);

        assert!(secrets.verify(&token, ip, &target));
        secrets.rotate();
        assert!(secrets.verify(&token, ip, &target));
        secrets.rotate();
        assert!(!secrets.verify(&token, ip, &target));
    }

    #[test]
    fn token_is_bound_to_ip_and_target() {
        let secrets = TokenSecrets::new();
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        let other_ip: IpAddr = "10.1.2.4".parse().unwrap();
        let target = NodeId::random();
        let token = secrets.generate(ip, &target);

        assert!(!secrets.verify(&token, other_ip, &target));
        assert!(!secrets.verify(&token, ip, &NodeId::random()));
        assert!(!secrets.verify(&token[..4], ip, &target));
    }

    #[test]
    fn token_differing_in_last_byte_is_rejected() {
        let secrets = TokenSecrets::new();
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        let target = NodeId::random();
        let mut token = secrets.generate(ip, &target);
        token[TOKEN_LEN - 1] ^= 1;
        assert!(!secrets.verify(&token, ip, &target));

        let mut longer = secrets.generate(ip, &target).to_vec();
        longer.push(0);
        assert!(!secrets.verify(&longer, ip, &target));
    }
}
