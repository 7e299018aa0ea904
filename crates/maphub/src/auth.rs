//! Challenge/response authentication.
//!
//! This is a cheating deterrent, not security: secrets are cleartext in the
//! password file by design. The server sends a random nonce and a client
//! proves it knows a secret by answering `base64(sha256(nonce || secret))`.

use std::collections::HashMap;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};

const CHALLENGE_BYTES: usize = 16;

/// Contents of the password file: a shared group secret, an optional GM
/// secret, and optional per-user secrets that override the group one.
#[derive(Debug, Clone, Deserialize)]
pub struct Passwords {
    pub group: String,
    #[serde(default)]
    pub gm: Option<String>,
    #[serde(default)]
    pub users: HashMap<String, String>,
}

impl Passwords {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Passwords> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading password file {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing password file {}", path.display()))
    }
}

/// Per-connection authentication state.
#[derive(Debug)]
pub struct Authenticator {
    secret: Vec<u8>,
    gm_secret: Option<Vec<u8>>,
    challenge: Vec<u8>,
    pub gm_mode: bool,
    pub username: String,
    pub client_ident: String,
}

impl Authenticator {
    pub fn new(passwords: &Passwords) -> Authenticator {
        Authenticator {
            secret: passwords.group.as_bytes().to_vec(),
            gm_secret: passwords.gm.as_ref().map(|s| s.as_bytes().to_vec()),
            challenge: Vec::new(),
            gm_mode: false,
            username: "<unknown>".into(),
            client_ident: "<unknown>".into(),
        }
    }

    /// Use a personal secret instead of the group one.
    pub fn set_secret(&mut self, secret: &str) {
        self.secret = secret.as_bytes().to_vec();
    }

    /// Fresh random nonce, returned in the form it goes on the wire.
    pub fn generate_challenge(&mut self) -> anyhow::Result<String> {
        let mut nonce = [0u8; CHALLENGE_BYTES];
        getrandom::getrandom(&mut nonce).context("generating auth challenge")?;
        self.challenge = nonce.to_vec();
        Ok(STANDARD.encode(nonce))
    }

    /// Check a client's response; a match against the GM secret flips the
    /// session into GM mode.
    pub fn validate_response(&mut self, response: &str) -> bool {
        if self.challenge.is_empty() {
            return false;
        }
        if let Some(gm) = &self.gm_secret {
            if response == expected_response(&self.challenge, gm) {
                self.gm_mode = true;
                return true;
            }
        }
        response == expected_response(&self.challenge, &self.secret)
    }
}

fn expected_response(challenge: &[u8], secret: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(challenge);
    h.update(secret);
    STANDARD.encode(h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    // what a client library would compute from the greeting
    fn client_response(challenge_b64: &str, secret: &str) -> String {
        let nonce = STANDARD.decode(challenge_b64).unwrap();
        expected_response(&nonce, secret.as_bytes())
    }

    fn passwords() -> Passwords {
        Passwords {
            group: "table-pass".into(),
            gm: Some("gm-pass".into()),
            users: HashMap::from([("alice".to_string(), "alice-pass".to_string())]),
        }
    }

    #[test]
    fn accepts_group_secret() {
        let mut auth = Authenticator::new(&passwords());
        let challenge = auth.generate_challenge().unwrap();
        let resp = client_response(&challenge, "table-pass");
        assert!(auth.validate_response(&resp));
        assert!(!auth.gm_mode);
    }

    #[test]
    fn gm_secret_grants_gm_mode() {
        let mut auth = Authenticator::new(&passwords());
        let challenge = auth.generate_challenge().unwrap();
        let resp = client_response(&challenge, "gm-pass");
        assert!(auth.validate_response(&resp));
        assert!(auth.gm_mode);
    }

    #[test]
    fn personal_secret_replaces_group() {
        let pw = passwords();
        let mut auth = Authenticator::new(&pw);
        auth.set_secret(&pw.users["alice"]);
        let challenge = auth.generate_challenge().unwrap();
        assert!(!auth.validate_response(&client_response(&challenge, "table-pass")));
        let challenge = auth.generate_challenge().unwrap();
        assert!(auth.validate_response(&client_response(&challenge, "alice-pass")));
    }

    #[test]
    fn rejects_wrong_and_replayed_responses() {
        let mut auth = Authenticator::new(&passwords());
        let challenge = auth.generate_challenge().unwrap();
        assert!(!auth.validate_response("garbage"));
        let old = client_response(&challenge, "table-pass");
        auth.generate_challenge().unwrap();
        assert!(!auth.validate_response(&old));
    }

    #[test]
    fn challenges_differ() {
        let mut auth = Authenticator::new(&passwords());
        let a = auth.generate_challenge().unwrap();
        let b = auth.generate_challenge().unwrap();
        assert_ne!(a, b);
    }
}
