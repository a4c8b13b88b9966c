//! User accounts and the login challenge digest.
//!
//! Login is a two-step exchange: `Login` issues a session id and a random
//! challenge, `Authenticate` presents a keyed digest over the credentials.
//! The digest is HMAC-SHA-256 keyed with the password over
//! `password ‖ challenge ‖ password ‖ session`, truncated to the first
//! 8 bytes as a big-endian `i64`.

use crate::config::Settings;
use crate::error::{MediatorError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// The authenticated identity bound to a session.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LoginUser {
    pub login: String,
    pub roles: Vec<String>,
    pub is_module: bool,
}

#[derive(Debug, Clone)]
struct Account {
    password: String,
    roles: Vec<String>,
    is_module: bool,
}

/// Account table built from configuration: declared users plus one module
/// account per module that carries a password (loopback logins).
pub struct AuthManager {
    accounts: HashMap<String, Account>,
}

impl AuthManager {
    pub fn from_settings(settings: &Settings) -> AuthManager {
        let mut accounts = HashMap::new();
        for u in &settings.users {
            accounts.insert(
                u.login.clone(),
                Account {
                    password: u.password.clone(),
                    roles: u.roles.clone(),
                    is_module: false,
                },
            );
        }
        for m in &settings.modules {
            if !m.password.is_empty() {
                accounts.insert(
                    m.id.clone(),
                    Account {
                        password: m.password.clone(),
                        roles: Vec::new(),
                        is_module: true,
                    },
                );
            }
        }
        AuthManager { accounts }
    }

    /// Random challenge for a fresh login attempt.
    pub fn issue_challenge() -> i64 {
        rand::random::<i64>()
    }

    /// The digest a client must present for `Authenticate`.
    pub fn compute_digest(password: &str, challenge: i64, session: &str) -> i64 {
        let mut mac = HmacSha256::new_from_slice(password.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(password.as_bytes());
        mac.update(challenge.to_string().as_bytes());
        mac.update(password.as_bytes());
        mac.update(session.as_bytes());
        let bytes = mac.finalize().into_bytes();
        let mut first = [0u8; 8];
        first.copy_from_slice(&bytes[..8]);
        i64::from_be_bytes(first)
    }

    /// Checks a login exists and whether it is a module account.
    pub fn lookup(&self, login: &str, is_module: bool) -> Result<()> {
        match self.accounts.get(login) {
            Some(acc) if acc.is_module == is_module => Ok(()),
            _ => Err(MediatorError::Auth(format!("unknown login '{login}'"))),
        }
    }

    /// Verifies the digest for a pending session and returns the identity.
    pub fn verify(
        &self,
        login: &str,
        challenge: i64,
        session: &str,
        hash: i64,
    ) -> Result<LoginUser> {
        let account = self
            .accounts
            .get(login)
            .ok_or_else(|| MediatorError::Auth(format!("unknown login '{login}'")))?;

        let expected = Self::compute_digest(&account.password, challenge, session);
        if expected != hash {
            return Err(MediatorError::Auth("digest mismatch".to_string()));
        }
        Ok(LoginUser {
            login: login.to_string(),
            roles: account.roles.clone(),
            is_module: account.is_module,
        })
    }
}
