//! SFTP credential verification
//!
//! A single shared secret guards every login; the username is only carried
//! along for diagnostics.

use subtle::ConstantTimeEq;

use crate::error::AuthError;

/// Answers whether a claimed identity may log in. Called concurrently from
/// every handshake in flight.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, user: &str, password: &str) -> Result<(), AuthError>;
}

pub struct SharedSecret {
    secret: String,
}

impl SharedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl CredentialVerifier for SharedSecret {
    fn verify(&self, user: &str, password: &str) -> Result<(), AuthError> {
        let matches: bool = password.as_bytes().ct_eq(self.secret.as_bytes()).into();
        if matches {
            Ok(())
        } else {
            Err(AuthError::Rejected {
                user: user.to_string(),
            })
        }
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}
