//! Password hashing port.

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
#[error("failed to hash password: {0}")]
pub struct HashError(pub String);

/// Hash and verify operator secrets.
///
/// Both calls are CPU bound; callers run them on a blocking worker.
pub trait PasswordHasher: Send + Sync + std::fmt::Debug {
    fn hash(&self, secret: &str) -> Result<String, HashError>;

    /// Returns false for a mismatch and for a digest that cannot be parsed.
    fn verify(&self, digest: &str, secret: &str) -> bool;
}

/// bcrypt implementation.
#[derive(Debug, Clone, Copy)]
pub struct BcryptHasher {
    cost: u32,
}

impl BcryptHasher {
    pub fn new(cost: u32) -> Self {
        Self {
            // bcrypt rejects costs outside 4..=31
            cost: cost.clamp(4, 31),
        }
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }
}

impl Default for BcryptHasher {
    fn default() -> Self {
        // Use a lower cost factor for development speed
        let cost = if cfg!(debug_assertions) {
            4
        } else {
            bcrypt::DEFAULT_COST
        };
        Self::new(cost)
    }
}

impl PasswordHasher for BcryptHasher {
    fn hash(&self, secret: &str) -> Result<String, HashError> {
        bcrypt::hash(secret, self.cost).map_err(|e| HashError(e.to_string()))
    }

    fn verify(&self, digest: &str, secret: &str) -> bool {
        match bcrypt::verify(secret, digest) {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "stored password digest is not a valid bcrypt hash");
                false
            }
        }
    }
}
