use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use rand::{RngCore, rng};

/// Shared secret gating access to the context service.
///
/// Authentication only: the bridge is not encrypted.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(Arc<str>);

impl SharedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Arc::from(secret.into()))
    }

    /// 32 random bytes, hex encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rng().fill_bytes(&mut bytes);
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        Self::new(hex)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Compares without short-circuiting on the first differing byte.
    pub fn verify(&self, candidate: &str) -> bool {
        let a = self.0.as_bytes();
        let b = candidate.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl Debug for SharedSecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str("SharedSecret(****)")
    }
}
