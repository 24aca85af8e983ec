//! Secret credentials for network providers.

use serde::{Deserialize, Deserializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A password held in a mutable buffer that is wiped on drop.
///
/// The secret is never printed by `Debug` and can be cleared early with
/// [`clear`](Self::clear) once it is no longer needed.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct Password {
    secret: String,
}

impl Password {
    /// Takes ownership of a password string.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Returns the secret for the duration of a login call.
    ///
    /// # Security
    ///
    /// Don't log, store, or clone the result.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.secret
    }

    /// Wipes the secret in place.
    pub fn clear(&mut self) {
        self.secret.zeroize();
    }

    /// Returns true if no secret is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secret.is_empty()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Password")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl<'de> Deserialize<'de> for Password {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Password::new)
    }
}
