//! Administrator capability.
//!
//! Administrative operations on [`KeyManager`](crate::keys::KeyManager) take
//! an [`AdminCapability`]. The only way to obtain one is to present the
//! configured shared secret to [`AdminToken::verify`], which keeps the
//! authentication check at the boundary and out of the core.

use std::fmt;

use subtle::ConstantTimeEq;

/// Proof that the caller presented the admin secret.
#[derive(Debug, Clone, Copy)]
pub struct AdminCapability {
    _private: (),
}

/// The configured admin secret.
#[derive(Clone)]
pub struct AdminToken {
    secret: String,
}

impl AdminToken {
    /// Wrap an already-resolved secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Check a presented secret.
    ///
    /// Comparison is constant-time to prevent timing side-channels.
    #[must_use]
    pub fn verify(&self, presented: &str) -> Option<AdminCapability> {
        if self.secret.is_empty() {
            return None;
        }
        let matches: bool = presented.as_bytes().ct_eq(self.secret.as_bytes()).into();
        matches.then_some(AdminCapability { _private: () })
    }

    /// The raw secret, e.g. to print an auto-generated one at startup.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for AdminToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminToken").field("secret", &"<redacted>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_secret_grants_capability() {
        let token = AdminToken::new("hunter2");
        assert!(token.verify("hunter2").is_some());
    }

    #[test]
    fn wrong_or_partial_secret_is_rejected() {
        let token = AdminToken::new("hunter2");
        assert!(token.verify("hunter").is_none());
        assert!(token.verify("hunter22").is_none());
        assert!(token.verify("").is_none());
    }

    #[test]
    fn empty_secret_never_matches() {
        let token = AdminToken::new("");
        assert!(token.verify("").is_none());
    }

    #[test]
    fn debug_output_hides_secret() {
        let token = AdminToken::new("hunter2");
        assert!(!format!("{token:?}").contains("hunter2"));
    }
}
