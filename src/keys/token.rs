//! Opaque key tokens.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Default prefix for generated tokens.
pub const DEFAULT_PREFIX: &str = "key_";

/// Generate a random opaque token.
///
/// Format: `<prefix><22-char URL-safe base64>` (128 bits of entropy). The
/// prefix makes tokens greppable and easy to spot in logs.
#[must_use]
pub fn generate(prefix: &str) -> String {
    let random_bytes: [u8; 16] = rand::random();
    format!("{prefix}{}", URL_SAFE_NO_PAD.encode(random_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_has_prefix_and_entropy() {
        let token = generate("TheBasement_");
        assert!(token.starts_with("TheBasement_"));
        assert_eq!(token.len(), "TheBasement_".len() + 22);
    }

    #[test]
    fn generated_tokens_differ() {
        assert_ne!(generate(DEFAULT_PREFIX), generate(DEFAULT_PREFIX));
    }
}
