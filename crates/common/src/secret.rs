//! Secret types for keeping key material out of logs.
//!
//! Re-exports the [`secrecy`] types used for the token signing key and any
//! other sensitive configuration. `SecretString` and `SecretBox<T>` redact
//! themselves in `Debug`, so a config struct that holds one can be logged
//! with `{:?}` without leaking the value. Both are zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct TokenSettings {
//!     issuer: String,
//!     key: SecretString,
//! }
//!
//! let settings = TokenSettings {
//!     issuer: "gateway".to_string(),
//!     key: SecretString::from("channel-key"),
//! };
//!
//! assert!(!format!("{settings:?}").contains("channel-key"));
//! assert_eq!(settings.key.expose_secret(), "channel-key");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Copy a secret string's bytes into a boxed secret, for APIs that take raw key material.
#[must_use]
pub fn secret_bytes(secret: &SecretString) -> SecretBox<Vec<u8>> {
    SecretBox::new(Box::new(secret.expose_secret().as_bytes().to_vec()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("pplive");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("pplive"));
    }

    #[test]
    fn test_secret_bytes_copies_value() {
        let secret = SecretString::from("channel-key");
        let bytes = secret_bytes(&secret);

        assert_eq!(bytes.expose_secret().as_slice(), b"channel-key");
        assert!(!format!("{bytes:?}").contains("channel"));
    }

    #[test]
    fn test_deserialize_keeps_value_hidden() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct KeyFile {
            name: String,
            key: SecretString,
        }

        let json = r#"{"name": "token", "key": "do-not-log"}"#;
        let file: KeyFile = serde_json::from_str(json).expect("deserialize");

        assert_eq!(file.key.expose_secret(), "do-not-log");
        assert!(!format!("{file:?}").contains("do-not-log"));
    }
}
