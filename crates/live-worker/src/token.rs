//! Request token encoding.
//!
//! A request token is the request path: `"/" + base64url(payload || tag)`
//! where `payload` is an `&`-separated query such as `channel=<rid>&rate=hd`
//! and `tag` is the HMAC-SHA256 of the payload under the service key.
//!
//! The pool only needs [`TokenCodec::decode`]. Encoding is provided for
//! issuing tokens and for tests.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use common::secret::{secret_bytes, ExposeSecret, SecretString};
use ring::hmac;

/// Length of the HMAC-SHA256 tag appended to the payload.
const TAG_LEN: usize = 32;

/// Query field carrying the resource id.
const CHANNEL_FIELD: &str = "channel=";

/// Decodes caller request tokens into resource ids.
pub trait TokenCodec: Send + Sync {
    /// Returns the resource id, or `None` if the token is corrupt, forged or
    /// carries no channel.
    fn decode(&self, token: &str) -> Option<String>;
}

/// HMAC-keyed token codec.
pub struct KeyedTokenCodec {
    key: hmac::Key,
}

impl KeyedTokenCodec {
    /// Build a codec from the configured key.
    #[must_use]
    pub fn new(secret: &SecretString) -> Self {
        let bytes = secret_bytes(secret);
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, bytes.expose_secret()),
        }
    }

    /// Issue a token for `resource_id` with no extra query fields.
    #[must_use]
    pub fn encode(&self, resource_id: &str) -> String {
        self.encode_query(&format!("{CHANNEL_FIELD}{resource_id}"))
    }

    /// Issue a token for an arbitrary query payload.
    #[must_use]
    pub fn encode_query(&self, payload: &str) -> String {
        let tag = hmac::sign(&self.key, payload.as_bytes());
        let mut raw = Vec::with_capacity(payload.len() + TAG_LEN);
        raw.extend_from_slice(payload.as_bytes());
        raw.extend_from_slice(tag.as_ref());
        format!("/{}", URL_SAFE_NO_PAD.encode(raw))
    }
}

impl std::fmt::Debug for KeyedTokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedTokenCodec")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl TokenCodec for KeyedTokenCodec {
    fn decode(&self, token: &str) -> Option<String> {
        // The first character is the path separator
        let mut chars = token.chars();
        chars.next()?;
        let raw = URL_SAFE_NO_PAD.decode(chars.as_str()).ok()?;

        let payload_len = raw.len().checked_sub(TAG_LEN)?;
        let (payload, tag) = raw.split_at(payload_len);
        hmac::verify(&self.key, payload, tag).ok()?;

        let query = std::str::from_utf8(payload).ok()?;
        query
            .split('&')
            .find_map(|field| field.strip_prefix(CHANNEL_FIELD))
            .filter(|rid| !rid.is_empty())
            .map(str::to_string)
    }
}

/// Prefix the engine expects in front of a request token.
pub const ENGINE_URI_SCHEME: &str = "synacast:/";

/// Engine URI for a request token.
#[must_use]
pub fn engine_uri(token: &str) -> String {
    format!("{ENGINE_URI_SCHEME}{token}")
}

/// Request token inside an engine URI. Input without the scheme is
/// returned unchanged.
#[must_use]
pub fn token_from_engine_uri(uri: &str) -> &str {
    uri.strip_prefix(ENGINE_URI_SCHEME).unwrap_or(uri)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn codec() -> KeyedTokenCodec {
        KeyedTokenCodec::new(&SecretString::from("unit-test-key"))
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let codec = codec();
        let token = codec.encode("abc");

        assert!(token.starts_with('/'));
        assert_eq!(codec.decode(&token), Some("abc".to_string()));
    }

    #[test]
    fn test_decode_extracts_channel_from_query() {
        let codec = codec();
        let token = codec.encode_query("rate=hd&channel=cctv5&ft=1");

        assert_eq!(codec.decode(&token), Some("cctv5".to_string()));
    }

    #[test]
    fn test_decode_rejects_corrupted_token() {
        let codec = codec();
        let mut token = codec.encode("abc");
        // Flip the last character
        let last = token.pop().unwrap();
        token.push(if last == 'A' { 'B' } else { 'A' });

        assert_eq!(codec.decode(&token), None);
    }

    #[test]
    fn test_decode_rejects_truncated_token() {
        let codec = codec();
        let token = codec.encode("abc");

        assert_eq!(codec.decode(&token[..token.len() - 4]), None);
        assert_eq!(codec.decode("/"), None);
        assert_eq!(codec.decode(""), None);
    }

    #[test]
    fn test_decode_rejects_other_key() {
        let other = KeyedTokenCodec::new(&SecretString::from("another-key"));
        let token = other.encode("abc");

        assert_eq!(codec().decode(&token), None);
    }

    #[test]
    fn test_decode_rejects_empty_or_missing_channel() {
        let codec = codec();

        assert_eq!(codec.decode(&codec.encode("")), None);
        assert_eq!(codec.decode(&codec.encode_query("rate=hd")), None);
    }

    #[test]
    fn test_debug_hides_key() {
        assert!(!format!("{:?}", codec()).contains("unit-test-key"));
    }

    #[test]
    fn test_engine_uri() {
        assert_eq!(engine_uri("/YWJj"), "synacast://YWJj");
    }

    #[test]
    fn test_token_from_engine_uri() {
        let token = codec().encode("abc");
        assert_eq!(token_from_engine_uri(&engine_uri(&token)), token);
        assert_eq!(token_from_engine_uri(&token), token);
        assert_eq!(codec().decode(token_from_engine_uri(&engine_uri(&token))).as_deref(), Some("abc"));
    }
}
