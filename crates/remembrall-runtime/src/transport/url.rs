//! Relay URL normalization.
//!
//! Relay URLs arrive from user configuration and from events in many
//! cosmetically different spellings. Subscriptions are deduplicated by a
//! fingerprint over their relay set, so the same relay must always normalize
//! to the same string:
//!
//! - scheme and host are lowercased
//! - trailing slashes are removed
//! - default ports are dropped (`:443` for `wss`, `:80` for `ws`)
//! - paths are preserved
//!
//! Only websocket schemes (`wss://`, `ws://`) are accepted.

use std::fmt;

use remembrall_core::{Error, Result};

/// A normalized relay URL.
///
/// Construction via [`RelayUrl::parse`] is the only way to obtain one, so
/// two `RelayUrl`s compare equal iff they denote the same relay endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelayUrl(String);

impl RelayUrl {
    /// Parse and normalize a relay URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRelayUrl`] if the scheme is not `wss`/`ws`
    /// or the host is missing.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();

        let (scheme, rest) = match split_scheme(trimmed) {
            Some(parts) => parts,
            None => {
                return Err(Error::InvalidRelayUrl {
                    url: input.to_string(),
                    reason: "scheme must be wss:// or ws://".to_string(),
                });
            }
        };

        let (host, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, ""),
        };

        if host.is_empty() {
            return Err(Error::InvalidRelayUrl {
                url: input.to_string(),
                reason: "empty host".to_string(),
            });
        }

        let mut host = host.to_ascii_lowercase();

        // Drop the default port for the scheme
        let default_port = if scheme == "wss" { ":443" } else { ":80" };
        if let Some(stripped) = host.strip_suffix(default_port) {
            // Keep IPv6 literals intact: [::1]:443 strips cleanly too
            host = stripped.to_string();
        }

        let mut normalized = format!("{}://{}{}", scheme, host, path);
        while normalized.ends_with('/') {
            normalized.pop();
        }

        Ok(Self(normalized))
    }

    /// The normalized URL string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for RelayUrl {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

/// Split off a websocket scheme, case-insensitively.
fn split_scheme(url: &str) -> Option<(&'static str, &str)> {
    let lower = url.get(..6).map(str::to_ascii_lowercase);
    if lower.as_deref() == Some("wss://") {
        return Some(("wss", &url[6..]));
    }
    let lower = url.get(..5).map(str::to_ascii_lowercase);
    if lower.as_deref() == Some("ws://") {
        return Some(("ws", &url[5..]));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_trailing_slash() {
        assert_eq!(
            RelayUrl::parse("wss://relay.example.com/").unwrap().as_str(),
            "wss://relay.example.com"
        );
        assert_eq!(
            RelayUrl::parse("wss://relay.example.com///").unwrap().as_str(),
            "wss://relay.example.com"
        );
    }

    #[test]
    fn test_normalize_case() {
        assert_eq!(
            RelayUrl::parse("WSS://Relay.Example.COM").unwrap().as_str(),
            "wss://relay.example.com"
        );
    }

    #[test]
    fn test_normalize_default_port() {
        assert_eq!(
            RelayUrl::parse("wss://relay.example.com:443").unwrap().as_str(),
            "wss://relay.example.com"
        );
        assert_eq!(
            RelayUrl::parse("ws://relay.example.com:80").unwrap().as_str(),
            "ws://relay.example.com"
        );
        // Non-default ports are preserved
        assert_eq!(
            RelayUrl::parse("wss://relay.example.com:8443").unwrap().as_str(),
            "wss://relay.example.com:8443"
        );
    }

    #[test]
    fn test_normalize_preserves_path() {
        assert_eq!(
            RelayUrl::parse("wss://relay.example.com/nostr/").unwrap().as_str(),
            "wss://relay.example.com/nostr"
        );
    }

    #[test]
    fn test_equivalent_spellings_compare_equal() {
        let a = RelayUrl::parse("wss://Relay.Damus.io/").unwrap();
        let b = RelayUrl::parse("wss://relay.damus.io:443").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_non_websocket_schemes() {
        assert!(RelayUrl::parse("https://relay.example.com").is_err());
        assert!(RelayUrl::parse("relay.example.com").is_err());
        assert!(RelayUrl::parse("").is_err());
    }

    #[test]
    fn test_rejects_empty_host() {
        assert!(RelayUrl::parse("wss://").is_err());
        assert!(RelayUrl::parse("wss:///path").is_err());
    }
}
