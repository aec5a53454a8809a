//! OSC address validation and channel-address parsing.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{TransportError, TransportResult};

static VALID_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/[A-Za-z0-9/_-]*$").expect("address regex is valid"));

static CHANNEL_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/(?:channel|ch|cv)/([0-9]+)$").expect("channel regex is valid"));

/// Validate an OSC address against `^/[A-Za-z0-9/_-]*$`.
pub fn sanitize(address: &str) -> TransportResult<()> {
    if VALID_ADDRESS.is_match(address) {
        Ok(())
    } else {
        Err(TransportError::InvalidAddress(address.to_string()))
    }
}

/// Extract a 1-based channel number from `/channel/N`, `/ch/N`, or `/cv/N`.
/// Returns `None` if the address doesn't match any of those patterns, or if
/// `N` falls outside `[1, 8]`.
pub fn parse_channel_address(address: &str) -> Option<usize> {
    let captures = CHANNEL_ADDRESS.captures(address)?;
    let n: usize = captures.get(1)?.as_str().parse().ok()?;
    if (1..=8).contains(&n) {
        Some(n)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_addresses() {
        assert!(sanitize("/cv/1").is_ok());
        assert!(sanitize("/channel/8/level").is_ok());
    }

    #[test]
    fn rejects_addresses_without_leading_slash() {
        assert!(sanitize("cv/1").is_err());
    }

    #[test]
    fn rejects_disallowed_characters() {
        assert!(sanitize("/cv/1?query=true").is_err());
        assert!(sanitize("/cv 1").is_err());
    }

    #[test]
    fn parses_channel_address_variants() {
        assert_eq!(parse_channel_address("/channel/3"), Some(3));
        assert_eq!(parse_channel_address("/ch/8"), Some(8));
        assert_eq!(parse_channel_address("/cv/1"), Some(1));
    }

    #[test]
    fn rejects_out_of_range_channel() {
        assert_eq!(parse_channel_address("/ch/9"), None);
        assert_eq!(parse_channel_address("/ch/0"), None);
    }

    #[test]
    fn ignores_unrelated_addresses() {
        assert_eq!(parse_channel_address("/gate/1"), None);
    }
}
