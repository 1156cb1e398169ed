//! Method tokens accepted when mounting a route.
//!
//! Covers RFC 9110 standard methods, WebDAV extensions (RFC 4918 / 4791 / 3253 / 5323),
//! and `PURGE` used by nginx and Varnish for cache invalidation. Tokens are
//! case-insensitive at mount time; the short forms `del` and `opts` expand to
//! `DELETE` and `OPTIONS`.
//!
//! Anything else is rejected while the server is assembled, never at request time.

use http::Method;

use crate::error::ConfigError;

const KNOWN: &[&str] = &[
    // RFC 9110
    "CONNECT", "DELETE", "GET", "HEAD", "OPTIONS", "PATCH", "POST", "PUT", "TRACE",
    // WebDAV RFC 4918
    "COPY", "LOCK", "MKCOL", "MOVE", "PROPFIND", "PROPPATCH", "UNLOCK",
    // WebDAV extensions
    "MKCALENDAR", "REPORT", "SEARCH",
    // Cache invalidation
    "PURGE",
];

/// Expands aliases and validates a method token.
pub(crate) fn normalize(token: &str) -> Result<Method, ConfigError> {
    let upper = token.trim().to_ascii_uppercase();
    let canonical = match upper.as_str() {
        "DEL" => "DELETE",
        "OPTS" => "OPTIONS",
        other => other,
    };

    if !KNOWN.contains(&canonical) {
        return Err(ConfigError::InvalidMethod(token.to_owned()));
    }

    Method::from_bytes(canonical.as_bytes())
        .map_err(|_| ConfigError::InvalidMethod(token.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_aliases() {
        assert_eq!(normalize("del").unwrap(), Method::DELETE);
        assert_eq!(normalize("opts").unwrap(), Method::OPTIONS);
        assert_eq!(normalize(" get ").unwrap(), Method::GET);
    }

    #[test]
    fn keeps_webdav_and_purge() {
        assert_eq!(normalize("propfind").unwrap().as_str(), "PROPFIND");
        assert_eq!(normalize("PURGE").unwrap().as_str(), "PURGE");
    }

    #[test]
    fn rejects_unknown_tokens() {
        assert!(matches!(normalize("FETCH"), Err(ConfigError::InvalidMethod(t)) if t == "FETCH"));
        assert!(normalize("").is_err());
    }
}
