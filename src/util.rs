//! Utility functions
use crate::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use url::Url;

/// Fixed-width UTC timestamp used for every persisted `created`/`updated`
/// column. Lexicographic order matches chronological order.
pub const TIMESTAMP_FMT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FMT).to_string()
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FMT)
        .map_err(|e| Error::key(format!("invalid timestamp {raw:?}: {e}")))?;

    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// Format suitable for the HTTP `Date` header.
pub fn http_date(ts: DateTime<Utc>) -> String {
    ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn host_from_uri(uri: &str) -> Result<String> {
    let parsed = Url::parse(uri).map_err(|_| Error::InvalidUri {
        uri: uri.to_owned(),
    })?;

    let host = parsed.host_str().ok_or_else(|| Error::InvalidUri {
        uri: uri.to_owned(),
    })?;

    Ok(host.to_owned())
}

/// Canonicalize a domain: accepts either a bare hostname or a URL and returns
/// the IDNA-normalized lowercase host.
pub fn normalize_domain(value: &str) -> Result<String> {
    if value.contains("://") {
        return host_from_uri(value);
    }

    host_from_uri(&format!("https://{value}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    #[test_case("https://example.com/actor", "example.com"; "simple url")]
    #[test_case("https://EXAMPLE.com/inbox", "example.com"; "uppercase host")]
    #[test_case("example.com", "example.com"; "bare domain")]
    #[test_case("MÜNCHEN.example", "xn--mnchen-3ya.example"; "idna host")]
    #[test]
    fn normalize_domain_works(value: &str, expected: &str) {
        assert_eq!(normalize_domain(value).unwrap(), expected);
    }

    #[test]
    fn timestamps_round_trip() {
        let now = Utc::now();
        let parsed = parse_timestamp(&format_timestamp(now)).unwrap();

        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn invalid_uri_is_an_error() {
        assert!(matches!(
            host_from_uri("not a uri"),
            Err(Error::InvalidUri { .. })
        ));
    }
}
