//! Composite document identifiers for time-and-key addressed documents.
//!
//! Documents in the pipeline are addressed by a key tuple and a time tuple
//! joined into a single URI-shaped identifier:
//!
//! - `tkuri(k, t)` = `t/<pad16(t)>/k/<k>` — time-major, used for input and
//!   error documents so range scans over a time window are contiguous
//! - `kturi(k, t)` = `k/<k>/t/<pad16(t)>` — key-major, used for output
//!   documents so the latest accumulator for a key is one descending scan
//!
//! `pad16` zero-pads the millisecond timestamp to 16 decimal digits, which
//! preserves numeric order under the lexicographic comparisons that store
//! range scans use. Key tuples may themselves be slash-joined.

use crate::error::{Error, Result};

/// Number of decimal digits in an encoded timestamp.
const TIME_DIGITS: usize = 16;

/// Zero-pads a millisecond timestamp to 16 decimal digits.
///
/// Padding makes lexicographic order agree with numeric order, which is
/// what `all_docs` range scans over encoded identifiers rely on. Times are
/// milliseconds since the Unix epoch and must be non-negative.
#[must_use]
pub fn pad16(time_ms: i64) -> String {
    format!("{time_ms:016}")
}

/// Encodes a time-then-key identifier: `t/<pad16(t)>/k/<k>`.
#[must_use]
pub fn tkuri(key: &str, time_ms: i64) -> String {
    format!("t/{}/k/{}", pad16(time_ms), key)
}

/// Encodes a key-then-time identifier: `k/<k>/t/<pad16(t)>`.
#[must_use]
pub fn kturi(key: &str, time_ms: i64) -> String {
    format!("k/{}/t/{}", key, pad16(time_ms))
}

/// Extracts the slash-joined key components of an encoded identifier.
///
/// Accepts both `tkuri` and `kturi` forms. Identifiers whose key part is
/// empty (such as the bare `t/<pad16>` bounds used by time-window scans)
/// yield an empty string.
///
/// # Errors
///
/// Returns [`Error::InvalidId`] when the identifier matches neither form.
pub fn key_of(id: &str) -> Result<String> {
    if let Some(rest) = id.strip_prefix("t/") {
        // t/<pad16>/k/<key...> or a bare t/<pad16> scan bound.
        return match rest.split_once("/k/") {
            Some((_, key)) => Ok(key.to_string()),
            None => Ok(String::new()),
        };
    }
    if let Some(rest) = id.strip_prefix("k/") {
        // k/<key...>/t/<pad16>: the time tuple is the final /t/ segment.
        return match rest.rsplit_once("/t/") {
            Some((key, _)) => Ok(key.to_string()),
            None => Ok(rest.to_string()),
        };
    }
    Err(Error::invalid_id(format!(
        "expected t/ or k/ prefixed identifier, got '{id}'"
    )))
}

/// Extracts the encoded time of an identifier as milliseconds.
///
/// Accepts both `tkuri` and `kturi` forms, tolerating a trailing suffix
/// after the digits (range-scan bounds append a `ZZZ` sentinel to the
/// encoded time).
///
/// # Errors
///
/// Returns [`Error::InvalidId`] when no time component can be parsed.
pub fn time_of(id: &str) -> Result<i64> {
    let encoded = if let Some(rest) = id.strip_prefix("t/") {
        rest.split('/').next().unwrap_or(rest)
    } else if let Some(rest) = id.strip_prefix("k/") {
        match rest.rsplit_once("/t/") {
            Some((_, time)) => time,
            None => {
                return Err(Error::invalid_id(format!(
                    "identifier '{id}' has no time component"
                )));
            }
        }
    } else {
        return Err(Error::invalid_id(format!(
            "expected t/ or k/ prefixed identifier, got '{id}'"
        )));
    };

    let digits: String = encoded.chars().take(TIME_DIGITS).collect();
    if digits.len() != TIME_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::invalid_id(format!(
            "identifier '{id}' has a malformed time component '{encoded}'"
        )));
    }
    digits.parse::<i64>().map_err(|e| {
        Error::invalid_id(format!("identifier '{id}' time overflows: {e}"))
    })
}

/// Decodes an identifier into its `(key, time)` pair.
///
/// # Errors
///
/// Returns [`Error::InvalidId`] when the identifier matches neither the
/// `tkuri` nor the `kturi` form.
pub fn decode(id: &str) -> Result<(String, i64)> {
    Ok((key_of(id)?, time_of(id)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad16_is_sixteen_digits() {
        assert_eq!(pad16(0), "0000000000000000");
        assert_eq!(pad16(1_700_000_000_000), "0001700000000000");
    }

    #[test]
    fn pad16_preserves_numeric_order() {
        let times = [0, 1, 9, 10, 99, 1_000, 1_699_999_999_999, 1_700_000_000_000];
        for pair in times.windows(2) {
            assert!(pad16(pair[0]) < pad16(pair[1]), "{} vs {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn tkuri_round_trips() {
        let id = tkuri("org-1/space-2", 1_700_000_000_000);
        assert_eq!(id, "t/0001700000000000/k/org-1/space-2");
        assert_eq!(
            decode(&id).unwrap(),
            ("org-1/space-2".to_string(), 1_700_000_000_000)
        );
    }

    #[test]
    fn kturi_round_trips() {
        let id = kturi("org-1/space-2", 1_700_000_000_000);
        assert_eq!(id, "k/org-1/space-2/t/0001700000000000");
        assert_eq!(
            decode(&id).unwrap(),
            ("org-1/space-2".to_string(), 1_700_000_000_000)
        );
    }

    #[test]
    fn time_of_tolerates_scan_sentinel() {
        let bound = format!("{}ZZZ", kturi("o1", 1_700_000_000_000));
        assert_eq!(time_of(&bound).unwrap(), 1_700_000_000_000);
        assert_eq!(key_of(&bound).unwrap(), "o1");
    }

    #[test]
    fn bare_time_bound_has_empty_key() {
        let bound = format!("t/{}", pad16(1_700_000_000_000));
        assert_eq!(key_of(&bound).unwrap(), "");
        assert_eq!(time_of(&bound).unwrap(), 1_700_000_000_000);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!(key_of("x/123").is_err());
        assert!(time_of("k/org-1").is_err());
        assert!(time_of("t/12ab").is_err());
    }
}
