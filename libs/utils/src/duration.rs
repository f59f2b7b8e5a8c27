//! Parsing of configuration time values.
//!
//! A value is a non-negative decimal integer with an optional SI-style
//! suffix: `s` (seconds), `m` (minutes), `h` (hours), `d` (days) or `w`
//! (weeks), case-insensitive. No whitespace is allowed anywhere in the
//! value and units cannot be combined: `1h5s` and `10 s` are both
//! rejected, as is a bare suffix or an empty string.

use std::time::Duration;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid time value {0:?}")]
pub struct InvalidDuration(pub String);

/// Parse a time value into a [`Duration`]. A value without a suffix is in
/// seconds.
pub fn parse_duration(value: &str) -> Result<Duration, InvalidDuration> {
    let reject = || InvalidDuration(value.to_string());

    if value.is_empty() {
        return Err(reject());
    }

    let (mantissa, unit) = match value.char_indices().last().unwrap() {
        (i, c) if c.is_ascii_alphabetic() => (&value[..i], Some(c.to_ascii_lowercase())),
        _ => (value, None),
    };

    if mantissa.is_empty() || !mantissa.bytes().all(|b| b.is_ascii_digit()) {
        // catches "-1s", "1h5s", "10 s", "abc" and a bare suffix
        return Err(reject());
    }
    let n: u64 = mantissa.parse().map_err(|_| reject())?;

    let seconds_per_unit = match unit {
        None | Some('s') => 1,
        Some('m') => 60,
        Some('h') => 60 * 60,
        Some('d') => 24 * 60 * 60,
        Some('w') => 7 * 24 * 60 * 60,
        Some(_) => return Err(reject()),
    };

    n.checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(reject)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_suffixed_values() {
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1d"), Ok(Duration::from_secs(86400)));
        assert_eq!(parse_duration("1w"), Ok(Duration::from_secs(604800)));
        // suffix is case-insensitive, no suffix means seconds
        assert_eq!(parse_duration("45S"), Ok(Duration::from_secs(45)));
        assert_eq!(parse_duration("2H"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_duration("30"), Ok(Duration::from_secs(30)));
    }

    #[test]
    fn rejects_malformed_values() {
        for bad in ["10x", "-1s", "1h5s", "1h 5s", "10 s", "abc", "", "s", " 10s", "10s "] {
            assert!(parse_duration(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
