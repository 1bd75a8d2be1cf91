//! Well-known-type string forms: Duration, Timestamp, FieldMask.
//!
//! Shared between the parser (string → components) and the printer
//! (components → string).

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::status::{Error, ErrorKind};

pub const DURATION_MAX_SECONDS: i64 = 315_576_000_000;
/// Seconds of 0001-01-01T00:00:00Z; earlier timestamps are rejected.
pub const TIMESTAMP_MIN_SECONDS: i64 = -62_135_596_800;

fn err(kind: ErrorKind, msg: &str) -> Error {
    Error::new(kind, msg)
}

/// `"<seconds>[.<frac>]s"` → (seconds, nanos). The sign of nanos follows the
/// seconds.
pub fn parse_duration(text: &str) -> Result<(i64, i32), Error> {
    let body = text
        .strip_suffix('s')
        .ok_or_else(|| err(ErrorKind::InvalidInput, "duration must end with 's'"))?;
    let (int_part, frac_part) = match body.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (body, None),
    };
    let negative = int_part.starts_with('-');
    let seconds: i64 = int_part
        .parse()
        .map_err(|_| err(ErrorKind::InvalidInput, "bad duration seconds"))?;
    if !(-DURATION_MAX_SECONDS..=DURATION_MAX_SECONDS).contains(&seconds) {
        return Err(err(ErrorKind::RangeError, "duration seconds out of range"));
    }
    let mut nanos: i32 = 0;
    if let Some(frac) = frac_part {
        if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err(ErrorKind::InvalidInput, "bad duration fraction"));
        }
        let mut v: i32 = frac.parse().unwrap();
        for _ in frac.len()..9 {
            v *= 10;
        }
        nanos = if negative { -v } else { v };
    }
    Ok((seconds, nanos))
}

/// (seconds, nanos) → `"<s>[.<frac>]s"`, with the fraction trimmed to the
/// shortest of 0, 3, 6, or 9 digits.
pub fn format_duration(seconds: i64, nanos: i32) -> Result<String, Error> {
    if !(-DURATION_MAX_SECONDS..=DURATION_MAX_SECONDS).contains(&seconds) {
        return Err(err(ErrorKind::RangeError, "duration seconds out of range"));
    }
    let mut out = String::new();
    if seconds == 0 && nanos < 0 {
        out.push('-');
    }
    out.push_str(&seconds.to_string());
    out.push_str(&format_nanos(nanos.unsigned_abs()));
    out.push('s');
    Ok(out)
}

/// `".<frac>"` trimmed to 3-digit groups, or empty for zero.
pub fn format_nanos(nanos: u32) -> String {
    if nanos == 0 {
        String::new()
    } else if nanos % 1_000_000 == 0 {
        format!(".{:03}", nanos / 1_000_000)
    } else if nanos % 1_000 == 0 {
        format!(".{:06}", nanos / 1_000)
    } else {
        format!(".{:09}", nanos)
    }
}

/// RFC-3339 → (epoch seconds, nanos in [0, 1e9)).
pub fn parse_timestamp(text: &str) -> Result<(i64, i32), Error> {
    let odt = OffsetDateTime::parse(text, &Rfc3339)
        .map_err(|_| err(ErrorKind::InvalidInput, "bad timestamp"))?;
    let ns = odt.unix_timestamp_nanos();
    let seconds = ns.div_euclid(1_000_000_000) as i64;
    let nanos = ns.rem_euclid(1_000_000_000) as i32;
    if seconds < TIMESTAMP_MIN_SECONDS {
        return Err(err(ErrorKind::RangeError, "timestamp before year 1"));
    }
    Ok((seconds, nanos))
}

/// (epoch seconds, nanos) → `YYYY-MM-DDThh:mm:ss[.frac]Z` with a zero-padded
/// 4-digit year.
pub fn format_timestamp(seconds: i64, nanos: i32) -> Result<String, Error> {
    if seconds < TIMESTAMP_MIN_SECONDS || !(0..1_000_000_000).contains(&nanos) {
        return Err(err(ErrorKind::RangeError, "timestamp out of range"));
    }
    let odt = OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|_| err(ErrorKind::RangeError, "timestamp out of range"))?;
    Ok(format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}{}Z",
        odt.year(),
        odt.month() as u8,
        odt.day(),
        odt.hour(),
        odt.minute(),
        odt.second(),
        format_nanos(nanos as u32),
    ))
}

/// One JSON field-mask path, lowerCamelCase → snake_case.
pub fn camel_to_snake(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// One field-mask path, snake_case → lowerCamelCase.
pub fn snake_to_camel(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut upper_next = false;
    for c in path.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parse_and_format() {
        assert_eq!(parse_duration("1.5s").unwrap(), (1, 500_000_000));
        assert_eq!(parse_duration("-1.5s").unwrap(), (-1, -500_000_000));
        assert_eq!(parse_duration("0s").unwrap(), (0, 0));
        assert_eq!(parse_duration("-0.5s").unwrap(), (0, -500_000_000));
        assert!(parse_duration("1.5").is_err());
        assert!(parse_duration("999999999999s").is_err());
        assert!(parse_duration("1.0000000001s").is_err());

        assert_eq!(format_duration(1, 500_000_000).unwrap(), "1.500s");
        assert_eq!(format_duration(0, 0).unwrap(), "0s");
        assert_eq!(format_duration(0, -500_000_000).unwrap(), "-0.500s");
        assert_eq!(format_duration(3, 1).unwrap(), "3.000000001s");
        assert_eq!(format_duration(3, 1_000).unwrap(), "3.000001s");
    }

    #[test]
    fn timestamp_parse_and_format() {
        assert_eq!(parse_timestamp("1970-01-01T00:00:00Z").unwrap(), (0, 0));
        assert_eq!(
            parse_timestamp("1970-01-01T00:00:00.500Z").unwrap(),
            (0, 500_000_000)
        );
        let (s, n) = parse_timestamp("2000-01-01T00:00:00Z").unwrap();
        assert_eq!((s, n), (946_684_800, 0));
        // Offsets are normalized to UTC.
        assert_eq!(
            parse_timestamp("1970-01-01T01:00:00+01:00").unwrap(),
            (0, 0)
        );
        assert!(parse_timestamp("1970-01-01").is_err());

        assert_eq!(format_timestamp(0, 0).unwrap(), "1970-01-01T00:00:00Z");
        assert_eq!(
            format_timestamp(946_684_800, 500_000_000).unwrap(),
            "2000-01-01T00:00:00.500Z"
        );
        // Pre-epoch timestamps format correctly.
        assert_eq!(format_timestamp(-1, 0).unwrap(), "1969-12-31T23:59:59Z");
        assert!(format_timestamp(TIMESTAMP_MIN_SECONDS - 1, 0).is_err());
    }

    #[test]
    fn field_mask_case_conversion() {
        assert_eq!(camel_to_snake("fooBar.bazQux"), "foo_bar.baz_qux");
        assert_eq!(snake_to_camel("foo_bar.baz_qux"), "fooBar.bazQux");
        assert_eq!(camel_to_snake("plain"), "plain");
    }
}
