//! Parsing related utilities for casting from a string to other types.
//!
//! Parsers return `None` when the parse cannot be done; the cast layer turns
//! that into a typed cast error naming source and destination.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use uuid::Uuid;

pub fn parse_bool(s: &str) -> Option<bool> {
    let s = s.trim().to_ascii_lowercase();
    if s.is_empty() {
        return None;
    }
    // Postgres accepts unambiguous prefixes of true/false/yes/no/on/off
    // plus '1' and '0'.
    if s == "1" || "true".starts_with(&s) || "yes".starts_with(&s) || s == "on" {
        return Some(true);
    }
    if s == "0" || "false".starts_with(&s) || "no".starts_with(&s) || s == "off" || s == "of" {
        return Some(false);
    }
    None
}

pub fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(v) = s.parse::<i64>() {
        return Some(v);
    }
    // Numeric strings with a fractional part are only valid when integral.
    let f = s.parse::<f64>().ok()?;
    if !f.is_finite() || f.fract() != 0.0 {
        return None;
    }
    Some(f as i64)
}

pub fn parse_float(s: &str) -> Option<f64> {
    let f = s.trim().parse::<f64>().ok()?;
    // Reject non-finite results ('inf', 'nan' and overflow alike).
    if !f.is_finite() {
        return None;
    }
    Some(f)
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    // Timestamp strings truncate to their date part.
    parse_timestamp(s).map(|ts| ts.date())
}

pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim().trim_end_matches('Z');
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ts);
        }
    }
    // A bare date parses to midnight.
    let d = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(d.and_time(NaiveTime::MIN))
}

/// Parse and normalize a uuid (output is lowercase hyphenated regardless of
/// input form).
pub fn parse_uuid(s: &str) -> Option<Uuid> {
    Uuid::parse_str(s.trim()).ok()
}

pub fn parse_json(s: &str) -> Option<serde_json::Value> {
    serde_json::from_str(s).ok()
}

/// Split a `{a,b,c}` array literal into raw element strings.
///
/// Handles nested braces, double-quoted elements with backslash escapes, and
/// the unquoted NULL keyword (returned as `None` entries).
pub fn parse_array_literal(s: &str) -> Option<Vec<Option<String>>> {
    let s = s.trim();
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }

    let mut elems = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut was_quoted = false;
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' if depth == 0 => {
                in_quotes = !in_quotes;
                was_quoted = true;
            }
            '\\' if in_quotes => {
                current.push(chars.next()?);
            }
            '{' if !in_quotes => {
                depth += 1;
                current.push(c);
            }
            '}' if !in_quotes => {
                depth = depth.checked_sub(1)?;
                current.push(c);
            }
            ',' if !in_quotes && depth == 0 => {
                elems.push(finish_elem(&mut current, &mut was_quoted)?);
            }
            _ => current.push(c),
        }
    }
    if in_quotes || depth != 0 {
        return None;
    }
    elems.push(finish_elem(&mut current, &mut was_quoted)?);
    Some(elems)
}

fn finish_elem(current: &mut String, was_quoted: &mut bool) -> Option<Option<String>> {
    let raw = std::mem::take(current);
    let quoted = std::mem::take(was_quoted);
    if quoted {
        return Some(Some(raw));
    }
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Some(None);
    }
    Some(Some(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_prefixes() {
        assert_eq!(Some(true), parse_bool("t"));
        assert_eq!(Some(true), parse_bool("TRUE"));
        assert_eq!(Some(true), parse_bool("ye"));
        assert_eq!(Some(false), parse_bool("f"));
        assert_eq!(Some(false), parse_bool("no"));
        assert_eq!(Some(true), parse_bool("on"));
        assert_eq!(Some(false), parse_bool("off"));
        assert_eq!(None, parse_bool("o"));
        assert_eq!(None, parse_bool("maybe"));
    }

    #[test]
    fn int_requires_integral() {
        assert_eq!(Some(42), parse_int("42"));
        assert_eq!(Some(2), parse_int("2.0"));
        assert_eq!(None, parse_int("2.5"));
        assert_eq!(None, parse_int("abc"));
        assert_eq!(None, parse_int("inf"));
    }

    #[test]
    fn float_rejects_non_finite() {
        assert_eq!(Some(1.5), parse_float("1.5"));
        assert_eq!(None, parse_float("inf"));
        assert_eq!(None, parse_float("NaN"));
    }

    #[test]
    fn timestamp_formats() {
        let expect = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(Some(expect), parse_timestamp("2024-01-02T03:04:05"));
        assert_eq!(Some(expect), parse_timestamp("2024-01-02 03:04:05"));
        assert_eq!(Some(expect), parse_timestamp("2024-01-02T03:04:05Z"));
    }

    #[test]
    fn date_only_timestamp_is_midnight() {
        let ts = parse_timestamp("2024-01-02").unwrap();
        assert_eq!(
            NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            ts
        );
    }

    #[test]
    fn uuid_normalizes() {
        let u = parse_uuid("A0EEBC99-9C0B-4EF8-BB6D-6BB9BD380A11").unwrap();
        assert_eq!("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11", u.to_string());
        assert_eq!(None, parse_uuid("not-a-uuid"));
    }

    #[test]
    fn array_literal_basic() {
        assert_eq!(
            Some(vec![
                Some("a".to_string()),
                Some("b".to_string()),
                Some("c".to_string())
            ]),
            parse_array_literal("{a,b,c}")
        );
        assert_eq!(Some(vec![]), parse_array_literal("{}"));
    }

    #[test]
    fn array_literal_quotes_and_nulls() {
        assert_eq!(
            Some(vec![Some("a,b".to_string()), None]),
            parse_array_literal(r#"{"a,b",NULL}"#)
        );
        assert_eq!(None, parse_array_literal("{a,"));
    }

    #[test]
    fn array_literal_nested() {
        assert_eq!(
            Some(vec![Some("{1,2}".to_string()), Some("{3}".to_string())]),
            parse_array_literal("{{1,2},{3}}")
        );
    }
}
