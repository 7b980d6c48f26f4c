//! Parameter validators shared by the resource model and the inner-message
//! codec.
//!
//! Every function here either returns the (possibly normalised) value or a
//! [`ValidationError`] describing which constraint failed; none of them
//! panic on bad input, since all of them sit on a boundary that takes
//! caller-supplied strings (spec.md §4.A). Field-length and pattern
//! constants are taken from `original_source/3rd/IoticAgent/Core/Validation.py`.

use std::collections::HashSet;

use thiserror::Error;

/// Maximum length, in characters, of a `lid`/`pid` local identifier.
pub const LID_MAX_LEN: usize = 64;
/// Maximum length, in characters, of a label.
pub const LABEL_MAX_LEN: usize = 64;
/// Maximum length, in characters, of a description.
pub const DESCRIPTION_MAX_LEN: usize = 256;
/// Minimum length, in characters, of a tag.
pub const TAG_MIN_LEN: usize = 3;
/// Maximum length, in characters, of a tag.
pub const TAG_MAX_LEN: usize = 64;
/// Maximum length, in characters, of a value's unit URL.
pub const UNIT_MAX_LEN: usize = 128;

/// XSD primitive (and XSD-derived) type names accepted as a [`Value`](crate::resource::Value)'s
/// `vtype`. See <http://www.w3.org/TR/xmlschema-2/#built-in-datatypes>.
pub const VALUE_TYPES: &[&str] = &[
    "string", "boolean", "decimal", "float", "double", "duration", "dateTime", "time", "date",
    "gYearMonth", "gYear", "gMonthDay", "gDay", "gMonth", "hexBinary", "base64Binary", "anyURI",
    "QName", "NOTATION", "normalizedString", "token", "language", "NMTOKEN", "NMTOKENS", "Name",
    "NCName", "ID", "IDREF", "IDREFS", "ENTITY", "ENTITIES", "integer", "nonPositiveInteger",
    "negativeInteger", "long", "int", "short", "byte", "nonNegativeInteger", "unsignedLong",
    "unsignedInt", "unsignedShort", "unsignedByte", "positiveInteger",
];

/// A validation failure, with the field name and the reason it was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

fn err(field: &'static str, reason: impl Into<String>) -> ValidationError {
    ValidationError { field, reason: reason.into() }
}

fn check_len(field: &'static str, s: &str, min_len: usize, max_len: usize) -> Result<(), ValidationError> {
    let len = s.chars().count();
    if len < min_len || (max_len > 0 && len > max_len) {
        return Err(err(field, format!("length {len} outside [{min_len}, {max_len}]")));
    }
    Ok(())
}

fn no_leading_trailing_whitespace(field: &'static str, s: &str) -> Result<(), ValidationError> {
    if s != s.trim() {
        return Err(err(field, "contains leading/trailing whitespace"));
    }
    Ok(())
}

/// Validates a `lid`/`pid`: non-empty, no leading/trailing whitespace, no
/// newline, at most [`LID_MAX_LEN`] characters.
pub fn identifier(field: &'static str, s: &str) -> Result<String, ValidationError> {
    if s.is_empty() {
        return Err(err(field, "must not be empty"));
    }
    no_leading_trailing_whitespace(field, s)?;
    if s.contains('\n') {
        return Err(err(field, "must not contain a line break"));
    }
    check_len(field, s, 1, LID_MAX_LEN)?;
    Ok(s.to_string())
}

/// Validates a label: same rules as [`identifier`] but capped at
/// [`LABEL_MAX_LEN`].
pub fn label(s: &str) -> Result<String, ValidationError> {
    if s.is_empty() {
        return Err(err("label", "must not be empty"));
    }
    no_leading_trailing_whitespace("label", s)?;
    if s.contains('\n') {
        return Err(err("label", "must not contain a line break"));
    }
    check_len("label", s, 1, LABEL_MAX_LEN)?;
    Ok(s.to_string())
}

/// Validates a description/comment: newlines are allowed (unlike labels),
/// capped at [`DESCRIPTION_MAX_LEN`].
pub fn description(s: &str) -> Result<String, ValidationError> {
    if s.is_empty() {
        return Err(err("description", "must not be empty"));
    }
    no_leading_trailing_whitespace("description", s)?;
    check_len("description", s, 1, DESCRIPTION_MAX_LEN)?;
    Ok(s.to_string())
}

/// Validates a language tag: exactly two ASCII letters, case-insensitive,
/// normalised to lowercase (spec.md §4.A `^[a-z]{2}$`).
pub fn language(s: &str) -> Result<String, ValidationError> {
    if s.len() != 2 || !s.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(err("lang", "must be exactly two ASCII letters"));
    }
    Ok(s.to_ascii_lowercase())
}

/// Validates and lower-cases a single tag: `^[\w.-]{3,64}$`, no whitespace.
pub fn tag(s: &str) -> Result<String, ValidationError> {
    check_len("tag", s, TAG_MIN_LEN, TAG_MAX_LEN)?;
    let ok = s
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '-');
    if !ok || s.chars().any(char::is_whitespace) {
        return Err(err(
            "tag",
            "must contain only word characters, dots, dashes and underscores",
        ));
    }
    Ok(s.to_ascii_lowercase())
}

/// Validates a whole tag set, normalising each tag (lower-case, deduped).
pub fn tags(raw: &[String]) -> Result<HashSet<String>, ValidationError> {
    raw.iter().map(|t| tag(t)).collect()
}

/// Validates an XSD primitive type name against [`VALUE_TYPES`].
pub fn value_type(s: &str) -> Result<String, ValidationError> {
    if VALUE_TYPES.contains(&s) {
        Ok(s.to_string())
    } else {
        Err(err("vtype", format!("'{s}' is not a recognised XSD primitive type")))
    }
}

/// Validates a value's unit: an `http(s)://` URL, at most [`UNIT_MAX_LEN`]
/// characters, with a non-empty host and a path of at least 3 characters
/// (spec.md §4.A).
pub fn unit_url(s: &str) -> Result<String, ValidationError> {
    if s.chars().count() > UNIT_MAX_LEN {
        return Err(err("unit", format!("longer than {UNIT_MAX_LEN} characters")));
    }
    let (scheme, rest) = s.split_once("://").ok_or_else(|| err("unit", "missing scheme"))?;
    if scheme != "http" && scheme != "https" {
        return Err(err("unit", "scheme must be http or https"));
    }
    let (netloc, path) = rest.split_once('/').map_or((rest, ""), |(h, p)| (h, p));
    if netloc.len() < 3 || netloc.chars().any(char::is_whitespace) {
        return Err(err("unit", "netloc too short or contains whitespace"));
    }
    let path_with_slash = format!("/{path}");
    if path_with_slash.len() < 3 || path_with_slash.chars().any(char::is_whitespace) {
        return Err(err("unit", "path too short or contains whitespace"));
    }
    Ok(s.to_string())
}

/// Validates a latitude/longitude pair: lat in `[-90, 90]`, lon in
/// `[-180, 180]`.
pub fn location(lat: f64, lon: f64) -> Result<(f64, f64), ValidationError> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(err("lat", format!("{lat} outside [-90, 90]")));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(err("long", format!("{lon} outside [-180, 180]")));
    }
    Ok((lat, lon))
}

/// Validates (and normalises to the wire's `idx/N`-expanded form) a MIME
/// type string. Length is capped at `MIME_MAX_LEN`.
pub fn mime(s: &str) -> Result<String, ValidationError> {
    if s.len() < 2 || s.len() >= crate::constants::MIME_MAX_LEN {
        return Err(err("mime", format!("length must be in [2, {})", crate::constants::MIME_MAX_LEN)));
    }
    Ok(s.to_string())
}

/// Validates an RFC3339/ISO8601 datetime string, requiring a UTC offset
/// (`Z` or `+00:00`), as spec.md requires for share-time values.
pub fn datetime_utc(s: &str) -> Result<chrono::DateTime<chrono::Utc>, ValidationError> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map_err(|e| err("time", e.to_string()))
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_rejects_empty_and_overlong() {
        assert!(identifier("lid", "").is_err());
        assert!(identifier("lid", &"a".repeat(65)).is_err());
        assert!(identifier("lid", &"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_identifier_rejects_whitespace_and_newline() {
        assert!(identifier("lid", " leading").is_err());
        assert!(identifier("lid", "trailing ").is_err());
        assert!(identifier("lid", "has\nnewline").is_err());
        assert!(identifier("lid", "fine-one_2").is_ok());
    }

    #[test]
    fn test_language_case_insensitive_normalises_lowercase() {
        assert_eq!(language("EN").unwrap(), "en");
        assert_eq!(language("fr").unwrap(), "fr");
        assert!(language("eng").is_err());
        assert!(language("1a").is_err());
    }

    #[test]
    fn test_tag_pattern_and_length() {
        assert!(tag("ab").is_err()); // too short
        assert!(tag(&"a".repeat(65)).is_err()); // too long
        assert_eq!(tag("Sensor_01").unwrap(), "sensor_01");
        assert!(tag("has space").is_err());
        assert_eq!(tag("dotted.tag-name").unwrap(), "dotted.tag-name");
    }

    #[test]
    fn test_tags_dedup_and_normalise() {
        let raw = vec!["Temp".to_string(), "temp".to_string(), "humidity".to_string()];
        let set = tags(&raw).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("temp"));
        assert!(set.contains("humidity"));
    }

    #[test]
    fn test_value_type_accepts_known_rejects_unknown() {
        assert!(value_type("float").is_ok());
        assert!(value_type("dateTime").is_ok());
        assert!(value_type("not-a-type").is_err());
    }

    #[test]
    fn test_unit_url_requires_http_scheme_and_min_parts() {
        assert!(unit_url("https://qudt.org/vocab/unit/DEG_C").is_ok());
        assert!(unit_url("ftp://example.com/unit").is_err());
        assert!(unit_url("not-a-url").is_err());
        assert!(unit_url("http://ab/x").is_err()); // netloc too short
    }

    #[test]
    fn test_unit_url_rejects_overlong() {
        let long_unit = format!("https://example.com/{}", "a".repeat(200));
        assert!(unit_url(&long_unit).is_err());
    }

    #[test]
    fn test_location_bounds() {
        assert!(location(90.0, 180.0).is_ok());
        assert!(location(-90.0, -180.0).is_ok());
        assert!(location(90.1, 0.0).is_err());
        assert!(location(0.0, 180.1).is_err());
    }

    #[test]
    fn test_datetime_utc_requires_offset() {
        assert!(datetime_utc("2024-01-01T00:00:00.000Z").is_ok());
        assert!(datetime_utc("2024-01-01T00:00:00").is_err());
    }
}
