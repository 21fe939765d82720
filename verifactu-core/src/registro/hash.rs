//! Canonical chain hashing (huella) and AEAT date formatting.
//!
//! The huella binds each registro to its predecessor: a SHA-256 over a fixed
//! `key=value` concatenation joined with `&`, per Artículo 13 of Orden
//! HAC/1177/2024. Recomputing from the same inputs must always yield the
//! same hash, so every input is passed explicitly.
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use sha2::{Digest, Sha256};
use std::fmt::Write;
use thiserror::Error;

/// Error returned for issue dates that match no accepted format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateError {
    #[error("invalid date format: {0}")]
    Unparseable(String),
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Normalize an issue date to the `DD-MM-YYYY` form the schema mandates.
///
/// Accepts dates already in AEAT form, ISO `YYYY-MM-DD` (with or without a
/// time suffix), `DD/MM/YYYY`, and RFC 3339 timestamps.
///
/// # Errors
/// Returns [`DateError::Unparseable`] for anything else.
pub fn format_date_aeat(input: &str) -> Result<String, DateError> {
    let s = input.trim();
    let b = s.as_bytes();

    // Already DD-MM-YYYY.
    if b.len() == 10 && b[2] == b'-' && b[5] == b'-' {
        let (d, m, y) = (&s[0..2], &s[3..5], &s[6..10]);
        if all_digits(d) && all_digits(m) && all_digits(y) {
            return Ok(s.to_string());
        }
    }

    // ISO YYYY-MM-DD, optionally followed by a time part.
    if b.len() >= 10 && b[4] == b'-' && b[7] == b'-' && b[..10].iter().all(u8::is_ascii) {
        let (y, m, d) = (&s[0..4], &s[5..7], &s[8..10]);
        if all_digits(y) && all_digits(m) && all_digits(d) {
            return Ok(format!("{d}-{m}-{y}"));
        }
    }

    // DD/MM/YYYY.
    if b.len() == 10 && b[2] == b'/' && b[5] == b'/' {
        let (d, m, y) = (&s[0..2], &s[3..5], &s[6..10]);
        if all_digits(d) && all_digits(m) && all_digits(y) {
            return Ok(format!("{d}-{m}-{y}"));
        }
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.format("%d-%m-%Y").to_string());
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ts.format("%d-%m-%Y").to_string());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.format("%d-%m-%Y").to_string());
    }

    Err(DateError::Unparseable(input.to_string()))
}

/// Generation timestamp with the local UTC offset,
/// `YYYY-MM-DDTHH:MM:SS+HH:MM`.
pub fn generation_timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut hex, "{:02x}", byte);
    }
    hex
}

/// Huella for a registration record.
#[allow(clippy::too_many_arguments)]
pub fn alta_hash(
    issuer_nif: &str,
    serial: &str,
    issue_date: &str,
    kind_code: &str,
    total_tax: f64,
    total_amount: f64,
    previous_huella: Option<&str>,
    generated_at: &str,
) -> String {
    let canonical = format!(
        "NIF={issuer_nif}&NumSerieFactura={serial}&FechaExpedicionFactura={issue_date}\
         &TipoFactura={kind_code}&CuotaTotal={total_tax:.2}&ImporteTotal={total_amount:.2}\
         &HuellaAnterior={previous}&FechaHoraHusoGenRegistro={generated_at}",
        previous = previous_huella.unwrap_or("")
    );
    sha256_hex(&canonical)
}

/// Huella for a cancellation record.
pub fn anulacion_hash(
    issuer_nif: &str,
    serial: &str,
    issue_date: &str,
    previous_huella: Option<&str>,
    generated_at: &str,
) -> String {
    let canonical = format!(
        "NIF={issuer_nif}&NumSerieFactura={serial}&FechaExpedicionFactura={issue_date}\
         &HuellaAnterior={previous}&FechaHoraHusoGenRegistro={generated_at}",
        previous = previous_huella.unwrap_or("")
    );
    sha256_hex(&canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alta_hash_is_deterministic() {
        let a = alta_hash(
            "B12345678",
            "A-0001",
            "15-03-2025",
            "F1",
            21.0,
            121.0,
            Some("abc123"),
            "2025-03-15T10:00:00+01:00",
        );
        let b = alta_hash(
            "B12345678",
            "A-0001",
            "15-03-2025",
            "F1",
            21.0,
            121.0,
            Some("abc123"),
            "2025-03-15T10:00:00+01:00",
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn alta_hash_changes_with_any_input() {
        let base = alta_hash("B1", "A-1", "01-01-2025", "F1", 1.0, 2.0, None, "t");
        assert_ne!(
            base,
            alta_hash("B2", "A-1", "01-01-2025", "F1", 1.0, 2.0, None, "t")
        );
        assert_ne!(
            base,
            alta_hash("B1", "A-1", "01-01-2025", "F2", 1.0, 2.0, None, "t")
        );
        assert_ne!(
            base,
            alta_hash("B1", "A-1", "01-01-2025", "F1", 1.0, 2.0, Some("x"), "t")
        );
    }

    #[test]
    fn first_record_hashes_with_empty_previous() {
        // No previous anchor behaves exactly like an empty previous huella.
        let none = alta_hash("B1", "A-1", "01-01-2025", "F1", 1.0, 2.0, None, "t");
        let empty = alta_hash("B1", "A-1", "01-01-2025", "F1", 1.0, 2.0, Some(""), "t");
        assert_eq!(none, empty);
    }

    #[test]
    fn anulacion_hash_omits_amount_fields() {
        let a = anulacion_hash("B1", "A-1", "01-01-2025", None, "t");
        let b = anulacion_hash("B1", "A-1", "01-01-2025", None, "t");
        assert_eq!(a, b);
        assert_ne!(a, anulacion_hash("B1", "A-2", "01-01-2025", None, "t"));
    }

    #[test]
    fn amounts_hash_with_two_decimals() {
        // 21.0 and 21.004 round to the same canonical string.
        let a = alta_hash("B1", "A-1", "01-01-2025", "F1", 21.0, 121.0, None, "t");
        let b = alta_hash("B1", "A-1", "01-01-2025", "F1", 21.004, 121.001, None, "t");
        assert_eq!(a, b);
    }

    #[test]
    fn date_formats_normalize_to_aeat() {
        assert_eq!(format_date_aeat("15-03-2025").unwrap(), "15-03-2025");
        assert_eq!(format_date_aeat("2025-03-15").unwrap(), "15-03-2025");
        assert_eq!(
            format_date_aeat("2025-03-15T09:30:00.000Z").unwrap(),
            "15-03-2025"
        );
        assert_eq!(format_date_aeat("15/03/2025").unwrap(), "15-03-2025");
        assert_eq!(
            format_date_aeat("2025-03-15 09:30:00").unwrap(),
            "15-03-2025"
        );
    }

    #[test]
    fn unparseable_dates_are_rejected() {
        assert!(matches!(
            format_date_aeat("yesterday"),
            Err(DateError::Unparseable(_))
        ));
        assert!(format_date_aeat("15.03.2025").is_err());
        assert!(format_date_aeat("").is_err());
    }

    #[test]
    fn generation_timestamp_carries_offset() {
        let ts = generation_timestamp();
        // 2025-03-15T10:00:00+01:00 — offset separated with a colon.
        assert_eq!(ts.len(), 25);
        assert_eq!(&ts[10..11], "T");
        assert!(ts.ends_with(|c: char| c.is_ascii_digit()));
        assert_eq!(&ts[22..23], ":");
    }
}
