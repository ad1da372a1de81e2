//! Log sequence number codec.
//!
//! PostgreSQL renders an LSN as two hexadecimal halves separated by `/`
//! (`16/B374D848`). The numeric value is `(high << 32) | low`.
//!
//! The numeric form is only used for validation and diagnostics. Byte
//! distance between two LSNs is always computed by the server
//! (`pg_wal_lsn_diff`), never here.

use thiserror::Error;

/// Sentinel for an absent LSN after normalization.
pub const ZERO: &str = "0/0";

/// An LSN string that does not match `<hex>/<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LsnFormatError {
    #[error("invalid LSN format: {0:?}")]
    Separator(String),
    #[error("failed to parse LSN {half} part of {lsn:?}")]
    Half { lsn: String, half: &'static str },
}

/// Parses `"<hex>/<hex>"` into its 64-bit value.
pub fn parse(text: &str) -> Result<u64, LsnFormatError> {
    let (high, low) = split(text)?;
    let high = u64::from(parse_half(text, high, "high")?);
    let low = u64::from(parse_half(text, low, "low")?);
    Ok((high << 32) | low)
}

/// Same grammar check as [`parse`], without building the value.
pub fn validate(text: &str) -> bool {
    parse(text).is_ok()
}

/// Renders a 64-bit value in PostgreSQL's textual form.
pub fn format(value: u64) -> String {
    format!("{:X}/{:X}", value >> 32, value & 0xFFFF_FFFF)
}

/// Replaces an empty LSN with [`ZERO`].
pub fn normalize(lsn: &mut String) {
    if lsn.is_empty() {
        lsn.push_str(ZERO);
    }
}

/// True for an empty LSN or the [`ZERO`] sentinel.
pub fn is_absent(lsn: &str) -> bool {
    lsn.is_empty() || lsn == ZERO
}

fn split(text: &str) -> Result<(&str, &str), LsnFormatError> {
    let mut parts = text.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(high), Some(low), None) => Ok((high, low)),
        _ => Err(LsnFormatError::Separator(text.to_string())),
    }
}

/// Each half is 32 bits wide; a wider half is rejected.
fn parse_half(lsn: &str, half: &str, name: &'static str) -> Result<u32, LsnFormatError> {
    // from_str_radix tolerates a leading '+', the LSN grammar does not.
    if half.is_empty() || !half.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(LsnFormatError::Half {
            lsn: lsn.to_string(),
            half: name,
        });
    }
    u32::from_str_radix(half, 16).map_err(|_| LsnFormatError::Half {
        lsn: lsn.to_string(),
        half: name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_values() {
        let cases: &[(&str, u64)] = &[
            ("0/0", 0),
            ("0/1", 1),
            ("1/0", 1 << 32),
            ("0/FFFFFFFF", 0xFFFF_FFFF),
            ("1/FFFFFFFF", 8_589_934_591),
            ("16/b374d848", (0x16 << 32) | 0xB374_D848),
        ];
        for &(text, expected) in cases {
            assert_eq!(parse(text), Ok(expected), "LSN: {text}");
        }
    }

    #[test]
    fn parse_rejects_bad_grammar() {
        for text in ["invalid", "0/invalid", "0", "", "/", "0/", "/0", "0/0/0", "+1/0", "0/ 1"] {
            assert!(parse(text).is_err(), "expected error for {text:?}");
        }
    }

    #[test]
    fn parse_rejects_halves_wider_than_32_bits() {
        for (text, half) in [
            ("0/100000000", "low"),
            ("100000000/0", "high"),
            ("FFFFFFFFF/0", "high"),
        ] {
            assert_eq!(
                parse(text),
                Err(LsnFormatError::Half {
                    lsn: text.to_string(),
                    half,
                }),
                "LSN: {text}"
            );
            assert!(!validate(text), "LSN: {text}");
        }
        // Leading zeros do not widen a half.
        assert_eq!(parse("00000001/00000000"), parse("1/0"));
    }

    #[test]
    fn separator_error_reports_input() {
        let err = parse("0").unwrap_err();
        assert_eq!(err, LsnFormatError::Separator("0".to_string()));
        assert!(err.to_string().contains("invalid LSN format"));
    }

    #[test]
    fn validate_agrees_with_parse() {
        for text in [
            "0/0",
            "0/1A2B3C4D",
            "FFFFFFFF/FFFFFFFF",
            "invalid",
            "0/invalid",
            "0",
            "",
            "1/2/3",
            "g/0",
        ] {
            assert_eq!(validate(text), parse(text).is_ok(), "LSN: {text:?}");
        }
        assert!(validate("0/1A2B3C4D"));
        assert!(!validate("0/invalid"));
    }

    #[test]
    fn format_inverts_parse() {
        assert_eq!(format(8_589_934_591), "1/FFFFFFFF");
        assert_eq!(format(0), ZERO);
        for text in ["0/0", "16/B374D848", "FFFFFFFF/FFFFFFFF"] {
            assert_eq!(format(parse(text).unwrap()), text);
        }
    }

    #[test]
    fn normalize_fills_empty_only() {
        let mut empty = String::new();
        normalize(&mut empty);
        assert_eq!(empty, ZERO);

        let mut set = "0/16B3748".to_string();
        normalize(&mut set);
        assert_eq!(set, "0/16B3748");
    }

    #[test]
    fn absent_covers_empty_and_sentinel() {
        assert!(is_absent(""));
        assert!(is_absent(ZERO));
        assert!(!is_absent("0/1"));
    }
}
