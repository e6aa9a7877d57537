//! `<integer><unit>` duration strings (`30s`, `5m`, `12h`, `5d`).

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurationParseError {
    #[error("empty duration")]
    Empty,
    #[error("duration {0:?} has no unit (expected one of s, m, h, d)")]
    MissingUnit(String),
    #[error("duration {0:?} has an unknown unit (expected one of s, m, h, d)")]
    UnknownUnit(String),
    #[error("duration {0:?} does not start with a non-negative integer")]
    InvalidNumber(String),
    #[error("duration {0:?} is too large")]
    Overflow(String),
}

/// Parse a duration like `30s` or `5d`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let s = input.trim();
    let Some(unit) = s.chars().last() else {
        return Err(DurationParseError::Empty);
    };
    if unit.is_ascii_digit() {
        return Err(DurationParseError::MissingUnit(input.to_string()));
    }
    let multiplier: u64 = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        _ => return Err(DurationParseError::UnknownUnit(input.to_string())),
    };

    let digits = &s[..s.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DurationParseError::InvalidNumber(input.to_string()));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| DurationParseError::Overflow(input.to_string()))?;
    let secs = value
        .checked_mul(multiplier)
        .ok_or_else(|| DurationParseError::Overflow(input.to_string()))?;
    Ok(Duration::from_secs(secs))
}
