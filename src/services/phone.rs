// services/phone.rs
use crate::errors::{AppError, Result};

const COUNTRY_CODE: &str = "254";

/// Normalize a Kenyan phone number to international format (254XXXXXXXXX).
///
/// Accepted shapes: `07XXXXXXXX`/`01XXXXXXXX` (local), `+254XXXXXXXXX`, and
/// `254XXXXXXXXX`. Anything else is rejected rather than guessed at, since a
/// mistyped number would silently push the STK prompt to a stranger.
pub fn normalize(phone: &str) -> Result<String> {
    let phone = phone.trim();

    let normalized = if let Some(rest) = phone.strip_prefix('0') {
        format!("{}{}", COUNTRY_CODE, rest)
    } else if let Some(rest) = phone.strip_prefix('+') {
        rest.to_string()
    } else {
        phone.to_string()
    };

    if normalized.len() == 12
        && normalized.starts_with(COUNTRY_CODE)
        && normalized.chars().all(|c| c.is_ascii_digit())
    {
        Ok(normalized)
    } else {
        Err(AppError::InvalidPhone(phone.to_string()))
    }
}
