//! Display boundary for token amounts and durations.
//!
//! Amounts stay integers in base units everywhere else; these helpers are the
//! only place they become decimal strings, and they use exact integer
//! arithmetic both ways.

use chain_core::U256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("amount is empty")]
    Empty,

    #[error("amount must not be negative")]
    Negative,

    #[error("malformed amount: {0:?}")]
    Malformed(String),

    #[error("at most {decimals} fractional digits allowed")]
    TooManyDecimals { decimals: u32 },

    #[error("amount does not fit in 256 bits")]
    Overflow,
}

/// Renders `value` (in base units) with at most `precision` fractional digits.
///
/// Extra digits are truncated, not rounded, and trailing zeros are dropped:
/// `1_500_000_000_000_000_000` with 18 decimals renders as `"1.5"`.
pub fn format_token_amount(value: U256, decimals: u32, precision: u32) -> String {
    let unit = U256::exp10(decimals as usize);
    let whole = value / unit;
    let fraction = value % unit;

    let shown = precision.min(decimals) as usize;
    if shown == 0 || fraction.is_zero() {
        return whole.to_string();
    }

    let digits = format!("{:0>width$}", fraction.to_string(), width = decimals as usize);
    let digits = digits[..shown].trim_end_matches('0');
    if digits.is_empty() {
        whole.to_string()
    } else {
        format!("{}.{}", whole, digits)
    }
}

/// Parses a decimal string into base units.
pub fn parse_token_amount(input: &str, decimals: u32) -> Result<U256, FormatError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(FormatError::Empty);
    }
    if input.starts_with('-') {
        return Err(FormatError::Negative);
    }

    let (whole, fraction) = input.split_once('.').unwrap_or((input, ""));
    let is_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty()) || !is_digits(whole) || !is_digits(fraction) {
        return Err(FormatError::Malformed(input.to_string()));
    }
    if fraction.len() > decimals as usize {
        return Err(FormatError::TooManyDecimals { decimals });
    }

    let parse = |part: &str| {
        if part.is_empty() {
            Ok(U256::zero())
        } else {
            U256::from_dec_str(part).map_err(|_| FormatError::Overflow)
        }
    };
    let padded = format!("{:0<width$}", fraction, width = decimals as usize);

    parse(whole)?
        .checked_mul(U256::exp10(decimals as usize))
        .and_then(|scaled| scaled.checked_add(parse(&padded).ok()?))
        .ok_or(FormatError::Overflow)
}

/// Renders a lock period or countdown, e.g. `"1d 2h 5m"`.
pub fn format_duration(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;

    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}
