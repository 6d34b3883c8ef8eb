use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::config::RoutingMode;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("enter an amount")]
    Empty,
    #[error("invalid amount format")]
    Format,
    #[error("enter a positive amount")]
    NotPositive,
    #[error("amount is too large")]
    TooLarge,
    #[error("amount exceeds available capacity (max: {max})")]
    ExceedsCapacity { max: String },
}

impl AmountError {
    pub fn is_format(&self) -> bool {
        matches!(self, Self::Format)
    }
}

/// Canonical form uses `.`. The sign is kept so negatives fail as a
/// magnitude error, not a format error.
pub fn normalize_amount(input: &str) -> Result<String, AmountError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AmountError::Empty);
    }

    let (sign, body) = match trimmed.as_bytes()[0] {
        b'-' => ("-", &trimmed[1..]),
        b'+' => ("", &trimmed[1..]),
        _ => ("", trimmed),
    };

    let separators = body.chars().filter(|c| matches!(c, '.' | ',')).count();
    if separators > 1 {
        return Err(AmountError::Format);
    }

    let (whole, fraction) = match body.split_once(['.', ',']) {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (body, None),
    };

    let is_digit_group = |group: &str| !group.is_empty() && group.bytes().all(|b| b.is_ascii_digit());
    if !is_digit_group(whole) || !fraction.map_or(true, is_digit_group) {
        return Err(AmountError::Format);
    }

    Ok(match fraction {
        Some(fraction) => format!("{sign}{whole}.{fraction}"),
        None => format!("{sign}{whole}"),
    })
}

pub fn parse_positive_amount(input: &str) -> Result<(String, Decimal), AmountError> {
    let normalized = normalize_amount(input)?;
    // Already well formed, so a parse failure here is an out-of-range digit string.
    let value = match Decimal::from_str(&normalized) {
        Ok(value) => value,
        Err(_) if normalized.starts_with('-') => return Err(AmountError::NotPositive),
        Err(_) => return Err(AmountError::TooLarge),
    };
    if value <= Decimal::ZERO {
        return Err(AmountError::NotPositive);
    }
    Ok((normalized, value))
}

pub fn parse_capacity(raw: &str) -> Option<Decimal> {
    let normalized = normalize_amount(raw).ok()?;
    Decimal::from_str(&normalized).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountCheck {
    pub normalized: Option<String>,
    pub error: Option<AmountError>,
    pub warning: Option<String>,
}

impl AmountCheck {
    pub fn can_confirm(&self) -> bool {
        self.error.is_none() && self.normalized.is_some()
    }

    fn blocked(error: AmountError) -> Self {
        Self {
            normalized: None,
            error: Some(error),
            warning: None,
        }
    }
}

pub fn check_payment_amount(
    input: &str,
    available: Option<&str>,
    routing: RoutingMode,
) -> AmountCheck {
    let (normalized, value) = match parse_positive_amount(input) {
        Ok(parsed) => parsed,
        Err(err) => return AmountCheck::blocked(err),
    };

    let ceiling = available.and_then(|raw| parse_capacity(raw).map(|value| (raw.trim(), value)));
    match ceiling {
        Some((max, ceiling)) if value > ceiling => {
            if routing.is_multi_hop() {
                AmountCheck {
                    normalized: Some(normalized),
                    error: None,
                    warning: Some(format!(
                        "amount may exceed direct trustline capacity (max: {max})"
                    )),
                }
            } else {
                AmountCheck::blocked(AmountError::ExceedsCapacity {
                    max: max.to_string(),
                })
            }
        }
        _ => AmountCheck {
            normalized: Some(normalized),
            error: None,
            warning: None,
        },
    }
}

#[cfg(test)]
#[path = "tests/amount_tests.rs"]
mod tests;
