//! Monetary amounts as integer minor units.
//!
//! Every amount in the core is carried as an `i64` number of cents and
//! named with a `_cents` suffix. Parsing and formatting both go through
//! this module so every surface (record files, the ledger document, CLI
//! output) renders identically; floats never touch stored amounts.
//!
//! # Invariants
//!
//! - [INV-MNY-001] `parse_cents(format_cents(x)) == x` for any amount
//!   that fits in an `i64` cent count.
//! - [INV-MNY-002] Parsing is fail-closed: any character that is not a
//!   digit, sign, `$`, thousands separator, or single decimal point is
//!   rejected rather than ignored.

use thiserror::Error;

/// Errors from parsing a monetary amount.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MoneyError {
    /// The input contained no digits.
    #[error("amount {input:?} contains no digits")]
    Empty {
        /// The offending input.
        input: String,
    },

    /// The input contained a character that is not part of a money
    /// literal.
    #[error("invalid character {character:?} in amount {input:?}")]
    InvalidCharacter {
        /// The offending input.
        input: String,
        /// The first character that failed to parse.
        character: char,
    },

    /// Structurally malformed amount (second decimal point, more than
    /// two fraction digits, separator after the point).
    #[error("malformed amount {input:?}: {reason}")]
    Malformed {
        /// The offending input.
        input: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// The amount does not fit in an `i64` cent count.
    #[error("amount {input:?} overflows the cent range")]
    Overflow {
        /// The offending input.
        input: String,
    },
}

/// Format a cent amount as a decimal string with two fraction digits.
///
/// `150000` renders as `"1500.00"`; negative amounts carry a leading
/// minus sign.
#[must_use]
pub fn format_cents(amount_cents: i64) -> String {
    let sign = if amount_cents < 0 { "-" } else { "" };
    let magnitude = amount_cents.unsigned_abs();
    format!("{sign}{}.{:02}", magnitude / 100, magnitude % 100)
}

/// Parse a decimal amount into cents.
///
/// Accepts an optional leading minus, an optional `$`, thousands
/// separators before the decimal point, and at most two digits after
/// it. `"1,500.5"` parses to `150050`.
///
/// # Errors
///
/// Returns a [`MoneyError`] describing the first structural problem
/// found; nothing is silently skipped.
pub fn parse_cents(input: &str) -> Result<i64, MoneyError> {
    let trimmed = input.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let body = body.strip_prefix('$').unwrap_or(body);

    let mut cents: i64 = 0;
    let mut fraction_digits: Option<u8> = None;
    let mut saw_digit = false;
    for character in body.chars() {
        match character {
            '0'..='9' => {
                if fraction_digits == Some(2) {
                    return Err(MoneyError::Malformed {
                        input: input.to_string(),
                        reason: "more than two digits after the decimal point",
                    });
                }
                let digit = i64::from(character as u8 - b'0');
                cents = cents
                    .checked_mul(10)
                    .and_then(|value| value.checked_add(digit))
                    .ok_or_else(|| MoneyError::Overflow {
                        input: input.to_string(),
                    })?;
                if let Some(count) = fraction_digits.as_mut() {
                    *count += 1;
                }
                saw_digit = true;
            },
            ',' if fraction_digits.is_none() => {},
            '.' if fraction_digits.is_none() => fraction_digits = Some(0),
            '.' => {
                return Err(MoneyError::Malformed {
                    input: input.to_string(),
                    reason: "more than one decimal point",
                });
            },
            other => {
                return Err(MoneyError::InvalidCharacter {
                    input: input.to_string(),
                    character: other,
                });
            },
        }
    }
    if !saw_digit {
        return Err(MoneyError::Empty {
            input: input.to_string(),
        });
    }

    // Scale whole-unit or single-fraction-digit inputs up to cents.
    let scale = match fraction_digits {
        None | Some(0) => 100,
        Some(1) => 10,
        _ => 1,
    };
    let mut result = cents
        .checked_mul(scale)
        .ok_or_else(|| MoneyError::Overflow {
            input: input.to_string(),
        })?;
    if negative {
        result = -result;
    }
    Ok(result)
}

/// Whether two cent amounts agree within a tolerance.
///
/// A negative tolerance is treated as zero.
#[must_use]
pub fn within_tolerance(a_cents: i64, b_cents: i64, tolerance_cents: i64) -> bool {
    let delta = (i128::from(a_cents) - i128::from(b_cents)).unsigned_abs();
    delta <= u128::from(tolerance_cents.max(0).unsigned_abs())
}
