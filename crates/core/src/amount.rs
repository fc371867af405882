use serde::{Deserialize, Serialize};

use crate::Amount;

/// Highest decimal scale accepted for scaled amounts; 10^30 still fits i128.
pub const MAX_DECIMALS: u32 = 30;

/// `10^decimals`, or `None` past [`MAX_DECIMALS`].
pub fn scale_divisor(decimals: u32) -> Option<u128> {
    if decimals > MAX_DECIMALS {
        return None;
    }
    10_u128.checked_pow(decimals)
}

/// Decimal-place convention of a ledger family. Output values are divided by
/// `10^decimals` exactly once, when the table is rendered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LedgerFamily {
    /// Bitcoin-style ledgers, 8 decimal places.
    Satoshi,
    /// Ethereum and ERC-20 style ledgers, 18 decimal places.
    Wei,
}

impl LedgerFamily {
    pub fn from_ledger_name(name: &str) -> Self {
        if name.to_ascii_lowercase().starts_with("eth") {
            LedgerFamily::Wei
        } else {
            LedgerFamily::Satoshi
        }
    }

    pub fn decimals(self) -> u32 {
        match self {
            LedgerFamily::Satoshi => 8,
            LedgerFamily::Wei => 18,
        }
    }
}

/// Parses a raw ledger value into an exact integer amount.
///
/// Accepts plain integers, decimals whose fraction is all zeros (`"100.0"`) and
/// scientific notation that still denotes an integer (`"1.5E+20"`). Returns `None`
/// for anything else, including values with a non-zero fractional remainder.
pub fn parse_amount(text: &str) -> Option<Amount> {
    let text = text.trim();
    if let Ok(value) = text.parse::<Amount>() {
        return Some(value);
    }

    let (mantissa, exponent) = match text.find(|c: char| c == 'e' || c == 'E') {
        Some(pos) => (&text[..pos], text[pos + 1..].parse::<i32>().ok()?),
        None => (text, 0),
    };
    let (negative, unsigned) = split_sign(mantissa);
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part
        .bytes()
        .chain(frac_part.bytes())
        .all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let mut digits = format!("{int_part}{frac_part}");
    let shift = exponent.checked_sub(i32::try_from(frac_part.len()).ok()?)?;
    if shift < 0 {
        let cut = shift.unsigned_abs() as usize;
        if cut >= digits.len() {
            // every digit sits right of the decimal point
            return digits.bytes().all(|b| b == b'0').then_some(0);
        }
        let (kept, dropped) = digits.split_at(digits.len() - cut);
        if !dropped.bytes().all(|b| b == b'0') {
            return None;
        }
        digits = kept.to_string();
    }

    let mut value = if digits.is_empty() {
        0
    } else {
        digits.parse::<Amount>().ok()?
    };
    if shift > 0 {
        value = value.checked_mul(10_i128.checked_pow(shift as u32)?)?;
    }
    Some(if negative { -value } else { value })
}

/// Renders `amount / 10^decimals` as an exact decimal string with trailing zeros
/// trimmed. `None` when `decimals` exceeds [`MAX_DECIMALS`].
pub fn format_scaled(amount: Amount, decimals: u32) -> Option<String> {
    let divisor = scale_divisor(decimals)?;
    let magnitude = amount.unsigned_abs();
    let whole = magnitude / divisor;
    let frac = magnitude % divisor;

    let mut out = String::new();
    if amount < 0 {
        out.push('-');
    }
    out.push_str(&whole.to_string());
    if frac != 0 {
        let padded = format!("{:0width$}", frac, width = decimals as usize);
        out.push('.');
        out.push_str(padded.trim_end_matches('0'));
    }
    Some(out)
}

/// Inverse of [`format_scaled`]: `"0.5"` with 8 decimals is `50_000_000`.
pub fn parse_scaled(text: &str, decimals: u32) -> Option<Amount> {
    scale_divisor(decimals)?;
    let (negative, unsigned) = split_sign(text.trim());
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if frac_part.len() > decimals as usize
        || !int_part
            .bytes()
            .chain(frac_part.bytes())
            .all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let whole = if int_part.is_empty() {
        0
    } else {
        int_part.parse::<Amount>().ok()?
    };
    let frac = if frac_part.is_empty() {
        0
    } else {
        let pad = decimals as usize - frac_part.len();
        frac_part.parse::<Amount>().ok()? * 10_i128.pow(pad as u32)
    };
    let value = whole.checked_mul(10_i128.pow(decimals))?.checked_add(frac)?;
    Some(if negative { -value } else { value })
}

fn split_sign(text: &str) -> (bool, &str) {
    match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    }
}
