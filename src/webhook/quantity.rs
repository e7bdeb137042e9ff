//! Kubernetes resource quantity arithmetic
//!
//! Just enough of the quantity grammar to add a device count to an existing
//! request and to tell whether a hugepage quantity is zero. Values are held as
//! an exact number of nano-units.

use std::fmt;

use thiserror::Error;

const NANOS_PER_UNIT: i128 = 1_000_000_000;

/// A parsed quantity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ParsedQuantity {
    nanos: i128,
}

/// Why a quantity string was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    /// Not a number with a known suffix
    #[error("invalid quantity '{0}'")]
    Invalid(String),
    /// Too large to represent
    #[error("quantity '{0}' is out of range")]
    OutOfRange(String),
}

impl ParsedQuantity {
    /// An integral count such as a number of devices
    pub fn from_count(count: i64) -> Self {
        Self {
            nanos: i128::from(count) * NANOS_PER_UNIT,
        }
    }

    /// Parse a quantity such as `2`, `1500m`, `2Gi` or `1e3`
    pub fn parse(input: &str) -> Result<Self, QuantityError> {
        let invalid = || QuantityError::Invalid(input.to_string());
        let out_of_range = || QuantityError::OutOfRange(input.to_string());

        let s = input.trim();
        let (negative, s) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };

        let number_len = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(number_len);
        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        if fraction.contains('.') {
            return Err(invalid());
        }

        let digits: i128 = format!("{whole}{fraction}")
            .parse()
            .map_err(|_| out_of_range())?;
        let fraction_len = u32::try_from(fraction.len()).map_err(|_| out_of_range())?;

        let (binary_shift, decimal_exponent) = parse_suffix(suffix).ok_or_else(invalid)?;

        // digits * 2^shift * 10^(exponent + 9 - fraction_len)
        let scaled = digits
            .checked_mul(1_i128.checked_shl(binary_shift).ok_or_else(out_of_range)?)
            .ok_or_else(out_of_range)?;
        let fraction_len = i32::try_from(fraction_len).map_err(|_| out_of_range())?;
        let exponent = decimal_exponent
            .checked_add(9)
            .and_then(|e| e.checked_sub(fraction_len))
            .ok_or_else(out_of_range)?;
        let nanos = if exponent >= 0 {
            10_i128
                .checked_pow(exponent.unsigned_abs())
                .and_then(|p| scaled.checked_mul(p))
                .ok_or_else(out_of_range)?
        } else {
            // Sub-nano precision rounds up, as the API server does
            match 10_i128.checked_pow(exponent.unsigned_abs()) {
                Some(divisor) if scaled % divisor == 0 => scaled / divisor,
                Some(divisor) => scaled / divisor + 1,
                // Divisor exceeds any representable value
                None if scaled == 0 => 0,
                None => 1,
            }
        };

        Ok(Self {
            nanos: if negative { -nanos } else { nanos },
        })
    }

    /// Whether the quantity is zero
    pub fn is_zero(&self) -> bool {
        self.nanos == 0
    }

    /// Sum of two quantities, `None` on overflow
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.nanos.checked_add(other.nanos).map(|nanos| Self { nanos })
    }
}

/// (binary shift, decimal exponent) for a suffix
fn parse_suffix(suffix: &str) -> Option<(u32, i32)> {
    let known = match suffix {
        "" => (0, 0),
        "n" => (0, -9),
        "u" => (0, -6),
        "m" => (0, -3),
        "k" => (0, 3),
        "M" => (0, 6),
        "G" => (0, 9),
        "T" => (0, 12),
        "P" => (0, 15),
        "E" => (0, 18),
        "Ki" => (10, 0),
        "Mi" => (20, 0),
        "Gi" => (30, 0),
        "Ti" => (40, 0),
        "Pi" => (50, 0),
        "Ei" => (60, 0),
        _ => {
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?;
            return exponent.parse::<i32>().ok().map(|e| (0, e));
        }
    };
    Some(known)
}

impl fmt::Display for ParsedQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.nanos;
        if n % NANOS_PER_UNIT == 0 {
            write!(f, "{}", n / NANOS_PER_UNIT)
        } else if n % 1_000_000 == 0 {
            write!(f, "{}m", n / 1_000_000)
        } else if n % 1_000 == 0 {
            write!(f, "{}u", n / 1_000)
        } else {
            write!(f, "{n}n")
        }
    }
}
