//! # Fractional Order
//!
//! Sibling sort keys are non-negative decimal strings (`"0.5"`, `"0.75"`).
//! A new key can always be minted strictly between two existing keys, so an
//! insert never rewrites its neighbours.
//!
//! ```text
//! 0 ─────── 0.25 ─── 0.375 ── 0.5 ──────────── 1
//! ↑ virtual                                    ↑ virtual
//! ```
//!
//! `0` and `1` are virtual bounds: they are used when a side has no neighbour
//! and are never stored. Arithmetic is exact. Halving a finite decimal adds at
//! most one fractional digit, so keys stay finite but keep growing when the
//! same gap is split again and again. Callers cap the length with
//! [`fraction_digits`] and re-key with [`spread`].

use crate::error::CommonError;
use crate::result::CommonResult;
use std::cmp::Ordering;

/// Parsed, canonical decimal: no leading integer zeros, no trailing
/// fractional zeros. Digits are stored as numeric values `0..=9`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Decimal {
    int: Vec<u8>,
    frac: Vec<u8>,
}

impl Decimal {
    fn parse(key: &str) -> CommonResult<Self> {
        let invalid = || CommonError::InvalidOrder(key.to_string());
        let (int_part, frac_part) = match key.split_once('.') {
            Some((i, f)) => {
                if f.is_empty() {
                    return Err(invalid());
                }
                (i, f)
            }
            None => (key, ""),
        };
        if int_part.is_empty() {
            return Err(invalid());
        }

        let digits = |s: &str| -> CommonResult<Vec<u8>> {
            s.bytes()
                .map(|b| {
                    if b.is_ascii_digit() {
                        Ok(b - b'0')
                    } else {
                        Err(invalid())
                    }
                })
                .collect()
        };

        Ok(Self::canonical(digits(int_part)?, digits(frac_part)?))
    }

    fn canonical(mut int: Vec<u8>, mut frac: Vec<u8>) -> Self {
        let leading = int.iter().take_while(|d| **d == 0).count();
        int.drain(..leading);
        while frac.last() == Some(&0) {
            frac.pop();
        }
        Self { int, frac }
    }

    fn zero() -> Self {
        Self { int: vec![], frac: vec![] }
    }

    fn one() -> Self {
        Self { int: vec![1], frac: vec![] }
    }

    fn add(&self, other: &Self) -> Self {
        let frac_len = self.frac.len().max(other.frac.len());
        let int_len = self.int.len().max(other.int.len());

        // Right-aligned digit at position `i` counted from the least significant.
        let digit_at = |d: &Decimal, i: usize| -> u8 {
            if i < frac_len {
                let idx = frac_len - 1 - i;
                d.frac.get(idx).copied().unwrap_or(0)
            } else {
                let from_right = i - frac_len;
                if from_right < d.int.len() {
                    d.int[d.int.len() - 1 - from_right]
                } else {
                    0
                }
            }
        };

        let total = frac_len + int_len;
        let mut out = Vec::with_capacity(total + 1);
        let mut carry = 0u8;
        for i in 0..total {
            let sum = digit_at(self, i) + digit_at(other, i) + carry;
            out.push(sum % 10);
            carry = sum / 10;
        }
        if carry > 0 {
            out.push(carry);
        }
        out.reverse();

        let split = out.len() - frac_len;
        let frac = out.split_off(split);
        Self::canonical(out, frac)
    }

    fn half(&self) -> Self {
        let point = self.int.len();
        let mut digits: Vec<u8> = self.int.iter().chain(self.frac.iter()).copied().collect();
        let mut rem = 0u8;
        for d in digits.iter_mut() {
            let cur = rem * 10 + *d;
            *d = cur / 2;
            rem = cur % 2;
        }
        if rem > 0 {
            digits.push(5);
        }
        let frac = digits.split_off(point);
        Self::canonical(digits, frac)
    }

    fn cmp_value(&self, other: &Self) -> Ordering {
        self.int
            .len()
            .cmp(&other.int.len())
            .then_with(|| self.int.cmp(&other.int))
            .then_with(|| self.frac.cmp(&other.frac))
    }

    fn render(&self) -> String {
        let mut s = String::with_capacity(self.int.len() + self.frac.len() + 2);
        if self.int.is_empty() {
            s.push('0');
        } else {
            s.extend(self.int.iter().map(|d| char::from(b'0' + d)));
        }
        if !self.frac.is_empty() {
            s.push('.');
            s.extend(self.frac.iter().map(|d| char::from(b'0' + d)));
        }
        s
    }
}

/// Compare two order keys by numeric value.
///
/// Total over all strings: malformed keys sort after every well-formed key
/// and among themselves lexicographically.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (Decimal::parse(a), Decimal::parse(b)) {
        (Ok(x), Ok(y)) => x.cmp_value(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Exact midpoint of `lower < upper`.
pub fn midpoint(lower: &str, upper: &str) -> CommonResult<String> {
    let lo = Decimal::parse(lower)?;
    let hi = Decimal::parse(upper)?;
    midpoint_of(&lo, &hi).map(|d| d.render())
}

fn midpoint_of(lo: &Decimal, hi: &Decimal) -> CommonResult<Decimal> {
    if lo.cmp_value(hi) != Ordering::Less {
        return Err(CommonError::NotAscending {
            lower: lo.render(),
            upper: hi.render(),
        });
    }
    Ok(lo.add(hi).half())
}

/// Key strictly between two optional neighbours.
///
/// A missing lower neighbour is the virtual bound `0`. A missing upper
/// neighbour is the virtual bound `1`, or `lower + 1` when the lower key is
/// already at or past `1`.
pub fn between(lower: Option<&str>, upper: Option<&str>) -> CommonResult<String> {
    let lo = match lower {
        Some(key) => Decimal::parse(key)?,
        None => Decimal::zero(),
    };
    let hi = match upper {
        Some(key) => Decimal::parse(key)?,
        None => {
            let one = Decimal::one();
            if lo.cmp_value(&one) == Ordering::Less {
                one
            } else {
                lo.add(&one)
            }
        }
    };
    midpoint_of(&lo, &hi).map(|d| d.render())
}

/// Whether `key` is a well-formed order key.
pub fn is_valid(key: &str) -> bool {
    Decimal::parse(key).is_ok()
}

/// Number of significant fractional digits, `None` for malformed keys.
pub fn fraction_digits(key: &str) -> Option<usize> {
    Decimal::parse(key).ok().map(|d| d.frac.len())
}

/// Normalize a key to its canonical spelling (`"0.50"` → `"0.5"`).
pub fn normalize(key: &str) -> CommonResult<String> {
    Decimal::parse(key).map(|d| d.render())
}

/// `n` short, strictly increasing keys evenly spread over `(0, 1)`.
pub fn spread(n: usize) -> Vec<String> {
    if n == 0 {
        return Vec::new();
    }
    let slots = n as u128 + 1;
    // One digit more than `slots` has guarantees a gap of at least 10 units
    // between consecutive keys, so flooring never collides.
    let width = slots.to_string().len() + 1;
    let scale = 10u128.pow(width as u32);

    (1..=n as u128)
        .map(|i| {
            let units = i * scale / slots;
            let digits = format!("{:0width$}", units, width = width);
            let trimmed = digits.trim_end_matches('0');
            format!("0.{}", trimmed)
        })
        .collect()
}
