//! `grpc-timeout` header parsing and encoding.
//!
//! Format: at most 8 ASCII digits followed by a unit
//! (`H` hours, `M` minutes, `S` seconds, `m` millis, `u` micros, `n` nanos).

use std::time::Duration;

use axum::http::HeaderValue;

pub const GRPC_TIMEOUT: &str = "grpc-timeout";

const MAX_DIGITS: usize = 8;
const MAX_VALUE: u64 = 99_999_999;

/// Parse a `grpc-timeout` value. Returns `None` when malformed.
pub fn parse_timeout(value: &HeaderValue) -> Option<Duration> {
    let text = value.to_str().ok()?;
    if text.len() < 2 || text.len() > MAX_DIGITS + 1 {
        return None;
    }
    let (digits, unit) = text.split_at(text.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let duration = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}

/// Encode a duration with the finest unit that fits in 8 digits.
pub fn encode_timeout(duration: Duration) -> HeaderValue {
    let nanos = duration.as_nanos();
    let units: [(u128, char); 6] = [
        (1, 'n'),
        (1_000, 'u'),
        (1_000_000, 'm'),
        (1_000_000_000, 'S'),
        (60_000_000_000, 'M'),
        (3_600_000_000_000, 'H'),
    ];
    for (per_unit, suffix) in units {
        // Round up so the encoded deadline is never shorter than requested
        let amount = nanos.div_ceil(per_unit);
        if amount <= MAX_VALUE as u128 {
            return HeaderValue::from_str(&format!("{amount}{suffix}"))
                .unwrap_or_else(|_| HeaderValue::from_static("99999999H"));
        }
    }
    HeaderValue::from_static("99999999H")
}
