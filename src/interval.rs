//! Human-friendly durations such as `1d 2h 30m 5s`.

use std::time::Duration;

const UNITS: [(char, u64); 4] = [('d', 86_400), ('h', 3_600), ('m', 60), ('s', 1)];

/// Parse a duration written as optional `d`, `h`, `m`, `s` components.
///
/// Components must appear in that order, each at most once, and consist of
/// an unsigned integer followed by its unit letter. Case and whitespace
/// between tokens are ignored. An empty string parses to zero; anything
/// else that does not match returns `None`.
pub fn parse_time_value(text: &str) -> Option<Duration> {
    let mut chars = text.trim().chars().peekable();
    let mut next_unit = 0usize;
    let mut total: u64 = 0;

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            return Some(Duration::from_secs(total));
        }

        let mut value: u64 = 0;
        let mut digits = 0usize;
        while let Some(digit) = chars.next_if(char::is_ascii_digit).and_then(|c| c.to_digit(10)) {
            value = value.checked_mul(10)?.checked_add(u64::from(digit))?;
            digits += 1;
        }
        if digits == 0 {
            return None;
        }

        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let unit = chars.next()?.to_ascii_lowercase();
        let offset = UNITS.iter().skip(next_unit).position(|(u, _)| *u == unit)?;
        let (_, seconds) = UNITS.get(next_unit + offset)?;
        next_unit += offset + 1;

        total = total.checked_add(value.checked_mul(*seconds)?)?;
    }
}

/// Render a duration in the notation `parse_time_value` accepts.
///
/// Sub-second precision is dropped; zero renders as `0s`.
pub fn format_duration(duration: Duration) -> String {
    let mut remaining = duration.as_secs();
    let mut parts = Vec::new();
    for (unit, seconds) in UNITS {
        let count = remaining / seconds;
        remaining %= seconds;
        if count > 0 {
            parts.push(format!("{count}{unit}"));
        }
    }
    if parts.is_empty() {
        "0s".to_owned()
    } else {
        parts.join(" ")
    }
}
