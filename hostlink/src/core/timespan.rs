//! Serde adapter for durations in `[d.]hh:mm:ss[.fffffff]` time-span form.
//!
//! Fractions carry 100ns ticks (seven digits). Parsing accepts fewer digits.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer, de};

const TICKS_PER_SECOND: u64 = 10_000_000;
const NANOS_PER_TICK: u32 = 100;

pub fn format(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    let ticks = duration.subsec_nanos() / NANOS_PER_TICK;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}."));
    }
    out.push_str(&format!("{hours:02}:{minutes:02}:{seconds:02}"));
    if ticks > 0 {
        out.push_str(&format!(".{ticks:07}"));
    }
    out
}

pub fn parse(text: &str) -> Result<Duration, String> {
    let invalid = || format!("invalid time span {text:?}");

    let (days, clock) = match text.split_once(':') {
        Some((head, _)) if head.contains('.') => {
            let (days, _) = head.split_once('.').ok_or_else(invalid)?;
            let days: u64 = days.parse().map_err(|_| invalid())?;
            (days, &text[text.find('.').ok_or_else(invalid)? + 1..])
        }
        Some(_) => (0, text),
        None => return Err(invalid()),
    };

    let (clock, fraction) = match clock.split_once('.') {
        Some((clock, fraction)) => (clock, Some(fraction)),
        None => (clock, None),
    };

    let parts: Vec<&str> = clock.split(':').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }
    let hours: u64 = parts[0].parse().map_err(|_| invalid())?;
    let minutes: u64 = parts[1].parse().map_err(|_| invalid())?;
    let seconds: u64 = parts[2].parse().map_err(|_| invalid())?;
    if minutes >= 60 || seconds >= 60 {
        return Err(invalid());
    }

    let ticks = match fraction {
        Some(digits) if digits.is_empty() || digits.len() > 7 => return Err(invalid()),
        Some(digits) => {
            let value: u64 = digits.parse().map_err(|_| invalid())?;
            value * 10u64.pow(7 - digits.len() as u32)
        }
        None => 0,
    };

    let secs = days
        .checked_mul(86_400)
        .zip(hours.checked_mul(3_600))
        .and_then(|(days, hours)| days.checked_add(hours))
        .and_then(|secs| secs.checked_add(minutes * 60 + seconds))
        .ok_or_else(invalid)?;
    let nanos = (ticks % TICKS_PER_SECOND) as u32 * NANOS_PER_TICK;
    Ok(Duration::new(secs, nanos))
}

pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format(*duration))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let text = String::deserialize(deserializer)?;
    parse(&text).map_err(de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_zero_without_fraction() {
        assert_eq!(format(Duration::ZERO), "00:00:00");
    }

    #[test]
    fn formats_days_and_ticks() {
        let duration = Duration::new(86_400 + 3_723, 500_000_000);
        assert_eq!(format(duration), "1.01:02:03.5000000");
    }

    #[test]
    fn parses_short_fraction() {
        assert_eq!(parse("00:00:01.25").expect("parse"), Duration::from_millis(1_250));
    }

    #[test]
    fn parses_formatted_value_back() {
        let duration = Duration::new(2 * 86_400 + 59, 1_234_500);
        assert_eq!(parse(&format(duration)).expect("parse"), duration);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("soon").is_err());
        assert!(parse("00:61:00").is_err());
        assert!(parse("00:00:00.12345678").is_err());
    }

    #[test]
    fn rejects_values_that_overflow_seconds() {
        assert!(parse("99999999999999999:00:00").is_err());
        assert!(parse("99999999999999999.00:00:00").is_err());
        assert!(parse("18446744073709551615:59:59").is_err());
    }
}
