use std::{fmt, str::FromStr, time::Duration};

/// A signed duration in Go's `time.ParseDuration` format, e.g. `1h30m`,
/// `1.5s` or `250us`.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct K8sDuration {
    duration: Duration,
    is_negative: bool,
}

#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("invalid floating-point number: {}", .0)]
    NotANumber(#[from] std::num::ParseFloatError),

    #[error("duration out of range")]
    OutOfRange,
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

impl From<Duration> for K8sDuration {
    fn from(duration: Duration) -> Self {
        Self {
            duration,
            is_negative: false,
        }
    }
}

impl From<K8sDuration> for Duration {
    fn from(K8sDuration { duration, .. }: K8sDuration) -> Self {
        duration
    }
}

impl K8sDuration {
    #[inline]
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.is_negative
    }
}

impl fmt::Debug for K8sDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for K8sDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use std::fmt::Write;
        if self.is_negative {
            f.write_char('-')?;
        }
        fmt::Debug::fmt(&self.duration, f)
    }
}

impl FromStr for K8sDuration {
    type Err = ParseError;

    fn from_str(mut s: &str) -> Result<Self, Self::Err> {
        // Same grammar as Go's time.ParseDuration.

        fn duration_from_units(val: f64, unit: &str) -> Result<Duration, ParseError> {
            const MINUTE: Duration = Duration::from_secs(60);
            let base = match unit {
                "ns" => Duration::from_nanos(1),
                // U+00B5 is the micro sign, U+03BC is the Greek letter mu.
                "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
                "ms" => Duration::from_millis(1),
                "s" => Duration::from_secs(1),
                "m" => MINUTE,
                "h" => MINUTE * 60,
                _ => return Err(ParseError::InvalidUnit),
            };
            Duration::try_from_secs_f64(val * base.as_secs_f64())
                .map_err(|_| ParseError::OutOfRange)
        }

        // Rust durations are unsigned, so the sign is carried separately.
        let is_negative = s.starts_with('-');
        s = s.strip_prefix(&['+', '-'][..]).unwrap_or(s);
        if s.is_empty() {
            return Err(ParseError::NoUnit);
        }

        let mut total = Duration::ZERO;
        while !s.is_empty() {
            if let Some(unit_start) = s.find(|c: char| c.is_alphabetic()) {
                let (val, rest) = s.split_at(unit_start);
                let val = val.parse::<f64>()?;
                let unit = match rest.find(|c: char| !c.is_alphabetic()) {
                    Some(next_numeric_start) => {
                        let (unit, rest) = rest.split_at(next_numeric_start);
                        s = rest;
                        unit
                    }
                    None => {
                        s = "";
                        rest
                    }
                };
                total = total
                    .checked_add(duration_from_units(val, unit)?)
                    .ok_or(ParseError::OutOfRange)?;
            } else if s == "0" {
                return Ok(K8sDuration {
                    duration: Duration::ZERO,
                    is_negative,
                });
            } else {
                return Err(ParseError::NoUnit);
            }
        }

        Ok(K8sDuration {
            duration: total,
            is_negative,
        })
    }
}
