//! Duration strings (`30s`, `10m`, `24h`, `1h30m`, `250ms`).
//!
//! Parsing is delegated to `humantime`. Go-style fractional components such
//! as `1.5h` are split into a whole part and a nanosecond remainder first.

use std::time::Duration;

use thiserror::Error;

/// Duration parsing errors
#[derive(Debug, Error)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,

    #[error("invalid duration '{input}': {source}")]
    Invalid {
        input: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("duration '{0}' is out of range")]
    OutOfRange(String),
}

/// Parse a duration string
///
/// Accepts everything `humantime` does (`1h 30m`, `2days`, `250ms`), Go's
/// run-together form (`1h30m`) and fractional components (`1.5h`). The bare
/// string `0` is accepted as zero.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let expanded = expand_fractions(s)?;
    humantime::parse_duration(&expanded).map_err(|source| match source {
        humantime::DurationError::NumberOverflow => DurationError::OutOfRange(s.to_string()),
        source => DurationError::Invalid {
            input: s.to_string(),
            source,
        },
    })
}

/// Rewrite every `<int>.<frac><unit>` as `<int><unit> <remainder>ns`
fn expand_fractions(s: &str) -> Result<String, DurationError> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(dot) = rest.find('.') {
        let frac_end = rest[dot + 1..]
            .find(|c: char| !c.is_ascii_digit())
            .map_or(rest.len(), |i| dot + 1 + i);
        let unit_end = rest[frac_end..]
            .find(|c: char| c.is_ascii_digit() || c.is_whitespace())
            .map_or(rest.len(), |i| frac_end + i);
        let unit = &rest[frac_end..unit_end];

        let per_unit = humantime::parse_duration(&format!("1{unit}")).map_err(|source| {
            DurationError::Invalid {
                input: s.to_string(),
                source,
            }
        })?;
        let fraction: f64 = format!("0{}", &rest[dot..frac_end])
            .parse()
            .map_err(|_| DurationError::OutOfRange(s.to_string()))?;
        let remainder = Duration::try_from_secs_f64(per_unit.as_secs_f64() * fraction)
            .map_err(|_| DurationError::OutOfRange(s.to_string()))?;

        let whole = &rest[..dot];
        out.push_str(whole);
        if whole.is_empty() || !whole.ends_with(|c: char| c.is_ascii_digit()) {
            out.push('0');
        }
        out.push_str(unit);
        out.push_str(&format!(" {}ns ", remainder.as_nanos()));
        rest = &rest[unit_end..];
    }

    out.push_str(rest);
    Ok(out.trim_end().to_string())
}
