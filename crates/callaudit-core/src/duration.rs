//! Call duration parsing.

/// Seconds for a call from its formatted ("H:MM:SS", "MM:SS" or "SS") and/or
/// numeric duration fields.
///
/// The formatted value wins when it parses to something non-zero; otherwise
/// the numeric value is used. Anything unparseable yields 0.
pub fn parse_duration(formatted: Option<&str>, numeric: Option<f64>) -> u64 {
    let from_formatted = formatted.map(parse_formatted).unwrap_or(0);
    if from_formatted > 0 {
        return from_formatted;
    }
    numeric.map(parse_numeric).unwrap_or(0)
}

fn parse_numeric(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.floor() as u64
    } else {
        0
    }
}

fn parse_formatted(input: &str) -> u64 {
    let input = input.trim();
    if input.is_empty() {
        return 0;
    }

    let parts: Vec<&str> = input.split(':').collect();
    if parts.len() > 3 {
        return 0;
    }

    let last_index = parts.len() - 1;
    let mut total: u64 = 0;
    for (i, part) in parts.iter().enumerate() {
        let value = if i == last_index {
            match part.parse::<f64>() {
                Ok(v) if v.is_finite() && v >= 0.0 && !part.starts_with('+') => v.floor() as u64,
                _ => return 0,
            }
        } else {
            match part.parse::<u64>() {
                Ok(v) => v,
                Err(_) => return 0,
            }
        };
        if i > 0 && value >= 60 {
            return 0;
        }
        total = total.saturating_mul(60).saturating_add(value);
    }
    total
}
