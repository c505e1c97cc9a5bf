use std::time::Duration;

/// Parses duration strings of the `30s` / `1h30m` / `250ms` family, the
/// format Google error payloads and retention hints use.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut unit = String::new();

    let mut flush = |number: &mut String, unit: &mut String, total: &mut Duration| -> bool {
        if number.is_empty() || unit.is_empty() {
            return false;
        }
        let value: f64 = match number.parse() {
            Ok(value) => value,
            Err(_) => return false,
        };
        let unit_duration = match unit.as_str() {
            "ns" => Duration::from_nanos(1),
            "us" | "µs" => Duration::from_micros(1),
            "ms" => Duration::from_millis(1),
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => Duration::from_secs(3600),
            _ => return false,
        };
        *total += unit_duration.mul_f64(value);
        number.clear();
        unit.clear();
        true
    };

    for ch in raw.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            if !unit.is_empty() && !flush(&mut number, &mut unit, &mut total) {
                return None;
            }
            number.push(ch);
        } else {
            unit.push(ch);
        }
    }
    if !flush(&mut number, &mut unit, &mut total) {
        return None;
    }

    if total.is_zero() {
        return None;
    }
    Some(total)
}
