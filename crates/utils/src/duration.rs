//! Parsing for human-readable wait budgets like `"1h30m15s"`.

/// Convert a duration expression into milliseconds.
///
/// Accepts any combination of `<n>h`, `<n>m`, `<n>s` components, in order,
/// with optional whitespace between them (`"1h 30m"`, `"90m"`, `"45s"`).
/// Anything that does not match the expected shape yields `0`, so callers can
/// treat missing or garbage input as "no budget".
pub fn time_text_to_millis(text: &str) -> u64 {
    let mut total: u64 = 0;
    let mut value: Option<u64> = None;
    let mut matched = false;

    for ch in text.chars() {
        match ch {
            '0'..='9' => {
                let digit = (ch as u64) - ('0' as u64);
                value = Some(value.unwrap_or(0).saturating_mul(10).saturating_add(digit));
            }
            'h' | 'm' | 's' => {
                let Some(v) = value.take() else { return 0 };
                let unit = match ch {
                    'h' => 3_600_000,
                    'm' => 60_000,
                    _ => 1_000,
                };
                total = total.saturating_add(v.saturating_mul(unit));
                matched = true;
            }
            c if c.is_whitespace() => {
                // A bare number followed by whitespace has no unit.
                if value.is_some() {
                    return 0;
                }
            }
            _ => return 0,
        }
    }

    // Trailing digits without a unit invalidate the whole expression.
    if value.is_some() || !matched {
        return 0;
    }
    total
}
