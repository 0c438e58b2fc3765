use std::time::Duration;

/// Parse a duration such as `30s`, `5min` or `1.5h`. A bare number is treated as seconds.
pub(crate) fn parse_duration_str(value: &str) -> Option<Duration> {
    const UNITS: &[(&[&str], f64)] = &[
        (&["hours", "hour", "hrs", "hr", "h"], 60.0 * 60.0),
        (&["minutes", "minute", "mins", "min", "m"], 60.0),
        (&["seconds", "second", "secs", "sec", "s"], 1.0),
    ];

    let value = value.trim();
    for (suffixes, scale) in UNITS {
        if let Some(amount) = suffixes.iter().find_map(|suffix| value.strip_suffix(suffix)) {
            return Some(Duration::from_secs_f64(amount.trim().parse::<f64>().ok()? * scale));
        }
    }
    value.parse::<f64>().ok().map(Duration::from_secs_f64)
}

pub(crate) fn parse_bool_str(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_bool_env(name: &str) -> anyhow::Result<Option<bool>> {
    match std::env::var(name) {
        Ok(value) => Ok(Some(
            parse_bool_str(&value)
                .ok_or_else(|| anyhow::format_err!("Invalid value for {name}: {value}"))?,
        )),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => anyhow::bail!("error reading {name}: {e}"),
    }
}

pub(crate) fn parse_f64_env(name: &str) -> anyhow::Result<Option<f64>> {
    match std::env::var(name) {
        Ok(value) => Ok(Some(
            value
                .trim()
                .parse()
                .map_err(|e| anyhow::format_err!("Invalid value for {name}: {value} ({e})"))?,
        )),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => anyhow::bail!("error reading {name}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration_str("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration_str("2 min"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration_str("1.5h"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration_str("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration_str("soon"), None);
    }

    #[test]
    fn bools() {
        assert_eq!(parse_bool_str("true"), Some(true));
        assert_eq!(parse_bool_str("0"), Some(false));
        assert_eq!(parse_bool_str("maybe"), None);
    }
}
