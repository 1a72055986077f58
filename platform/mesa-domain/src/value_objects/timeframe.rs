#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarLength {
    pub label: String,
    pub length_ms: i64,
}

impl BarLength {
    pub fn parse(value: &str) -> Result<Self, String> {
        let seconds = parse_duration_like_seconds(value)?;
        if seconds <= 0 {
            return Err(format!("bar length must be > 0: {value}"));
        }
        let length_ms = seconds
            .checked_mul(1000)
            .ok_or_else(|| format!("bar length out of range: {value}"))?;
        Ok(Self {
            label: value.trim().to_lowercase(),
            length_ms,
        })
    }
}

pub fn parse_duration_like_seconds(value: &str) -> Result<i64, String> {
    let trimmed = value.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(seconds) = trimmed.parse::<i64>() {
        return Ok(seconds);
    }

    let (number_part, unit) = if let Some(stripped) = trimmed.strip_suffix("min") {
        (stripped, "min")
    } else if let Some(stripped) = trimmed.strip_suffix("sec") {
        (stripped, "sec")
    } else if let Some(stripped) = trimmed.strip_suffix("hour") {
        (stripped, "hour")
    } else if let Some(stripped) = trimmed.strip_suffix("day") {
        (stripped, "day")
    } else {
        trimmed.split_at(trimmed.len().saturating_sub(1))
    };

    let multiplier = match unit {
        "s" | "sec" => 1,
        "m" | "min" => 60,
        "h" | "hour" => 3600,
        "d" | "day" => 86400,
        _ => return Err(format!("unsupported duration unit: {unit}")),
    };

    let number: i64 = number_part
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {value}"))?;
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("duration out of range: {value}"))
}
