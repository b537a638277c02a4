//! Duration strings: `"250ms"`, `"30s"`, `"5m"`, `"1h"`.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use crate::{ConfigError, ConfigResult};

static DURATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*(ms|s|m|h)\s*$").unwrap());

/// Parse a duration string, naming `field` in the error.
pub fn parse_duration(field: &str, value: &str) -> ConfigResult<Duration> {
    let invalid = |message: String| ConfigError::InvalidValue {
        field: field.to_string(),
        message,
    };

    let caps = DURATION_REGEX
        .captures(value)
        .ok_or_else(|| invalid(format!("expected a duration like \"5m\", got {:?}", value)))?;

    let amount: u64 = caps[1]
        .parse()
        .map_err(|_| invalid(format!("duration out of range: {}", value)))?;

    let millis_per_unit = match &caps[2] {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        _ => unreachable!("regex only admits known units"),
    };

    amount
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| invalid(format!("duration out of range: {}", value)))
}
