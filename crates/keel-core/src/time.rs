//! Timestamp arithmetic shared by the stores and services.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// `now + duration`, clamped to the largest representable timestamp.
pub fn saturating_add(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_add_clamps() {
        let now = Utc::now();
        assert_eq!(saturating_add(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            saturating_add(now, Duration::from_secs(60)),
            now + chrono::Duration::seconds(60)
        );
    }
}
