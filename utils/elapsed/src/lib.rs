//! Compact human-readable durations for status output.

use std::time::Duration;

/// Format an elapsed duration the way `forage list`/`forage status` show
/// container uptime: seconds below a minute, whole minutes below an hour,
/// hours+minutes below a day, days+hours beyond that.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        return format!("{secs}s");
    }
    let mins = secs / 60;
    if mins < 60 {
        return format!("{mins}m");
    }
    let hours = mins / 60;
    if hours < 24 {
        return format!("{hours}h {rem}m", rem = mins % 60);
    }
    let days = hours / 24;
    format!("{days}d {rem}h", rem = hours % 24)
}

#[cfg(test)]
mod tests {
    use super::format_elapsed;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn seconds_below_a_minute() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "0s");
        assert_eq!(format_elapsed(Duration::from_secs(30)), "30s");
        assert_eq!(format_elapsed(Duration::from_secs(59)), "59s");
    }

    #[test]
    fn minutes_below_an_hour() {
        assert_eq!(format_elapsed(Duration::from_secs(60)), "1m");
        assert_eq!(format_elapsed(Duration::from_secs(45 * 60)), "45m");
        assert_eq!(format_elapsed(Duration::from_secs(59 * 60 + 59)), "59m");
    }

    #[test]
    fn hours_below_a_day() {
        assert_eq!(format_elapsed(Duration::from_secs(3600)), "1h 0m");
        assert_eq!(
            format_elapsed(Duration::from_secs(2 * 3600 + 30 * 60)),
            "2h 30m"
        );
        assert_eq!(
            format_elapsed(Duration::from_secs(23 * 3600 + 59 * 60)),
            "23h 59m"
        );
    }

    #[test]
    fn days_and_hours() {
        assert_eq!(format_elapsed(Duration::from_secs(24 * 3600)), "1d 0h");
        assert_eq!(
            format_elapsed(Duration::from_secs(3 * 24 * 3600 + 5 * 3600)),
            "3d 5h"
        );
    }
}
