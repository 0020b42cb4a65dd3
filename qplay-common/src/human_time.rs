//! Human-readable time formatting
//!
//! Consistent display of track lengths, progress and queue ETAs.

use std::time::Duration;

/// Values below this many seconds use the short `M:SS` form
const SHORT_FORMAT_MAX: u64 = 3600;
/// Values below this many seconds use `H:MM:SS`, above it `Dd H:MM:SS`
const LONG_FORMAT_MAX: u64 = 86_400;

/// Format a duration for display.
///
/// - Short format (`M:SS`): under one hour
/// - Long format (`H:MM:SS`): under one day
/// - Extended format (`Dd H:MM:SS`): one day and above
///
/// Sub-second precision is truncated.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use qplay_common::human_time::format_human_time;
///
/// assert_eq!(format_human_time(Duration::from_secs(45)), "0:45");
/// assert_eq!(format_human_time(Duration::from_secs(330)), "5:30");
/// assert_eq!(format_human_time(Duration::from_secs(3661)), "1:01:01");
/// assert_eq!(format_human_time(Duration::from_secs(90_000)), "1d 1:00:00");
/// ```
pub fn format_human_time(duration: Duration) -> String {
    let total = duration.as_secs();

    if total < SHORT_FORMAT_MAX {
        format!("{}:{:02}", total / 60, total % 60)
    } else if total < LONG_FORMAT_MAX {
        let hours = total / 3600;
        let mins = (total % 3600) / 60;
        let secs = total % 60;
        format!("{}:{:02}:{:02}", hours, mins, secs)
    } else {
        let days = total / LONG_FORMAT_MAX;
        let rest = total % LONG_FORMAT_MAX;
        format!(
            "{}d {}:{:02}:{:02}",
            days,
            rest / 3600,
            (rest % 3600) / 60,
            rest % 60
        )
    }
}

/// Format an estimate, marking lower bounds.
///
/// When `exact` is false the estimate only counts entries with a known
/// duration, so it is shown as a minimum (`>= 5:30`).
pub fn format_eta(duration: Duration, exact: bool) -> String {
    if exact {
        format_human_time(duration)
    } else {
        format!(">= {}", format_human_time(duration))
    }
}

/// Format a progress pair as `elapsed / total`.
///
/// Unknown totals render as `--:--`.
pub fn format_progress(elapsed: Duration, total: Option<Duration>) -> String {
    match total {
        Some(total) => format!(
            "{} / {}",
            format_human_time(elapsed),
            format_human_time(total)
        ),
        None => format!("{} / --:--", format_human_time(elapsed)),
    }
}
