use chrono::{NaiveDateTime, Timelike};

/// The house timezone — every human-facing stamp renders in it.
pub const HOUSE_TZ: chrono_tz::Tz = chrono_tz::America::Los_Angeles;

/// Environmental context fetched from Redis, populated by Pulse.
///
/// All fields degrade independently to `None` — a missing key or a dead
/// Redis never blocks a request.
#[derive(Debug, Clone, Default)]
pub struct HudData {
    pub weather: Option<String>,
    pub calendar: Option<String>,
    pub todos: Option<String>,
    pub to_self: Option<String>,
    pub to_self_time: Option<String>,
    pub today_so_far: Option<String>,
    pub today_so_far_time: Option<String>,
}

/// One conversation-period summary from the `cortex.summaries` table.
/// `period_start`/`period_end` form a half-open interval in house-local time.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Summary {
    pub period_start: NaiveDateTime,
    pub period_end: NaiveDateTime,
    pub summary: String,
}

impl Summary {
    /// A period starting late evening or overnight is a "night" period.
    pub fn is_night(&self) -> bool {
        let hour = self.period_start.hour();
        hour >= 22 || hour < 6
    }

    /// Render the summary with its section header.
    ///
    /// Day:   `## This part is a summary of the events of Friday Jul 31 2026`
    /// Night: `## This part is a summary of the events of Friday night Jul 31-1 2026`
    pub fn render(&self) -> String {
        let header = if self.is_night() {
            format!(
                "## This part is a summary of the events of {} night {} {}-{} {}",
                self.period_start.format("%A"),
                self.period_start.format("%b"),
                self.period_start.format("%-d"),
                self.period_end.format("%-d"),
                self.period_start.format("%Y"),
            )
        } else {
            format!(
                "## This part is a summary of the events of {}",
                self.period_start.format("%A %b %-d %Y"),
            )
        };
        format!("{}\n\n{}", header, self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn day_period_renders_full_date() {
        let s = Summary {
            period_start: at(2026, 7, 31, 6),
            period_end: at(2026, 7, 31, 22),
            summary: "A quiet day.".to_string(),
        };
        assert!(!s.is_night());
        assert_eq!(
            s.render(),
            "## This part is a summary of the events of Friday Jul 31 2026\n\nA quiet day."
        );
    }

    #[test]
    fn night_period_renders_day_range() {
        let s = Summary {
            period_start: at(2026, 7, 31, 22),
            period_end: at(2026, 8, 1, 6),
            summary: "Slept through it.".to_string(),
        };
        assert!(s.is_night());
        assert_eq!(
            s.render(),
            "## This part is a summary of the events of Friday night Jul 31-1 2026\n\nSlept through it."
        );
    }

    #[test]
    fn early_morning_start_counts_as_night() {
        let s = Summary {
            period_start: at(2026, 8, 1, 2),
            period_end: at(2026, 8, 1, 6),
            summary: "x".to_string(),
        };
        assert!(s.is_night());
    }
}
