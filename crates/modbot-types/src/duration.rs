//! Human duration strings ("3d1M", "2 weeks 1 day") as calendar-aware
//! offsets.
//!
//! Years and months shift by calendar arithmetic (end-of-month dates clamp);
//! weeks and below are fixed-length. Units must appear in descending order
//! of magnitude and the whole string must parse; `M` is minutes, `m` is
//! months.

use chrono::{DateTime, Duration, Months, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)^
        (?:(?P<years>\d+)\ ?(?:years|year|Y|y)\ ?)?
        (?:(?P<months>\d+)\ ?(?:months|month|m)\ ?)?
        (?:(?P<weeks>\d+)\ ?(?:weeks|week|W|w)\ ?)?
        (?:(?P<days>\d+)\ ?(?:days|day|D|d)\ ?)?
        (?:(?P<hours>\d+)\ ?(?:hours|hour|H|h)\ ?)?
        (?:(?P<minutes>\d+)\ ?(?:minutes|minute|M)\ ?)?
        (?:(?P<seconds>\d+)\ ?(?:seconds|second|S|s))?
        $",
    )
    .expect("duration regex is valid")
});

/// A parsed duration offset. Apply it with [`HumanDuration::after`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HumanDuration {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl HumanDuration {
    /// The point in time this offset lands on when applied to `start`.
    /// `None` when the result falls outside chrono's representable range.
    pub fn after(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let months = self.years.checked_mul(12)?.checked_add(self.months)?;
        let shifted = start.checked_add_months(Months::new(months))?;
        let fixed = Duration::try_weeks(i64::from(self.weeks))?
            .checked_add(&Duration::try_days(i64::from(self.days))?)?
            .checked_add(&Duration::try_hours(i64::from(self.hours))?)?
            .checked_add(&Duration::try_minutes(i64::from(self.minutes))?)?
            .checked_add(&Duration::try_seconds(i64::from(self.seconds))?)?;
        shifted.checked_add_signed(fixed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{0}` is not a valid duration string")]
pub struct InvalidDuration(pub String);

/// Parse a duration string such as `3d1M` or `1 year 2 months`.
///
/// At least one unit is required and units may not repeat or appear out of
/// order.
pub fn parse_duration(input: &str) -> Result<HumanDuration, InvalidDuration> {
    let caps = DURATION_RE
        .captures(input)
        .ok_or_else(|| InvalidDuration(input.to_string()))?;

    let mut any = false;
    let mut group = |name: &str| -> Result<u32, InvalidDuration> {
        match caps.name(name) {
            Some(m) => {
                any = true;
                m.as_str()
                    .parse()
                    .map_err(|_| InvalidDuration(input.to_string()))
            }
            None => Ok(0),
        }
    };

    let parsed = HumanDuration {
        years: group("years")?,
        months: group("months")?,
        weeks: group("weeks")?,
        days: group("days")?,
        hours: group("hours")?,
        minutes: group("minutes")?,
        seconds: group("seconds")?,
    };

    if !any {
        return Err(InvalidDuration(input.to_string()));
    }
    Ok(parsed)
}

/// Convenience wrapper: the expiry `input` ahead of now.
pub fn parse_expiry(input: &str) -> Result<DateTime<Utc>, InvalidDuration> {
    parse_duration(input)?
        .after(Utc::now())
        .ok_or_else(|| InvalidDuration(input.to_string()))
}
