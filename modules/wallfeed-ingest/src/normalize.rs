//! Text and date normalization for scraped wall posts.
//!
//! Dates on the mobile wall are rendered for an English locale in Moscow
//! time and are often relative ("2 hours ago", "today at 3:40 pm"). They are
//! resolved against the capture timestamp and returned in UTC, whole seconds.

use std::sync::LazyLock;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SubsecRound,
    TimeZone, Utc,
};
use regex::Regex;

use crate::error::{IngestError, Result};

const MOSCOW_OFFSET_SECS: i32 = 3 * 3600;

static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static RE_AGO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+|an?|one|two|three|four|five|six|seven|eight|nine|ten) (second|minute|hour)s? ago$")
        .unwrap()
});

static RE_DAY_AT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(today|yesterday) at (\d{1,2}):(\d{2})(?: ?(am|pm))?$").unwrap()
});

static RE_ABSOLUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{1,2}) ([a-z]{3})[a-z]*\.?(?: (\d{4}))?(?: at (\d{1,2}):(\d{2})(?: ?(am|pm))?)?$",
    )
    .unwrap()
});

/// Collapse runs of whitespace (including non-breaking spaces) and trim.
pub fn normalize_text(raw: &str) -> String {
    RE_WHITESPACE.replace_all(raw, " ").trim().to_string()
}

/// Resolve a wall date string to UTC.
pub fn parse_wall_date(raw: &str, relative_to: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let moscow = FixedOffset::east_opt(MOSCOW_OFFSET_SECS)
        .ok_or_else(|| IngestError::Parse("invalid Moscow offset".into()))?;
    let relative_to = relative_to.trunc_subsecs(0);
    let cleaned = normalize_text(raw).to_lowercase();
    let fail = || IngestError::Parse(format!("unrecognized date {raw:?}"));

    if cleaned == "just now" {
        return Ok(relative_to);
    }

    if let Some(caps) = RE_AGO.captures(&cleaned) {
        let amount = number_word(&caps[1]).ok_or_else(fail)?;
        let delta = match &caps[2] {
            "second" => Duration::try_seconds(amount),
            "minute" => Duration::try_minutes(amount),
            _ => Duration::try_hours(amount),
        }
        .ok_or_else(fail)?;
        return relative_to.checked_sub_signed(delta).ok_or_else(fail);
    }

    let local_now = relative_to.with_timezone(&moscow);

    if let Some(caps) = RE_DAY_AT.captures(&cleaned) {
        let mut date = local_now.date_naive();
        if &caps[1] == "yesterday" {
            date = date.pred_opt().ok_or_else(fail)?;
        }
        let time = clock_time(&caps[2], &caps[3], caps.get(4).map(|m| m.as_str()))
            .ok_or_else(fail)?;
        return to_utc(&moscow, date.and_time(time)).ok_or_else(fail);
    }

    if let Some(caps) = RE_ABSOLUTE.captures(&cleaned) {
        let day: u32 = caps[1].parse().map_err(|_| fail())?;
        let month = month_number(&caps[2]).ok_or_else(fail)?;
        let time = match (caps.get(4), caps.get(5)) {
            (Some(h), Some(m)) => {
                clock_time(h.as_str(), m.as_str(), caps.get(6).map(|m| m.as_str()))
                    .ok_or_else(fail)?
            }
            _ => NaiveTime::MIN,
        };

        if let Some(year) = caps.get(3) {
            let year: i32 = year.as_str().parse().map_err(|_| fail())?;
            let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(fail)?;
            return to_utc(&moscow, date.and_time(time)).ok_or_else(fail);
        }

        // Year omitted means the current year, unless that lands in the future.
        let year = local_now.year();
        let candidate = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| to_utc(&moscow, d.and_time(time)));
        if let Some(dt) = candidate {
            if dt <= relative_to + Duration::days(1) {
                return Ok(dt);
            }
        }
        let date = NaiveDate::from_ymd_opt(year - 1, month, day).ok_or_else(fail)?;
        return to_utc(&moscow, date.and_time(time)).ok_or_else(fail);
    }

    Err(fail())
}

fn to_utc(zone: &FixedOffset, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    zone.from_local_datetime(&local)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn number_word(word: &str) -> Option<i64> {
    let n = match word {
        "a" | "an" | "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        digits => return digits.parse().ok(),
    };
    Some(n)
}

fn month_number(abbrev: &str) -> Option<u32> {
    let n = match abbrev {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(n)
}

/// 12-hour clock when a meridiem is present, 24-hour otherwise.
fn clock_time(hour: &str, minute: &str, meridiem: Option<&str>) -> Option<NaiveTime> {
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    let hour = match meridiem {
        Some(_) if hour == 0 || hour > 12 => return None,
        Some("am") => hour % 12,
        Some(_) => hour % 12 + 12,
        None => hour,
    };
    NaiveTime::from_hms_opt(hour, minute, 0)
}
