//! Calendar helpers shared by the fetcher, archive and report writers.

use regex::Regex;
use std::sync::OnceLock;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime};

pub fn parse_iso_date(value: &str) -> Option<Date> {
    let head = value.get(..10)?;
    Date::parse(head, format_description!("[year]-[month]-[day]")).ok()
}

pub fn format_iso_date(date: Date) -> String {
    // The format description is infallible for any valid Date.
    date.format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| date.to_string())
}

pub fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

/// Compact, lexically sortable run id: `20250720T090000Z`.
pub fn run_id(at: OffsetDateTime) -> String {
    let utc = at.to_offset(time::UtcOffset::UTC);
    utc.format(format_description!(
        "[year][month][day]T[hour][minute][second]Z"
    ))
    .unwrap_or_else(|_| utc.unix_timestamp().to_string())
}

/// `date` minus `days`, clamped to the earliest representable date.
pub fn days_before(date: Date, days: u32) -> Date {
    date.checked_sub(time::Duration::days(i64::from(days)))
        .unwrap_or(Date::MIN)
}

pub fn month_label(date: Date) -> String {
    format!("{} {}", date.month(), date.year())
}

/// "July 16, 2025".
pub fn long_date(date: Date) -> String {
    format!("{} {}, {}", date.month(), date.day(), date.year())
}

/// [`long_date`] for a stored ISO date; falls back to the raw string.
pub fn display_date(value: &str) -> String {
    match parse_iso_date(value) {
        Some(date) => long_date(date),
        None if value.trim().is_empty() => "Unknown Date".to_string(),
        None => value.to_string(),
    }
}

fn numeric_mdy() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\D)(\d{1,2})[/\-.](\d{1,2})[/\-.](\d{4})(?:\D|$)").expect("valid regex"))
}

fn numeric_ymd() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\D)(\d{4})[/\-_.]?(\d{2})[/\-_.]?(\d{2})(?:\D|$)").expect("valid regex"))
}

fn month_name() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.?\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})\b",
        )
        .expect("valid regex")
    })
}

/// Finds the first recognizable meeting date in a title or file name.
///
/// Recognized: `MM/DD/YYYY`, `MM-DD-YYYY`, `YYYY-MM-DD`, `YYYY/MM/DD`,
/// `YYYYMMDD` and `Month D, YYYY`.
pub fn find_date(text: &str) -> Option<Date> {
    if let Some(caps) = month_name().captures(text) {
        let month = month_from_prefix(&caps[1])?;
        let year: i32 = caps[3].parse().ok()?;
        let day: u8 = caps[2].parse().ok()?;
        if let Ok(date) = Date::from_calendar_date(year, month, day) {
            return Some(date);
        }
    }
    if let Some(caps) = numeric_ymd().captures(text) {
        if let Some(date) = build_date(caps[1].parse().ok()?, caps[2].parse().ok()?, caps[3].parse().ok()?) {
            return Some(date);
        }
    }
    if let Some(caps) = numeric_mdy().captures(text) {
        if let Some(date) = build_date(caps[3].parse().ok()?, caps[1].parse().ok()?, caps[2].parse().ok()?) {
            return Some(date);
        }
    }
    None
}

fn build_date(year: i32, month: u8, day: u8) -> Option<Date> {
    let month = Month::try_from(month).ok()?;
    Date::from_calendar_date(year, month, day).ok()
}

fn month_from_prefix(prefix: &str) -> Option<Month> {
    let month = match prefix.to_ascii_lowercase().as_str() {
        "jan" => Month::January,
        "feb" => Month::February,
        "mar" => Month::March,
        "apr" => Month::April,
        "may" => Month::May,
        "jun" => Month::June,
        "jul" => Month::July,
        "aug" => Month::August,
        "sep" | "sept" => Month::September,
        "oct" => Month::October,
        "nov" => Month::November,
        "dec" => Month::December,
        _ => return None,
    };
    Some(month)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn days_before_clamps_instead_of_overflowing() {
        assert_eq!(days_before(date!(2025 - 07 - 21), 30), date!(2025 - 06 - 21));
        assert_eq!(days_before(date!(2025 - 07 - 21), u32::MAX), Date::MIN);
    }

    #[test]
    fn finds_dates_in_common_title_shapes() {
        assert_eq!(find_date("City Council Agenda 07/16/2025"), Some(date!(2025 - 07 - 16)));
        assert_eq!(find_date("Minutes 2025-06-02 regular"), Some(date!(2025 - 06 - 02)));
        assert_eq!(find_date("20250714_agenda_City_Council"), Some(date!(2025 - 07 - 14)));
        assert_eq!(
            find_date("Planning Commission Agenda - June 16, 2025"),
            Some(date!(2025 - 06 - 16))
        );
        assert_eq!(find_date("Sept. 3 2024 Special Meeting"), Some(date!(2024 - 09 - 03)));
    }

    #[test]
    fn rejects_impossible_or_missing_dates() {
        assert_eq!(find_date("Agenda 13/45/2025"), None);
        assert_eq!(find_date("Regular Meeting Agenda"), None);
    }

    #[test]
    fn formats_labels_and_run_ids() {
        assert_eq!(month_label(date!(2025 - 06 - 14)), "June 2025");
        assert_eq!(display_date("2025-07-02"), "July 2, 2025");
        assert_eq!(display_date(""), "Unknown Date");
        assert_eq!(run_id(datetime!(2025-07-20 09:00:05 -7)), "20250720T160005Z");
        assert_eq!(parse_iso_date("2025-07-02T19:00:00"), Some(date!(2025 - 07 - 02)));
    }
}
