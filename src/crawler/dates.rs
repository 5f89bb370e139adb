//! Parsing of the "last updated" strings found on article pages.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m-%d-%Y",
    "%m/%d/%Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%B %d, %Y",
];

/// Parse a page timestamp into UTC. Values without a zone are taken as UTC.
pub fn parse_updated(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim().trim_end_matches(" UTC").trim_end_matches(" GMT").trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.and_utc());
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn accepts_the_formats_seen_on_article_pages() {
        let midnight = Utc.with_ymd_and_hms(2024, 3, 7, 0, 0, 0).unwrap();

        assert_eq!(parse_updated("03-07-2024"), Some(midnight));
        assert_eq!(parse_updated("03/07/2024"), Some(midnight));
        assert_eq!(parse_updated("2024-03-07"), Some(midnight));
        assert_eq!(parse_updated("7 Mar 2024"), Some(midnight));
        assert_eq!(parse_updated("March 7, 2024"), Some(midnight));
        assert_eq!(
            parse_updated("2024-03-07 14:30:05"),
            Some(Utc.with_ymd_and_hms(2024, 3, 7, 14, 30, 5).unwrap())
        );
        assert_eq!(
            parse_updated("2024-03-07T16:30:05+02:00"),
            Some(Utc.with_ymd_and_hms(2024, 3, 7, 14, 30, 5).unwrap())
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_updated(""), None);
        assert_eq!(parse_updated("yesterday"), None);
        assert_eq!(parse_updated("13-45-2024"), None);
    }
}
