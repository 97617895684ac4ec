use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};

/// Korea Standard Time, fixed UTC+9 with no DST.
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("KST offset")
}

pub fn now_kst() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&kst())
}

pub fn today_kst() -> chrono::NaiveDate {
    now_kst().date_naive()
}

pub fn is_weekend(date: chrono::NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Parses a "HH:MM" wall-clock string.
pub fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M").ok()
}

/// Hours elapsed between two instants counting only Monday-Friday, the
/// measure used for pattern holding-time limits.
pub fn business_hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    if start >= end {
        return 0.0;
    }
    let tz = kst();
    let mut cursor = start.with_timezone(&tz);
    let end = end.with_timezone(&tz);
    let mut total_hours = 0.0;

    while cursor < end {
        let day_end = (cursor.date_naive() + chrono::Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .expect("midnight")
            .and_local_timezone(tz)
            .single()
            .expect("unambiguous in fixed offset");
        let segment_end = day_end.min(end);
        if !is_weekend(cursor.date_naive()) {
            total_hours += (segment_end - cursor).num_seconds() as f64 / 3600.0;
        }
        cursor = segment_end;
    }
    total_hours
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn kst_dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        kst()
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn same_day_span_is_wall_clock() {
        // Monday 2024-03-04.
        let start = kst_dt(2024, 3, 4, 9, 0);
        let end = kst_dt(2024, 3, 4, 15, 30);
        assert!((business_hours_between(start, end) - 6.5).abs() < 1e-9);
    }

    #[test]
    fn weekend_is_excluded_entirely() {
        // Friday 15:00 -> Monday 10:00 spans 67 wall hours but only
        // 9h Friday + 10h Monday of business time.
        let start = kst_dt(2024, 3, 1, 15, 0);
        let end = kst_dt(2024, 3, 4, 10, 0);
        assert!((business_hours_between(start, end) - 19.0).abs() < 1e-9);
    }

    #[test]
    fn pure_weekend_span_is_zero() {
        let start = kst_dt(2024, 3, 2, 9, 0); // Saturday
        let end = kst_dt(2024, 3, 3, 18, 0); // Sunday
        assert_eq!(business_hours_between(start, end), 0.0);
    }

    #[test]
    fn inverted_range_is_zero() {
        let start = kst_dt(2024, 3, 4, 15, 0);
        let end = kst_dt(2024, 3, 4, 9, 0);
        assert_eq!(business_hours_between(start, end), 0.0);
    }
}
