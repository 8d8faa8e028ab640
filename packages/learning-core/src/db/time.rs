use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

pub const MS_PER_DAY: i64 = 86_400_000;

pub fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

pub fn opt_from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}

pub fn days_between_ms(from: i64, to: i64) -> f64 {
    (to - from) as f64 / MS_PER_DAY as f64
}

/// [start, end) of the UTC day containing `at`
pub fn utc_day_bounds(at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day_start(at.date_naive());
    (start, start + Duration::days(1))
}

pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ms_round_trip() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        assert_eq!(from_ms(to_ms(at)), at);
    }

    #[test]
    fn test_day_bounds() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        let (start, end) = utc_day_bounds(at);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap());
        assert_eq!(end - start, Duration::days(1));
    }

    proptest! {
        #[test]
        fn prop_day_bounds_contain_instant(ms in 0i64..4_102_444_800_000) {
            let at = from_ms(ms);
            let (start, end) = utc_day_bounds(at);
            prop_assert!(start <= at && at < end);
            prop_assert_eq!(to_ms(start) % MS_PER_DAY, 0);
            prop_assert_eq!(to_ms(end) - to_ms(start), MS_PER_DAY);
        }
    }
}
