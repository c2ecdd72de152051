use super::*;
use chrono::TimeZone;

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

fn next(expression: &str, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    calculate_next_run(expression, from).unwrap()
}

#[test]
fn test_daily_midnight_is_strictly_future() {
    assert_eq!(next("0 0 * * *", at(2024, 3, 15, 13, 45, 30)), Some(at(2024, 3, 16, 0, 0, 0)));
    assert_eq!(next("0 0 * * *", at(2024, 3, 16, 0, 0, 0)), Some(at(2024, 3, 17, 0, 0, 0)));
    assert_eq!(next("0 0 * * *", at(2024, 12, 31, 23, 59, 59)), Some(at(2025, 1, 1, 0, 0, 0)));
}

#[test]
fn test_step_minutes() {
    assert_eq!(next("*/5 * * * *", at(2024, 6, 1, 10, 2, 0)), Some(at(2024, 6, 1, 10, 5, 0)));
    assert_eq!(next("*/5 * * * *", at(2024, 6, 1, 10, 5, 0)), Some(at(2024, 6, 1, 10, 10, 0)));
    assert_eq!(next("*/15 * * * *", at(2024, 6, 1, 23, 50, 0)), Some(at(2024, 6, 2, 0, 0, 0)));
}

#[test]
fn test_ranges_lists_and_steps() {
    let expr = CronExpression::parse("10-20/5,45 8-9 * * *").unwrap();
    assert!(expr.matches(&at(2024, 1, 1, 8, 10, 0)));
    assert!(expr.matches(&at(2024, 1, 1, 8, 15, 0)));
    assert!(expr.matches(&at(2024, 1, 1, 9, 45, 0)));
    assert!(!expr.matches(&at(2024, 1, 1, 8, 12, 0)));
    assert!(!expr.matches(&at(2024, 1, 1, 10, 10, 0)));

    let offset = CronExpression::parse("5/20 * * * *").unwrap();
    assert!(offset.matches(&at(2024, 1, 1, 0, 5, 0)));
    assert!(offset.matches(&at(2024, 1, 1, 0, 45, 0)));
    assert!(!offset.matches(&at(2024, 1, 1, 0, 20, 0)));

    // Seconds are ignored when matching.
    assert!(offset.matches(&at(2024, 1, 1, 0, 25, 42)));
}

#[test]
fn test_weekdays() {
    // 2024-06-01 is a Saturday.
    assert_eq!(next("0 9 * * 1-5", at(2024, 6, 1, 12, 0, 0)), Some(at(2024, 6, 3, 9, 0, 0)));
    assert_eq!(next("30 6 * * 0", at(2024, 6, 1, 12, 0, 0)), Some(at(2024, 6, 2, 6, 30, 0)));
}

#[test]
fn test_sunday_as_seven() {
    let zero = CronExpression::parse("0 12 * * 0").unwrap();
    let seven = CronExpression::parse("0 12 * * 7").unwrap();
    let sunday = at(2024, 6, 2, 12, 0, 0);
    assert!(zero.matches(&sunday));
    assert!(seven.matches(&sunday));
    let from = at(2024, 6, 1, 0, 0, 0);
    assert_eq!(zero.next_after(from), seven.next_after(from));
}

#[test]
fn test_day_of_week_ranges_and_steps() {
    // 2024-06-03 is a Monday.
    let day = |d: u32| at(2024, 6, d, 12, 0, 0);

    let weekend = CronExpression::parse("0 12 * * 5-7").unwrap();
    let fired: Vec<u32> = (3..=9).filter(|d| weekend.matches(&day(*d))).collect();
    assert_eq!(fired, vec![7, 8, 9]);

    // 1, 3, 5 and 7: Monday, Wednesday, Friday and Sunday.
    let odd = CronExpression::parse("0 12 * * 1/2").unwrap();
    let fired: Vec<u32> = (3..=9).filter(|d| odd.matches(&day(*d))).collect();
    assert_eq!(fired, vec![3, 5, 7, 9]);

    let even = CronExpression::parse("0 12 * * */2").unwrap();
    let fired: Vec<u32> = (3..=9).filter(|d| even.matches(&day(*d))).collect();
    assert_eq!(fired, vec![4, 6, 8, 9]);

    let named = CronExpression::parse("0 12 * * MON-FRI").unwrap();
    let fired: Vec<u32> = (3..=9).filter(|d| named.matches(&day(*d))).collect();
    assert_eq!(fired, vec![3, 4, 5, 6, 7]);
}

#[test]
fn test_fields_combine_with_and() {
    // The 13th only when it falls on a Friday.
    let expr = CronExpression::parse("0 0 13 * 5").unwrap();
    assert_eq!(expr.next_after(at(2024, 1, 1, 0, 0, 0)), Some(at(2024, 9, 13, 0, 0, 0)));
}

#[test]
fn test_leap_day_and_impossible_date() {
    assert_eq!(next("0 0 29 2 *", at(2023, 3, 1, 0, 0, 0)), Some(at(2024, 2, 29, 0, 0, 0)));
    assert_eq!(next("0 0 31 2 *", at(2024, 1, 1, 0, 0, 0)), None);
}

#[test]
fn test_presets() {
    let from = at(2024, 6, 15, 10, 30, 0);
    assert_eq!(next("@hourly", from), Some(at(2024, 6, 15, 11, 0, 0)));
    assert_eq!(next("@daily", from), Some(at(2024, 6, 16, 0, 0, 0)));
    assert_eq!(next("@midnight", from), next("@daily", from));
    assert_eq!(next("@weekly", from), Some(at(2024, 6, 16, 0, 0, 0)));
    assert_eq!(next("@monthly", from), Some(at(2024, 7, 1, 0, 0, 0)));
    assert_eq!(next("@yearly", from), Some(at(2025, 1, 1, 0, 0, 0)));
    assert_eq!(next("@annually", from), next("@yearly", from));
}

#[test]
fn test_invalid_expressions() {
    for expression in [
        "",
        "* * * *",
        "* * * * * *",
        "60 * * * *",
        "* 24 * * *",
        "* * 0 * *",
        "* * * 13 *",
        "* * * * 8",
        "* * * * 2-9",
        "* * * * 1/0",
        "*/0 * * * *",
        "5-1 * * * *",
        "a * * * *",
        "1- * * * *",
        "@fortnightly",
    ] {
        let result = CronExpression::parse(expression);
        assert!(
            matches!(result, Err(ScheduleError::CronParse { .. })),
            "expected '{}' to be rejected",
            expression
        );
    }
}

#[test]
fn test_display_and_from_str() {
    let expr: CronExpression = " 0 0 * * * ".parse().unwrap();
    assert_eq!(expr.to_string(), "0 0 * * *");
    assert_eq!(expr.as_str(), "0 0 * * *");
}
