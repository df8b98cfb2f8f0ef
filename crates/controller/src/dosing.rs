//! Water dosing arithmetic: minutes of valve-open time ⇄ millimetres of
//! water over a station's irrigated area.
//!
//! 1 L spread over 1 m² is 1 mm, so a station delivering `flow` L/min over
//! `area` m² applies `flow / area` mm per minute.

use chrono::NaiveDate;

use crate::clock::Timestamp;
use crate::schedule::MonthPlan;

/// Absorbs float noise so an exact multiple of `mm_per_minute` does not
/// round up to an extra minute.
const CEIL_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StationCalibration {
    pub flow_rate_l_per_min: f64,
    pub area_m2: f64,
}

impl StationCalibration {
    pub fn mm_per_minute(&self) -> f64 {
        mm_per_minute(self.flow_rate_l_per_min, self.area_m2)
    }
}

/// An unset (zero) area counts as 1 m².
pub fn effective_area(area_m2: f64) -> f64 {
    if area_m2 > 0.0 {
        area_m2
    } else {
        1.0
    }
}

pub fn mm_per_minute(flow_rate_l_per_min: f64, area_m2: f64) -> f64 {
    flow_rate_l_per_min / effective_area(area_m2)
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Whole calendar days between the last watering-relevant event and `today`.
pub fn days_since(last_event: Option<&Timestamp>, today: NaiveDate) -> Option<i64> {
    last_event.map(|t| (today - t.date_naive()).num_days())
}

/// Whether `interval_days` have passed since `last_event`. No recorded
/// event means watering is due.
pub fn interval_elapsed(interval_days: u32, last_event: Option<&Timestamp>, today: NaiveDate) -> bool {
    match days_since(last_event, today) {
        Some(days) => days >= i64::from(interval_days),
        None => true,
    }
}

/// Millimetres each station should receive today under `plan`.
///
/// All zero when the month has no start times or the interval since the
/// last rain/sprinkle has not elapsed.
pub fn compute_targets(
    plan: &MonthPlan,
    calibrations: &[StationCalibration],
    last_event: Option<&Timestamp>,
    today: NaiveDate,
) -> Vec<f64> {
    let mut target = vec![0.0; calibrations.len()];

    if !plan.has_start_times() || !interval_elapsed(plan.interval_days, last_event, today) {
        return target;
    }

    let occurrences = plan.occurrences() as f64;
    for (i, cal) in calibrations.iter().enumerate() {
        let station = (i + 1) as u8;
        let total_minutes = f64::from(plan.minutes_for(station)) * occurrences;
        if total_minutes > 0.0 {
            target[i] = round2(cal.mm_per_minute() * total_minutes);
        }
    }
    target
}

/// Below this a station counts as fully watered; per-second accrual sums
/// never land exactly on the target.
pub const MM_TOLERANCE: f64 = 1e-6;

/// Water still owed after what was applied and what rain covers.
pub fn remaining_mm(target_mm: f64, applied_mm: f64, rain_mm: f64) -> f64 {
    let remaining = target_mm - (applied_mm + rain_mm);
    if remaining > MM_TOLERANCE {
        remaining
    } else {
        0.0
    }
}

/// Rounded remaining depth, as published per station.
pub fn forecasted_sprinkle(target_mm: f64, applied_mm: f64, rain_mm: f64) -> f64 {
    round2(remaining_mm(target_mm, applied_mm, rain_mm))
}

/// Valve-open minutes needed to deliver what is still owed, rounded up.
pub fn minutes_to_apply(
    target_mm: f64,
    applied_mm: f64,
    forecast_rain_mm: f64,
    flow_rate_l_per_min: f64,
    area_m2: f64,
) -> u32 {
    let remaining = remaining_mm(target_mm, applied_mm, forecast_rain_mm);
    let rate = mm_per_minute(flow_rate_l_per_min, area_m2);
    if remaining <= 0.0 || rate <= 0.0 || !rate.is_finite() {
        return 0;
    }
    (remaining / rate - CEIL_EPSILON).ceil().max(0.0) as u32
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ts;
    use chrono_tz::Tz;

    fn cal(flow: f64, area: f64) -> StationCalibration {
        StationCalibration {
            flow_rate_l_per_min: flow,
            area_m2: area,
        }
    }

    fn plan(interval: u32, hours: &[&str], minutes: &[(u8, u32)]) -> MonthPlan {
        MonthPlan {
            interval_days: interval,
            start_times: hours.iter().map(|h| h.to_string()).collect(),
            station_minutes: minutes.iter().copied().collect(),
        }
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    // -- compute_targets --------------------------------------------------

    #[test]
    fn single_station_scenario() {
        let p = plan(1, &["06:00"], &[(1, 10)]);
        let last = ts(Tz::UTC, "2024-06-08 06:10:00");
        let t = compute_targets(&p, &[cal(12.0, 10.0)], Some(&last), day("2024-06-10"));
        assert_eq!(t, vec![12.0]);
    }

    #[test]
    fn occurrences_multiply_minutes() {
        let p = plan(0, &["06:00", "20:00"], &[(1, 5), (2, 0)]);
        let t = compute_targets(&p, &[cal(10.0, 5.0), cal(10.0, 5.0)], None, day("2024-06-10"));
        assert_eq!(t, vec![20.0, 0.0]);
    }

    #[test]
    fn zero_area_treated_as_one_square_metre() {
        let p = plan(0, &["06:00"], &[(1, 3)]);
        let t = compute_targets(&p, &[cal(4.0, 0.0)], None, day("2024-06-10"));
        assert_eq!(t, vec![12.0]);
    }

    #[test]
    fn no_start_times_means_no_target() {
        let p = plan(0, &[], &[(1, 30)]);
        let t = compute_targets(&p, &[cal(12.0, 10.0)], None, day("2024-06-10"));
        assert_eq!(t, vec![0.0]);
    }

    #[test]
    fn interval_not_elapsed_means_no_target() {
        let p = plan(2, &["06:00"], &[(1, 10), (2, 10)]);
        let yesterday = ts(Tz::UTC, "2024-06-09 23:30:00");
        let t = compute_targets(
            &p,
            &[cal(12.0, 10.0), cal(12.0, 10.0)],
            Some(&yesterday),
            day("2024-06-10"),
        );
        assert_eq!(t, vec![0.0, 0.0]);
    }

    #[test]
    fn interval_counts_calendar_days_not_hours() {
        // 25 hours ago but two calendar dates back: due under a 2-day interval.
        let p = plan(2, &["06:00"], &[(1, 10)]);
        let last = ts(Tz::UTC, "2024-06-08 23:00:00");
        let t = compute_targets(&p, &[cal(12.0, 10.0)], Some(&last), day("2024-06-10"));
        assert_eq!(t, vec![12.0]);
    }

    #[test]
    fn targets_rounded_to_two_decimals() {
        let p = plan(0, &["06:00"], &[(1, 7)]);
        let t = compute_targets(&p, &[cal(10.0, 3.0)], None, day("2024-06-10"));
        assert_eq!(t, vec![23.33]);
    }

    // -- minutes_to_apply -------------------------------------------------

    #[test]
    fn minutes_round_trip_from_target() {
        for &(flow, area, minutes) in &[
            (12.0, 10.0, 10u32),
            (7.5, 3.0, 4),
            (30.0, 1.0, 60),
            (1.0, 25.0, 13),
            (12.0, 0.0, 2),
        ] {
            let mm = mm_per_minute(flow, area) * f64::from(minutes);
            assert_eq!(
                minutes_to_apply(mm, 0.0, 0.0, flow, area),
                minutes,
                "flow={flow} area={area}"
            );
        }
    }

    #[test]
    fn partial_minutes_round_up() {
        // 1.2 mm/min, 2.5 mm owed → 2.08 minutes → 3.
        assert_eq!(minutes_to_apply(2.5, 0.0, 0.0, 12.0, 10.0), 3);
    }

    #[test]
    fn applied_and_rain_reduce_minutes() {
        assert_eq!(minutes_to_apply(12.0, 6.0, 0.0, 12.0, 10.0), 5);
        assert_eq!(minutes_to_apply(12.0, 6.0, 3.6, 12.0, 10.0), 2);
    }

    #[test]
    fn nothing_owed_means_zero_minutes() {
        assert_eq!(minutes_to_apply(12.0, 12.0, 0.0, 12.0, 10.0), 0);
        assert_eq!(minutes_to_apply(12.0, 0.0, 20.0, 12.0, 10.0), 0);
        assert_eq!(minutes_to_apply(0.0, 0.0, 0.0, 12.0, 10.0), 0);
    }

    #[test]
    fn zero_flow_means_zero_minutes() {
        assert_eq!(minutes_to_apply(12.0, 0.0, 0.0, 0.0, 10.0), 0);
    }

    // -- helpers ----------------------------------------------------------

    #[test]
    fn forecasted_sprinkle_clamps_and_rounds() {
        assert_eq!(forecasted_sprinkle(10.0, 2.0, 3.333), 4.67);
        assert_eq!(forecasted_sprinkle(10.0, 8.0, 5.0), 0.0);
    }

    #[test]
    fn days_since_uses_local_dates() {
        let last = ts(chrono_tz::Europe::Lisbon, "2024-06-09 23:59:00");
        assert_eq!(days_since(Some(&last), day("2024-06-10")), Some(1));
        assert_eq!(days_since(None, day("2024-06-10")), None);
    }

    #[test]
    fn no_event_means_interval_elapsed() {
        assert!(interval_elapsed(5, None, day("2024-06-10")));
    }
}
