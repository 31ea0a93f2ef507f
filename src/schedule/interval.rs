//! Interval scheduling — time-window rules, weighted random buckets,
//! quiet hours.

use rand::Rng;

use crate::config::ScheduleSettings;

/// Whether `current` falls inside `[start, end)`, wrapping past midnight
/// when `start > end`.
pub fn hour_in_range(current: u32, start: u32, end: u32) -> bool {
    if start <= end {
        start <= current && current < end
    } else {
        current >= start || current < end
    }
}

/// Whether `hour` falls inside a `"22-6"`-style quiet window. Unparsable
/// specs mean "never quiet".
pub fn is_quiet_hours(spec: &str, hour: u32) -> bool {
    let mut parts = spec.splitn(2, '-');
    let (start, end) = match (parts.next(), parts.next()) {
        (Some(s), Some(e)) => match (s.trim().parse::<u32>(), e.trim().parse::<u32>()) {
            (Ok(start), Ok(end)) => (start, end),
            _ => return false,
        },
        _ => return false,
    };
    hour_in_range(hour, start, end)
}

/// Compute the next trigger interval in seconds.
///
/// The first rule whose hour window matches wins. A matched rule with a
/// non-empty weighted-bucket spec draws a bucket proportional to its weight
/// and then a uniform value inside the bucket's minute range; an empty or
/// unparseable spec falls back to the global `[min, max]` uniform draw.
pub fn compute_interval(schedule: &ScheduleSettings, hour: u32) -> u64 {
    for rule in &schedule.schedule_rules {
        if !hour_in_range(hour, rule.start_hour, rule.end_hour) {
            continue;
        }
        let spec = rule.interval_weights.trim();
        if spec.is_empty() {
            break; // matched but empty → global fallback
        }
        if let Some(interval) = pick_from_weights(spec) {
            tracing::debug!(
                "matched schedule rule {}-{}, weighted interval: {} minutes",
                rule.start_hour,
                rule.end_hour,
                interval / 60
            );
            return interval;
        }
        break; // parse failure → global fallback
    }

    let min_s = schedule.min_interval_minutes * 60;
    let max_s = (schedule.max_interval_minutes * 60).max(min_s);
    rand::thread_rng().gen_range(min_s..=max_s)
}

/// Parse an `"lo-hi:w,lo-hi:w"` spec and draw an interval in seconds.
/// Returns `None` when nothing usable parses.
fn pick_from_weights(spec: &str) -> Option<u64> {
    let buckets = parse_weight_buckets(spec);
    if buckets.is_empty() {
        return None;
    }

    let mut rng = rand::thread_rng();
    let total: f64 = buckets.iter().map(|b| b.weight).sum();
    let r = rng.gen_range(0.0..=total);
    let mut acc = 0.0;
    for bucket in &buckets {
        acc += bucket.weight;
        if r <= acc {
            return Some((rng.gen_range(bucket.low..=bucket.high) * 60.0) as u64);
        }
    }
    let last = buckets.last()?;
    Some((rng.gen_range(last.low..=last.high) * 60.0) as u64)
}

#[derive(Debug, Clone, Copy)]
struct WeightBucket {
    low: f64,
    high: f64,
    weight: f64,
}

/// Malformed parts degrade silently; only `hi > lo` and `w > 0` survive.
fn parse_weight_buckets(spec: &str) -> Vec<WeightBucket> {
    let mut buckets = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((range, weight)) = part.split_once(':') else {
            continue;
        };
        let Some((lo, hi)) = range.split_once('-') else {
            continue;
        };
        let (Ok(lo), Ok(hi), Ok(w)) = (
            lo.trim().parse::<f64>(),
            hi.trim().parse::<f64>(),
            weight.trim().parse::<f64>(),
        ) else {
            continue;
        };
        if w > 0.0 && hi > lo {
            buckets.push(WeightBucket {
                low: lo,
                high: hi,
                weight: w,
            });
        }
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleRule;

    fn schedule(rules: Vec<ScheduleRule>) -> ScheduleSettings {
        ScheduleSettings {
            min_interval_minutes: 30,
            max_interval_minutes: 60,
            schedule_rules: rules,
            ..Default::default()
        }
    }

    #[test]
    fn hour_ranges_wrap_past_midnight() {
        assert!(hour_in_range(23, 22, 6));
        assert!(hour_in_range(3, 22, 6));
        assert!(!hour_in_range(12, 22, 6));
        assert!(hour_in_range(10, 9, 18));
        assert!(!hour_in_range(18, 9, 18)); // end is exclusive
    }

    #[test]
    fn quiet_hours_parse_and_wrap() {
        assert!(is_quiet_hours("1-7", 3));
        assert!(!is_quiet_hours("1-7", 8));
        assert!(is_quiet_hours("22-6", 23));
        assert!(is_quiet_hours("22-6", 5));
        assert!(!is_quiet_hours("22-6", 12));
        assert!(!is_quiet_hours("nonsense", 3));
        assert!(!is_quiet_hours("", 3));
    }

    #[test]
    fn unmatched_hours_use_the_global_range() {
        let conf = schedule(vec![ScheduleRule {
            start_hour: 9,
            end_hour: 12,
            interval_weights: "5-10:1.0".to_string(),
            ..Default::default()
        }]);
        for _ in 0..50 {
            let secs = compute_interval(&conf, 20);
            assert!((30 * 60..=60 * 60).contains(&secs), "got {}", secs);
        }
    }

    #[test]
    fn matched_rule_draws_inside_its_buckets() {
        let conf = schedule(vec![ScheduleRule {
            start_hour: 9,
            end_hour: 12,
            interval_weights: "5-10:1.0".to_string(),
            ..Default::default()
        }]);
        for _ in 0..50 {
            let secs = compute_interval(&conf, 10);
            assert!((5 * 60..=10 * 60).contains(&secs), "got {}", secs);
        }
    }

    #[test]
    fn malformed_weight_spec_degrades_to_global_range() {
        for weights in ["garbage", "10-5:1.0", "5-10:0", "a-b:c"] {
            let conf = schedule(vec![ScheduleRule {
                start_hour: 0,
                end_hour: 24,
                interval_weights: weights.to_string(),
                ..Default::default()
            }]);
            let secs = compute_interval(&conf, 10);
            assert!(
                (30 * 60..=60 * 60).contains(&secs),
                "weights {:?} gave {}",
                weights,
                secs
            );
        }
    }

    #[test]
    fn max_below_min_is_clamped_up() {
        let conf = ScheduleSettings {
            min_interval_minutes: 45,
            max_interval_minutes: 10,
            ..Default::default()
        };
        for _ in 0..20 {
            assert_eq!(compute_interval(&conf, 10), 45 * 60);
        }
    }

    #[test]
    fn bucket_selection_frequency_matches_weights() {
        let conf = schedule(vec![ScheduleRule {
            start_hour: 0,
            end_hour: 24,
            interval_weights: "20-30:0.2,30-50:0.5,50-90:0.3".to_string(),
            ..Default::default()
        }]);

        let draws = 100_000;
        let mut counts = [0usize; 3];
        for _ in 0..draws {
            let minutes = compute_interval(&conf, 12) as f64 / 60.0;
            if (20.0..=30.0).contains(&minutes) {
                counts[0] += 1;
            } else if (30.0..=50.0).contains(&minutes) {
                counts[1] += 1;
            } else if (50.0..=90.0).contains(&minutes) {
                counts[2] += 1;
            } else {
                panic!("interval {} outside every bucket", minutes);
            }
        }

        // The 30.0 boundary is shared between the first two buckets, so
        // allow a tolerance well above sampling noise.
        let freq = |i: usize| counts[i] as f64 / draws as f64;
        assert!((freq(0) - 0.2).abs() < 0.02, "bucket0 {}", freq(0));
        assert!((freq(1) - 0.5).abs() < 0.02, "bucket1 {}", freq(1));
        assert!((freq(2) - 0.3).abs() < 0.02, "bucket2 {}", freq(2));
    }
}
