//! Unanswered-message decay — the "should I still bother this user"
//! decision.
//!
//! Policy precedence: the matching time-window rule's decay spec, then the
//! global default spec, then the hard unanswered cap. Every branch reports
//! a reason string carrying the count, the probability or threshold, and
//! the roll, so the caller and the audit log can tell a probabilistic skip
//! (retry later) from a hard cap (stop permanently).

use rand::Rng;

use crate::config::{DecaySpec, ScheduleSettings};
use crate::schedule::interval::hour_in_range;

/// What the decay roll decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayVerdict {
    /// Send the proactive message.
    Trigger,
    /// Decayed away this time; reschedule and re-roll on a future interval.
    Skip,
    /// Hard cap reached; stop permanently until the user replies.
    Stop,
}

#[derive(Debug, Clone)]
pub struct DecayDecision {
    pub verdict: DecayVerdict,
    pub reason: String,
}

impl DecayDecision {
    fn trigger(reason: impl Into<String>) -> Self {
        Self {
            verdict: DecayVerdict::Trigger,
            reason: reason.into(),
        }
    }
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            verdict: DecayVerdict::Skip,
            reason: reason.into(),
        }
    }
    fn stop(reason: impl Into<String>) -> Self {
        Self {
            verdict: DecayVerdict::Stop,
            reason: reason.into(),
        }
    }
}

/// Decide whether to trigger given the consecutive unanswered count.
pub fn evaluate_decay(unanswered_count: u32, schedule: &ScheduleSettings, hour: u32) -> DecayDecision {
    if unanswered_count == 0 {
        return DecayDecision::trigger("");
    }

    match resolve_probability(unanswered_count, schedule, hour) {
        Resolution::Probability(p) => roll(unanswered_count, p),
        Resolution::NoPolicy => hard_cap(unanswered_count, schedule.max_unanswered_times),
    }
}

enum Resolution {
    Probability(f64),
    /// No decay policy applies; fall through to the hard cap.
    NoPolicy,
}

fn resolve_probability(count: u32, schedule: &ScheduleSettings, hour: u32) -> Resolution {
    let spec = effective_spec(schedule, hour);
    let Some(spec) = spec else {
        return Resolution::NoPolicy;
    };

    if let Some(&last) = spec.probabilities.last() {
        let idx = (count - 1) as usize;
        if let Some(&p) = spec.probabilities.get(idx) {
            return Resolution::Probability(p.clamp(0.0, 1.0));
        }
        // Past the end of the list: extend from the last value by the
        // global step, once per excess count, floored at zero. Without a
        // step the list cannot be extended and the hard cap takes over.
        let Some(step) = spec.step else {
            return Resolution::NoPolicy;
        };
        let excess = (count as usize - spec.probabilities.len()) as f64;
        return Resolution::Probability((last - step * excess).clamp(0.0, 1.0));
    }

    if !spec.buckets.is_empty() {
        let mut buckets = spec.buckets.clone();
        buckets.sort_by_key(|b| b.min_count);
        let hit = buckets.iter().rev().find(|b| b.min_count <= count);
        return match hit {
            Some(bucket) => Resolution::Probability(bucket.probability.clamp(0.0, 1.0)),
            // Below every threshold: the buckets only constrain high counts.
            None => Resolution::Probability(1.0),
        };
    }

    if let Some(step) = spec.step {
        // Implicit list starting at 1.0, decrementing per count.
        let p = 1.0 - step * (count as f64 - 1.0);
        return Resolution::Probability(p.clamp(0.0, 1.0));
    }

    Resolution::NoPolicy
}

/// The decay spec in effect: the first matching time-window rule's spec if
/// it has one, else the global default, else nothing.
fn effective_spec(schedule: &ScheduleSettings, hour: u32) -> Option<&DecaySpec> {
    for rule in &schedule.schedule_rules {
        if !hour_in_range(hour, rule.start_hour, rule.end_hour) {
            continue;
        }
        if !rule.decay.is_empty() {
            return Some(&rule.decay);
        }
        break; // matched rule without a decay spec → check the default
    }
    if !schedule.default_decay.is_empty() {
        return Some(&schedule.default_decay);
    }
    None
}

fn roll(count: u32, p: f64) -> DecayDecision {
    if p <= 0.0 {
        return DecayDecision::skip(format!(
            "decay skip: {} unanswered, probability 0.0%",
            count
        ));
    }
    if p >= 1.0 {
        return DecayDecision::trigger(format!(
            "decay trigger: {} unanswered, probability 100.0%",
            count
        ));
    }
    let r: f64 = rand::thread_rng().gen();
    if r < p {
        DecayDecision::trigger(format!(
            "decay trigger: {} unanswered, probability {:.1}%, roll {:.2}",
            count,
            p * 100.0,
            r
        ))
    } else {
        DecayDecision::skip(format!(
            "decay skip: {} unanswered, probability {:.1}%, roll {:.2}",
            count,
            p * 100.0,
            r
        ))
    }
}

fn hard_cap(count: u32, max_unanswered: u32) -> DecayDecision {
    if max_unanswered > 0 && count >= max_unanswered {
        DecayDecision::stop(format!(
            "hard cap: {} unanswered reached the limit of {}, stopping",
            count, max_unanswered
        ))
    } else {
        DecayDecision::trigger("")
    }
}
