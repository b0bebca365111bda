//! Best-effort selection when no attempt in a cycle passed critique.

use crate::core::compare::canonical_len;
use crate::core::types::Attempt;

/// Pick the attempt with the longest canonical outcome; ties keep the earliest.
///
/// Length is a proxy for "more complete data", not a correctness signal.
/// Callers must treat the pick as unvalidated.
pub fn select_fallback(attempts: &[Attempt]) -> Option<&Attempt> {
    let mut best: Option<(&Attempt, usize)> = None;
    for attempt in attempts {
        let len = canonical_len(&attempt.outcome);
        match best {
            Some((_, best_len)) if len <= best_len => {}
            _ => best = Some((attempt, len)),
        }
    }
    best.map(|(attempt, _)| attempt)
}
