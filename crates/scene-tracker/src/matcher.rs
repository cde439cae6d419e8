//! Member matching
//!
//! Compares one member's observed state with its expected snapshot. Only the
//! attribute keys named by the snapshot are checked; extra observed
//! attributes never affect the result.

use scene_core::{ExpectedSnapshot, MatchOptions, State, STATE_OFF};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of comparing one member against its snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchResult {
    Match,
    NoMatch,
    /// The member does not count towards the scene either way
    Ignored,
}

/// Compare an observed member state (or its absence) with a snapshot
pub fn compare(
    observed: Option<&State>,
    expected: &ExpectedSnapshot,
    options: &MatchOptions,
) -> MatchResult {
    let Some(observed) = observed else {
        return if options.ignore_unavailable {
            MatchResult::Ignored
        } else {
            MatchResult::NoMatch
        };
    };

    if options.ignore_unavailable && observed.is_unavailable_or_unknown() {
        return MatchResult::Ignored;
    }

    if let Some(target) = &expected.state {
        if !eq_ignore_case(target, &observed.state) {
            return MatchResult::NoMatch;
        }
        // Attributes of an entity that is off are don't-care
        if eq_ignore_case(&observed.state, STATE_OFF) {
            return MatchResult::Match;
        }
    }

    if options.ignore_attributes {
        return MatchResult::Match;
    }

    let tolerance = f64::from(options.number_tolerance);
    let attributes_match = expected.attributes.iter().all(|(key, want)| {
        observed
            .attributes
            .get(key)
            .map(|have| values_match(want, have, tolerance))
            .unwrap_or(false)
    });

    if attributes_match {
        MatchResult::Match
    } else {
        MatchResult::NoMatch
    }
}

/// Recursive value comparison with numeric tolerance
///
/// Strings compare case-insensitively, sequences element-wise with equal
/// length, and mappings by the expected keys only.
pub fn values_match(expected: &Value, actual: &Value, tolerance: f64) -> bool {
    if expected == actual {
        return true;
    }

    match (expected, actual) {
        (Value::Number(e), Value::Number(a)) => match (e.as_f64(), a.as_f64()) {
            (Some(e), Some(a)) => numbers_match(e, a, tolerance),
            _ => false,
        },
        (Value::String(e), Value::String(a)) => eq_ignore_case(e, a),
        (Value::Array(e), Value::Array(a)) => {
            e.len() == a.len()
                && e.iter()
                    .zip(a)
                    .all(|(e, a)| values_match(e, a, tolerance))
        }
        (Value::Object(e), Value::Object(a)) => e.iter().all(|(key, e)| {
            a.get(key)
                .map(|a| values_match(e, a, tolerance))
                .unwrap_or(false)
        }),
        _ => false,
    }
}

/// `|expected - actual| <= tolerance`, with non-finite values matching only
/// their own kind
pub fn numbers_match(expected: f64, actual: f64, tolerance: f64) -> bool {
    if expected.is_finite() && actual.is_finite() {
        return (expected - actual).abs() <= tolerance;
    }

    if expected.is_nan() || actual.is_nan() {
        return expected.is_nan() && actual.is_nan();
    }

    // At least one infinity: equal only if both are the same infinity
    expected == actual
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}
