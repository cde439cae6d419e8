//! Per-scene runtime state
//!
//! A [`SceneRuntime`] keeps one tri-state result per member plus running
//! counters so a single member change updates the scene in O(1). The
//! counters always satisfy `matched + unmatched + ignored == total`.

use crate::error::TrackerError;
use crate::host::StateSource;
use crate::matcher::{compare, MatchResult};
use crate::scheduler::TimerHandle;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use indexmap::IndexMap;
use scene_core::events::StateChangedData;
use scene_core::{MatchOptions, SceneDefinition, State};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Members left out of every scene, by glob
///
/// Patterns are case-sensitive; `*` and `?` also match `.`.
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    patterns: Vec<String>,
    set: Option<GlobSet>,
}

impl ExclusionFilter {
    pub fn new<I, S>(patterns: I) -> Result<Self, TrackerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if patterns.is_empty() {
            return Ok(Self::default());
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(false)
                .build()
                .map_err(|e| TrackerError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| TrackerError::InvalidPattern {
            pattern: patterns.join(","),
            reason: e.to_string(),
        })?;

        Ok(Self {
            patterns,
            set: Some(set),
        })
    }

    pub fn is_excluded(&self, entity_id: &str) -> bool {
        self.set
            .as_ref()
            .map(|set| set.is_match(entity_id))
            .unwrap_or(false)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Per-result member counts of one scene
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCounts {
    pub matched: usize,
    pub unmatched: usize,
    pub ignored: usize,
}

impl MatchCounts {
    pub fn total(&self) -> usize {
        self.matched + self.unmatched + self.ignored
    }

    /// Whether these counts describe an active scene
    pub fn is_active(&self) -> bool {
        let considered = self.total() - self.ignored;
        self.unmatched == 0 && considered > 0 && self.matched == considered
    }

    fn bucket(&mut self, result: MatchResult) -> &mut usize {
        match result {
            MatchResult::Match => &mut self.matched,
            MatchResult::NoMatch => &mut self.unmatched,
            MatchResult::Ignored => &mut self.ignored,
        }
    }
}

/// Where a scene is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Not evaluated yet
    Initial,
    Inactive,
    Active,
    /// Forced active until the optimistic window ends
    OptimisticActive,
    /// Forced inactive until the suppression window ends
    SuppressedInactive,
}

/// A running window timer
#[derive(Debug)]
pub(crate) struct ArmedWindow {
    pub deadline: Instant,
    pub generation: u64,
    pub handle: TimerHandle,
}

impl ArmedWindow {
    pub fn cancel(mut self) {
        self.handle.cancel();
    }
}

/// Mutable state of one scene
#[derive(Debug)]
pub struct SceneRuntime {
    pub(crate) definition: SceneDefinition,
    results: IndexMap<String, MatchResult>,
    /// Expected attribute keys per member
    watched: HashMap<String, Vec<String>>,
    counts: MatchCounts,
    pub(crate) active: bool,
    /// Last active value handed to observers
    pub(crate) reported: bool,
    evaluated: bool,
    pub(crate) optimistic: Option<ArmedWindow>,
    pub(crate) suppression: Option<ArmedWindow>,
    pub(crate) retries_remaining: u32,
    pub(crate) target: Option<String>,
}

impl SceneRuntime {
    /// Build a runtime with every member Ignored
    pub fn new(definition: SceneDefinition, target: Option<String>) -> Self {
        let results: IndexMap<String, MatchResult> = definition
            .member_ids()
            .map(|id| (id.to_string(), MatchResult::Ignored))
            .collect();
        let watched = definition
            .entities
            .iter()
            .map(|(id, expected)| (id.clone(), expected.watched_keys()))
            .collect();
        let counts = MatchCounts {
            ignored: results.len(),
            ..MatchCounts::default()
        };

        Self {
            definition,
            results,
            watched,
            counts,
            active: false,
            reported: false,
            evaluated: false,
            optimistic: None,
            suppression: None,
            retries_remaining: 0,
            target,
        }
    }

    /// Re-evaluate every member and rebuild the counters
    ///
    /// Returns whether `active` flipped.
    pub fn recompute_all(&mut self, states: &dyn StateSource, options: &MatchOptions) -> bool {
        let mut counts = MatchCounts::default();
        for (member, expected) in &self.definition.entities {
            let result = compare(states.current_state(member).as_ref(), expected, options);
            *counts.bucket(result) += 1;
            self.results.insert(member.clone(), result);
        }
        self.counts = counts;
        self.evaluated = true;
        self.refresh_active()
    }

    /// Re-evaluate one member against its new observed state
    ///
    /// Returns whether `active` flipped. Unknown members are a no-op.
    pub fn recompute_member(
        &mut self,
        member: &str,
        observed: Option<&State>,
        options: &MatchOptions,
    ) -> bool {
        let Some(expected) = self.definition.entities.get(member) else {
            return false;
        };
        let new = compare(observed, expected, options);

        let Some(slot) = self.results.get_mut(member) else {
            return false;
        };
        let old = std::mem::replace(slot, new);
        if old == new {
            return false;
        }

        *self.counts.bucket(old) -= 1;
        *self.counts.bucket(new) += 1;
        self.refresh_active()
    }

    fn refresh_active(&mut self) -> bool {
        let previous = self.active;
        self.active = self.counts.is_active();
        self.active != previous
    }

    /// Whether a state change could alter this member's result
    pub fn is_interesting(&self, change: &StateChangedData, ignore_attributes: bool) -> bool {
        let (Some(old), Some(new)) = (&change.old_state, &change.new_state) else {
            return true;
        };
        let Some(expected) = self.definition.entities.get(&change.entity_id) else {
            return false;
        };

        if expected.state.is_some() && old.state != new.state {
            return true;
        }
        if ignore_attributes {
            return false;
        }

        self.watched
            .get(&change.entity_id)
            .map(|keys| {
                keys.iter()
                    .any(|key| old.attributes.get(key) != new.attributes.get(key))
            })
            .unwrap_or(false)
    }

    /// Cancel both windows, if armed
    pub(crate) fn cancel_windows(&mut self) {
        if let Some(window) = self.optimistic.take() {
            window.cancel();
        }
        if let Some(window) = self.suppression.take() {
            window.cancel();
        }
    }

    pub fn in_window(&self) -> bool {
        self.optimistic.is_some() || self.suppression.is_some()
    }

    pub fn phase(&self) -> Phase {
        if self.optimistic.is_some() {
            Phase::OptimisticActive
        } else if self.suppression.is_some() {
            Phase::SuppressedInactive
        } else if !self.evaluated {
            Phase::Initial
        } else if self.active {
            Phase::Active
        } else {
            Phase::Inactive
        }
    }

    pub fn definition(&self) -> &SceneDefinition {
        &self.definition
    }

    pub fn counts(&self) -> MatchCounts {
        self.counts
    }

    pub fn result(&self, member: &str) -> Option<MatchResult> {
        self.results.get(member).copied()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    pub(crate) fn window_deadline(&self) -> Option<Instant> {
        self.optimistic
            .as_ref()
            .or(self.suppression.as_ref())
            .map(|w| w.deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scene_core::ExpectedSnapshot;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStates(Mutex<HashMap<String, State>>);

    impl FakeStates {
        fn set(&self, id: &str, state: &str, attributes: serde_json::Value) -> State {
            let attributes = serde_json::from_value(attributes).unwrap();
            let state = State::new(id, state, attributes);
            self.0.lock().unwrap().insert(id.to_string(), state.clone());
            state
        }
    }

    impl StateSource for FakeStates {
        fn current_state(&self, entity_id: &str) -> Option<State> {
            self.0.lock().unwrap().get(entity_id).cloned()
        }

        fn domain_states(&self, _domain: &str) -> Vec<State> {
            Vec::new()
        }
    }

    fn opts(ignore_unavailable: bool) -> MatchOptions {
        MatchOptions {
            number_tolerance: 1,
            ignore_unavailable,
            ignore_attributes: false,
        }
    }

    fn movie_night() -> SceneDefinition {
        SceneDefinition::new("movie_night", "Movie Night")
            .with_entity(
                "light.tv",
                ExpectedSnapshot::state("on").with_attribute("brightness", json!(40)),
            )
            .with_entity("media_player.tv", ExpectedSnapshot::state("on"))
            .with_entity("switch.lamp", ExpectedSnapshot::state("off"))
    }

    fn assert_consistent(runtime: &SceneRuntime) {
        assert_eq!(runtime.counts().total(), runtime.definition().entities.len());
        assert_eq!(runtime.is_active(), runtime.counts().is_active());
    }

    #[test]
    fn test_new_runtime_is_consistent() {
        let runtime = SceneRuntime::new(movie_night(), None);
        assert_eq!(runtime.counts().ignored, 3);
        assert_eq!(runtime.phase(), Phase::Initial);
        assert!(!runtime.is_active());
        assert_consistent(&runtime);
    }

    #[test]
    fn test_full_recompute_and_idempotence() {
        let states = FakeStates::default();
        states.set("light.tv", "on", json!({"brightness": 41}));
        states.set("media_player.tv", "on", json!({}));
        states.set("switch.lamp", "off", json!({}));

        let mut runtime = SceneRuntime::new(movie_night(), None);
        assert!(runtime.recompute_all(&states, &opts(true)));
        assert!(runtime.is_active());
        assert_eq!(runtime.phase(), Phase::Active);
        assert_consistent(&runtime);

        let results = |runtime: &SceneRuntime| -> Vec<Option<MatchResult>> {
            runtime
                .definition()
                .member_ids()
                .map(|m| runtime.result(m))
                .collect()
        };
        let before = results(&runtime);
        assert!(!runtime.recompute_all(&states, &opts(true)));
        let after = results(&runtime);
        assert_eq!(before, after);
        assert!(runtime.is_active());
    }

    #[test]
    fn test_incremental_updates_keep_invariant() {
        let states = FakeStates::default();
        states.set("light.tv", "on", json!({"brightness": 40}));
        states.set("media_player.tv", "on", json!({}));
        states.set("switch.lamp", "off", json!({}));

        let mut runtime = SceneRuntime::new(movie_night(), None);
        runtime.recompute_all(&states, &opts(true));

        let dimmed = states.set("light.tv", "on", json!({"brightness": 90}));
        assert!(runtime.recompute_member("light.tv", Some(&dimmed), &opts(true)));
        assert!(!runtime.is_active());
        assert_eq!(runtime.result("light.tv"), Some(MatchResult::NoMatch));
        assert_consistent(&runtime);

        let gone = None;
        assert!(!runtime.recompute_member("media_player.tv", gone, &opts(true)));
        assert_eq!(runtime.counts().ignored, 1);
        assert_consistent(&runtime);

        let restored = states.set("light.tv", "on", json!({"brightness": 39}));
        assert!(runtime.recompute_member("light.tv", Some(&restored), &opts(true)));
        assert!(runtime.is_active());
        assert_consistent(&runtime);

        assert!(!runtime.recompute_member("light.kitchen", Some(&restored), &opts(true)));
        assert_consistent(&runtime);
    }

    #[test]
    fn test_ignore_unavailable_changes_activeness() {
        let states = FakeStates::default();
        states.set("light.tv", "on", json!({"brightness": 40}));
        states.set("media_player.tv", "unavailable", json!({}));
        states.set("switch.lamp", "off", json!({}));

        let mut ignoring = SceneRuntime::new(movie_night(), None);
        ignoring.recompute_all(&states, &opts(true));
        assert!(ignoring.is_active());
        assert_eq!(ignoring.result("media_player.tv"), Some(MatchResult::Ignored));

        let mut strict = SceneRuntime::new(movie_night(), None);
        strict.recompute_all(&states, &opts(false));
        assert!(!strict.is_active());
    }

    #[test]
    fn test_all_ignored_is_never_active() {
        let states = FakeStates::default();
        let mut runtime = SceneRuntime::new(movie_night(), None);
        runtime.recompute_all(&states, &opts(true));

        assert_eq!(runtime.counts().ignored, 3);
        assert!(!runtime.is_active());
        assert_eq!(runtime.phase(), Phase::Inactive);
    }

    #[test]
    fn test_interesting_updates() {
        let runtime = SceneRuntime::new(movie_night(), None);
        let attrs = |value: serde_json::Value| -> HashMap<String, serde_json::Value> {
            serde_json::from_value(value).unwrap()
        };
        let old = State::new("light.tv", "on", attrs(json!({"brightness": 40, "power": 3})));

        let change = |new: Option<State>, old: Option<State>| StateChangedData {
            entity_id: "light.tv".to_string(),
            old_state: old,
            new_state: new,
        };

        // Appearance and removal are always interesting
        assert!(runtime.is_interesting(&change(Some(old.clone()), None), false));
        assert!(runtime.is_interesting(&change(None, Some(old.clone())), false));

        let noise = old.with_update("on", attrs(json!({"brightness": 40, "power": 7})));
        assert!(!runtime.is_interesting(&change(Some(noise), Some(old.clone())), false));

        let dimmed = old.with_update("on", attrs(json!({"brightness": 20, "power": 3})));
        assert!(runtime.is_interesting(&change(Some(dimmed.clone()), Some(old.clone())), false));
        assert!(!runtime.is_interesting(&change(Some(dimmed), Some(old.clone())), true));

        let off = old.with_update("off", old.attributes.clone());
        assert!(runtime.is_interesting(&change(Some(off), Some(old.clone())), true));

        let other = StateChangedData {
            entity_id: "light.kitchen".to_string(),
            ..change(Some(old.clone()), Some(old))
        };
        assert!(!runtime.is_interesting(&other, false));
    }

    #[test]
    fn test_exclusion_filter() {
        let filter =
            ExclusionFilter::new(["switch.circadian_lighting*", " light.night_? "]).unwrap();
        assert!(filter.is_excluded("switch.circadian_lighting_living_room"));
        assert!(filter.is_excluded("light.night_1"));
        assert!(!filter.is_excluded("light.night_10"));
        assert!(!filter.is_excluded("SWITCH.circadian_lighting_x"));
        assert_eq!(filter.patterns().len(), 2);

        let empty = ExclusionFilter::new(Vec::<String>::new()).unwrap();
        assert!(!empty.is_excluded("switch.circadian_lighting_x"));

        assert!(matches!(
            ExclusionFilter::new(["light.[oops"]),
            Err(TrackerError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_filtered_definition_drops_excluded_members() {
        let filter = ExclusionFilter::new(["switch.*"]).unwrap();
        let filtered = movie_night().filtered(|id| filter.is_excluded(id));
        let runtime = SceneRuntime::new(filtered, None);

        let members: Vec<_> = runtime.definition().member_ids().collect();
        assert_eq!(members, vec!["light.tv", "media_player.tv"]);
        assert_eq!(runtime.counts().total(), 2);
    }
}
