//! The synchronous scene state machine
//!
//! [`SceneEngine`] owns every [`SceneRuntime`], the member reverse index and
//! the target table. It never awaits: the async [`crate::SceneTracker`] feeds
//! it state changes, service calls and fired windows one at a time and
//! drains the resulting [`SceneChange`]s.

use crate::error::TrackerError;
use crate::host::StateSource;
use crate::index::ReverseIndex;
use crate::resolver::{TargetResolver, TargetTable};
use crate::runtime::{ArmedWindow, ExclusionFilter, MatchCounts, Phase, SceneRuntime};
use crate::scheduler::{Scheduler, Window, WindowElapsed};
use indexmap::IndexMap;
use scene_core::events::{CallServiceData, StateChangedData};
use scene_core::{MatchOptions, SceneDefinition, SCENE_DOMAIN};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Delay before re-checking a scene that was not matched after activation
pub const POST_ACTIVATION_RETRY_DELAY: Duration = Duration::from_millis(750);

/// Number of re-checks after an activation before settling inactive
pub const POST_ACTIVATION_MAX_RETRIES: u32 = 1;

/// Tunables of one tracker
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerOptions {
    pub matching: MatchOptions,
    /// Length of the optimistic and suppression windows
    pub settle_time: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            matching: MatchOptions::default(),
            settle_time: Duration::from_millis(1500),
            retry_delay: POST_ACTIVATION_RETRY_DELAY,
            max_retries: POST_ACTIVATION_MAX_RETRIES,
        }
    }
}

/// A change of a scene's externally visible active flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneChange {
    pub scene_id: String,
    pub active: bool,
}

/// Optimistic window length for an activation with an optional transition
fn activation_delay(settle_time: Duration, transition: Option<f64>) -> Duration {
    let transition = transition
        .and_then(|secs| Duration::try_from_secs_f64(secs.max(0.0)).ok())
        .unwrap_or_default();
    settle_time.max(transition)
}

pub struct SceneEngine {
    options: TrackerOptions,
    scenes: IndexMap<String, SceneRuntime>,
    index: ReverseIndex,
    targets: TargetTable,
    states: Arc<dyn StateSource>,
    resolver: Arc<dyn TargetResolver>,
    scheduler: Arc<dyn Scheduler>,
    next_generation: u64,
    pending: Vec<SceneChange>,
    started: bool,
}

impl SceneEngine {
    /// Build runtimes for `definitions`
    ///
    /// Excluded members are dropped from every scene. A definition whose id
    /// was already seen is skipped with a warning.
    pub fn new(
        definitions: impl IntoIterator<Item = SceneDefinition>,
        options: TrackerOptions,
        exclusions: &ExclusionFilter,
        states: Arc<dyn StateSource>,
        resolver: Arc<dyn TargetResolver>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let mut seen = HashSet::new();
        let definitions: Vec<SceneDefinition> = definitions
            .into_iter()
            .filter(|definition| {
                let fresh = seen.insert(definition.id.clone());
                if !fresh {
                    warn!(scene_id = %definition.id, "Duplicate scene id, skipping");
                }
                fresh
            })
            .map(|definition| definition.filtered(|id| exclusions.is_excluded(id)))
            .collect();
        let resolved = resolver.resolve_all(&definitions);

        let mut scenes: IndexMap<String, SceneRuntime> = IndexMap::new();
        let mut targets = TargetTable::new();

        for (definition, target) in definitions.into_iter().zip(resolved) {
            targets.add_guesses(&definition);
            if let Some(target) = &target {
                targets.bind(target.clone(), definition.id.clone());
            }

            debug!(
                scene_id = %definition.id,
                members = definition.entities.len(),
                target = ?target,
                "Built scene runtime"
            );
            scenes.insert(definition.id.clone(), SceneRuntime::new(definition, target));
        }

        let index = ReverseIndex::build(scenes.values().map(SceneRuntime::definition));

        Self {
            options,
            scenes,
            index,
            targets,
            states,
            resolver,
            scheduler,
            next_generation: 0,
            pending: Vec::new(),
            started: false,
        }
    }

    /// Evaluate every scene and begin reacting to input
    pub fn start(&mut self) {
        self.started = true;
        for runtime in self.scenes.values_mut() {
            if !runtime.in_window() {
                runtime.recompute_all(self.states.as_ref(), &self.options.matching);
            }
            Self::publish(runtime, &mut self.pending);
        }
        info!(scenes = self.scenes.len(), members = self.index.len(), "Scene engine started");
    }

    /// Cancel every window; later input is ignored until restarted
    pub fn shutdown(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        for runtime in self.scenes.values_mut() {
            runtime.cancel_windows();
        }
        debug!("Scene engine shut down");
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Members referenced by at least one scene
    pub fn member_ids(&self) -> Vec<String> {
        self.index.members().map(str::to_string).collect()
    }

    /// Incremental update for one member's state change
    pub fn on_state_changed(&mut self, change: &StateChangedData) {
        if !self.started {
            return;
        }

        for scene_id in self.index.scenes_for(&change.entity_id) {
            let Some(runtime) = self.scenes.get_mut(scene_id) else {
                continue;
            };
            if runtime.in_window() {
                trace!(scene_id, member = %change.entity_id, "Scene in window, ignoring update");
                continue;
            }
            if !runtime.is_interesting(change, self.options.matching.ignore_attributes) {
                continue;
            }

            if runtime.recompute_member(
                &change.entity_id,
                change.new_state.as_ref(),
                &self.options.matching,
            ) {
                debug!(
                    scene_id,
                    member = %change.entity_id,
                    active = runtime.is_active(),
                    "Scene activeness changed"
                );
            }
            Self::publish(runtime, &mut self.pending);
        }
    }

    /// Detect scene activations dispatched by anyone
    pub fn on_service_call(&mut self, call: &CallServiceData) {
        if !self.started || !call.is(SCENE_DOMAIN, "turn_on") {
            return;
        }

        let delay = activation_delay(self.options.settle_time, call.transition());
        for target in call.entity_ids() {
            let Some(scene_id) = self.targets.lookup(&target).map(str::to_string) else {
                trace!(target = %target, "Activated scene entity is not tracked");
                continue;
            };

            self.targets.bind(target.clone(), scene_id.clone());
            if let Some(runtime) = self.scenes.get_mut(&scene_id) {
                runtime.target.get_or_insert_with(|| target.clone());
            }

            debug!(scene_id = %scene_id, target = %target, delay = ?delay, "Detected scene activation");
            self.enter_optimistic(&scene_id, delay, true);
        }
    }

    /// Settle a scene whose window timer fired
    pub fn on_window_elapsed(&mut self, elapsed: WindowElapsed) {
        let Some(runtime) = self.scenes.get_mut(&elapsed.scene_id) else {
            return;
        };

        let slot = match elapsed.window {
            Window::Optimistic => &mut runtime.optimistic,
            Window::Suppression => &mut runtime.suppression,
        };
        if slot.as_ref().map(|w| w.generation) != Some(elapsed.generation) {
            trace!(scene_id = %elapsed.scene_id, window = ?elapsed.window, "Dropping stale window timer");
            return;
        }
        *slot = None;

        runtime.recompute_all(self.states.as_ref(), &self.options.matching);

        let retry = elapsed.window == Window::Optimistic
            && !runtime.active
            && runtime.retries_remaining > 0;
        if retry {
            runtime.retries_remaining -= 1;
            debug!(
                scene_id = %elapsed.scene_id,
                retries_remaining = runtime.retries_remaining,
                "Scene not matched after activation, checking again"
            );
            let delay = self.options.retry_delay;
            self.enter_optimistic(&elapsed.scene_id, delay, false);
            return;
        }

        debug!(
            scene_id = %elapsed.scene_id,
            window = ?elapsed.window,
            active = runtime.active,
            "Window settled"
        );
        Self::publish(runtime, &mut self.pending);
    }

    /// Enter the optimistic window for an explicit activation
    ///
    /// Returns the scene entity to dispatch the activation to. A cached
    /// target the host no longer knows is resolved again.
    pub fn begin_activate(&mut self, scene_id: &str) -> Result<String, TrackerError> {
        let Some(runtime) = self.scenes.get(scene_id) else {
            error!(scene_id, "Cannot activate unknown scene");
            return Err(TrackerError::UnknownScene(scene_id.to_string()));
        };

        let cached = runtime
            .target
            .clone()
            .filter(|target| self.states.current_state(target).is_some());
        let target = match cached.or_else(|| self.resolver.resolve(runtime.definition())) {
            Some(target) => target,
            None => {
                error!(scene_id, "No scene entity found to activate");
                return Err(TrackerError::UnresolvedTarget(scene_id.to_string()));
            }
        };

        self.targets.bind(target.clone(), scene_id);
        if let Some(runtime) = self.scenes.get_mut(scene_id) {
            runtime.target = Some(target.clone());
        }

        let delay = self.options.settle_time;
        self.enter_optimistic(scene_id, delay, true);
        Ok(target)
    }

    /// Enter the suppression window for an explicit deactivation
    ///
    /// Returns the members to turn off.
    pub fn begin_deactivate(&mut self, scene_id: &str) -> Result<Vec<String>, TrackerError> {
        let generation = self.bump_generation();
        let now = self.scheduler.now();
        let delay = self.options.settle_time;

        let Some(runtime) = self.scenes.get_mut(scene_id) else {
            error!(scene_id, "Cannot deactivate unknown scene");
            return Err(TrackerError::UnknownScene(scene_id.to_string()));
        };

        runtime.cancel_windows();
        runtime.retries_remaining = 0;
        runtime.active = false;
        let handle = self.scheduler.schedule(
            delay,
            WindowElapsed {
                scene_id: scene_id.to_string(),
                window: Window::Suppression,
                generation,
            },
        );
        runtime.suppression = Some(ArmedWindow {
            deadline: now + delay,
            generation,
            handle,
        });
        Self::publish(runtime, &mut self.pending);

        Ok(runtime.definition.member_ids().map(str::to_string).collect())
    }

    /// Full recompute of every scene outside a window
    ///
    /// Used when state-change events may have been missed.
    pub fn resync(&mut self) {
        if !self.started {
            return;
        }
        for runtime in self.scenes.values_mut() {
            if runtime.in_window() {
                continue;
            }
            runtime.recompute_all(self.states.as_ref(), &self.options.matching);
            Self::publish(runtime, &mut self.pending);
        }
    }

    /// Drain the changes produced since the last call
    pub fn take_changes(&mut self) -> Vec<SceneChange> {
        std::mem::take(&mut self.pending)
    }

    /// Unknown scenes are inactive
    pub fn is_active(&self, scene_id: &str) -> bool {
        self.scenes
            .get(scene_id)
            .map(SceneRuntime::is_active)
            .unwrap_or(false)
    }

    pub fn resolved_target(&self, scene_id: &str) -> Option<String> {
        self.scenes
            .get(scene_id)
            .and_then(|r| r.target().map(str::to_string))
    }

    pub fn phase(&self, scene_id: &str) -> Option<Phase> {
        self.scenes.get(scene_id).map(SceneRuntime::phase)
    }

    pub fn counts(&self, scene_id: &str) -> Option<MatchCounts> {
        self.scenes.get(scene_id).map(SceneRuntime::counts)
    }

    pub fn scene_ids(&self) -> Vec<String> {
        self.scenes.keys().cloned().collect()
    }

    /// The definition as tracked, with excluded members removed
    pub fn definition(&self, scene_id: &str) -> Option<&SceneDefinition> {
        self.scenes.get(scene_id).map(SceneRuntime::definition)
    }

    pub fn runtime(&self, scene_id: &str) -> Option<&SceneRuntime> {
        self.scenes.get(scene_id)
    }

    /// Time left in the scene's current window
    pub fn window_remaining(&self, scene_id: &str) -> Option<Duration> {
        let deadline = self.scenes.get(scene_id)?.window_deadline()?;
        Some(deadline.saturating_duration_since(self.scheduler.now()))
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn enter_optimistic(&mut self, scene_id: &str, delay: Duration, reset_retries: bool) {
        let generation = self.bump_generation();
        let now = self.scheduler.now();
        let Some(runtime) = self.scenes.get_mut(scene_id) else {
            return;
        };

        runtime.cancel_windows();
        if reset_retries {
            runtime.retries_remaining = self.options.max_retries;
        }
        runtime.active = true;
        let handle = self.scheduler.schedule(
            delay,
            WindowElapsed {
                scene_id: scene_id.to_string(),
                window: Window::Optimistic,
                generation,
            },
        );
        runtime.optimistic = Some(ArmedWindow {
            deadline: now + delay,
            generation,
            handle,
        });
        Self::publish(runtime, &mut self.pending);
    }

    fn publish(runtime: &mut SceneRuntime, pending: &mut Vec<SceneChange>) {
        if runtime.active == runtime.reported {
            return;
        }
        runtime.reported = runtime.active;
        pending.push(SceneChange {
            scene_id: runtime.definition.id.clone(),
            active: runtime.active,
        });
    }
}
