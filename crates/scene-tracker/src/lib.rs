//! Stateful scene tracking
//!
//! Decides, for every configured scene, whether its members currently match
//! their expected snapshots, and keeps that answer stable while an
//! activation or deactivation settles:
//!
//! - [`matcher`]: tri-state comparison of one member against its snapshot
//! - [`SceneRuntime`]: per-scene results and O(1) counters
//! - [`SceneEngine`]: the synchronous state machine with optimistic and
//!   suppression windows and external-activation detection
//! - [`SceneTracker`]: the async driver over a [`SceneHost`]

pub mod engine;
pub mod error;
pub mod host;
pub mod index;
pub mod matcher;
pub mod resolver;
pub mod runtime;
pub mod scheduler;
pub mod tracker;

pub use engine::{
    SceneChange, SceneEngine, TrackerOptions, POST_ACTIVATION_MAX_RETRIES,
    POST_ACTIVATION_RETRY_DELAY,
};
pub use error::{HostError, TrackerError};
pub use host::{LocalHost, SceneHost, StateSource};
pub use index::ReverseIndex;
pub use matcher::{compare, MatchResult};
pub use resolver::{
    guess_candidates, SceneEntityIndex, StateTargetResolver, TargetResolver, TargetTable,
};
pub use runtime::{ExclusionFilter, MatchCounts, Phase, SceneRuntime};
pub use scheduler::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler, Window, WindowElapsed};
pub use tracker::SceneTracker;
