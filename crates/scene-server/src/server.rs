//! The stateful scenes instance
//!
//! Owns the in-process host, loads options and scenes from the config
//! directory, runs one tracker with its switches, and replaces both on
//! `stateful_scenes.reload`.

use crate::switch::{SceneSwitches, SWITCH_DOMAIN};
use anyhow::Result;
use scene_components::{register_homeassistant_services, register_scene_services, SceneEntities};
use scene_config::StatefulScenesConfig;
use scene_core::{ServiceCall, STATE_OFF, STATE_ON};
use scene_event_bus::EventBus;
use scene_service_registry::{ServiceError, ServiceRegistry, ServiceResult};
use scene_state_store::StateStore;
use scene_tracker::{ExclusionFilter, LocalHost, SceneTracker, TrackerOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DOMAIN: &str = "stateful_scenes";

#[derive(Clone)]
struct Loaded {
    tracker: Arc<SceneTracker>,
    switches: Arc<SceneSwitches>,
}

/// The central stateful scenes instance
pub struct StatefulScenes {
    config_dir: PathBuf,
    host: Arc<LocalHost>,
    scenes: Arc<SceneEntities>,
    loaded: RwLock<Option<Loaded>>,
}

impl StatefulScenes {
    /// Create an instance reading from `config_dir` and register its services
    ///
    /// Nothing is tracked until [`load`](Self::load).
    pub fn new(config_dir: impl Into<PathBuf>) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let states = Arc::new(StateStore::new(bus.clone()));
        let services = Arc::new(ServiceRegistry::new(bus.clone()));

        let scenes = Arc::new(SceneEntities::new(states.clone()));
        register_scene_services(&services, scenes.clone());
        register_homeassistant_services(&services, states.clone());

        let this = Arc::new(Self {
            config_dir: config_dir.into(),
            host: Arc::new(LocalHost::new(bus, states, services)),
            scenes,
            loaded: RwLock::new(None),
        });
        this.register_services();
        this
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn states(&self) -> &Arc<StateStore> {
        self.host.states()
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        self.host.services()
    }

    /// The running tracker, if scenes are loaded
    pub async fn tracker(&self) -> Option<Arc<SceneTracker>> {
        self.loaded.read().await.as_ref().map(|l| l.tracker.clone())
    }

    /// Load options and scenes and start tracking them
    ///
    /// A tracker that is already running is stopped and replaced. On error
    /// the previous tracker keeps running. Returns the number of scenes.
    pub async fn load(&self) -> Result<usize> {
        let config = StatefulScenesConfig::load(&self.config_dir)?;
        config.validate()?;
        let definitions = config.load_scenes(&self.config_dir)?;
        let exclusions = ExclusionFilter::new(config.exclude_patterns())?;
        let options = TrackerOptions {
            matching: config.match_options(),
            settle_time: config.settle_duration(),
            ..TrackerOptions::default()
        };

        let mut loaded = self.loaded.write().await;
        if let Some(previous) = loaded.take() {
            debug!("Replacing running tracker");
            previous.switches.detach();
            previous.tracker.stop().await;
        }

        self.scenes.load(&definitions);
        let tracker = Arc::new(SceneTracker::new(
            self.host.clone(),
            definitions,
            options,
            &exclusions,
        ));
        tracker.start().await;
        let switches = SceneSwitches::attach(self.states().clone(), tracker.clone()).await;

        let count = switches.len();
        info!(
            scenes = count,
            source = %config.source,
            excluded = ?exclusions.patterns(),
            "Stateful scenes loaded"
        );
        *loaded = Some(Loaded { tracker, switches });
        Ok(count)
    }

    /// Stop tracking and remove the switches
    pub async fn shutdown(&self) {
        if let Some(previous) = self.loaded.write().await.take() {
            previous.switches.detach();
            previous.tracker.stop().await;
        }
    }

    fn register_services(self: &Arc<Self>) {
        let services = self.services();

        for (service, on) in [("turn_on", true), ("turn_off", false)] {
            let app = Arc::downgrade(self);
            services.register(SWITCH_DOMAIN, service, move |call: ServiceCall| {
                let app = app.clone();
                async move {
                    let app = upgrade(&app)?;
                    app.set_switches(call.entity_ids(), on).await
                }
            });
        }

        let app = Arc::downgrade(self);
        services.register(DOMAIN, "reload", move |_call: ServiceCall| {
            let app = app.clone();
            async move {
                let app = upgrade(&app)?;
                info!("Reloading stateful scenes");
                app.load()
                    .await
                    .map(|_| ())
                    .map_err(|e| ServiceError::CallFailed(format!("{:#}", e)))
            }
        });

        info!("Stateful scenes services registered");
    }

    /// Route switch commands to the tracker; plain switches are just set
    async fn set_switches(&self, entity_ids: Vec<String>, on: bool) -> ServiceResult {
        if entity_ids.is_empty() {
            return Err(ServiceError::InvalidData(
                "switch services require an entity_id".to_string(),
            ));
        }

        let loaded = self.loaded.read().await.clone();
        let mut failure = None;

        for entity_id in entity_ids {
            let routed = loaded.as_ref().and_then(|l| {
                l.switches
                    .scene_for(&entity_id)
                    .map(|scene_id| (l.tracker.clone(), scene_id.to_string()))
            });

            let Some((tracker, scene_id)) = routed else {
                if self.states().get(&entity_id).is_some() {
                    self.states()
                        .set_value(&entity_id, if on { STATE_ON } else { STATE_OFF });
                } else {
                    debug!(entity_id = %entity_id, "Skipping unknown switch");
                }
                continue;
            };

            let result = if on {
                tracker.activate(&scene_id).await
            } else {
                tracker.deactivate(&scene_id).await
            };
            if let Err(e) = result {
                warn!(entity_id = %entity_id, error = %e, "Scene switch command failed");
                failure = Some(e);
            }
        }

        match failure {
            Some(e) => Err(ServiceError::CallFailed(e.to_string())),
            None => Ok(()),
        }
    }
}

fn upgrade(app: &Weak<StatefulScenes>) -> Result<Arc<StatefulScenes>, ServiceError> {
    app.upgrade()
        .ok_or_else(|| ServiceError::CallFailed("stateful scenes has shut down".to_string()))
}
