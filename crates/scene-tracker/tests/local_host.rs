//! End-to-end tracking against the in-process host
//!
//! Scenes are applied through the real `scene.turn_on` and
//! `homeassistant.turn_off` services and the tracker follows the resulting
//! state changes and service calls over the event bus.

use scene_components::{register_homeassistant_services, register_scene_services, SceneEntities};
use scene_core::{ExpectedSnapshot, MatchOptions, SceneDefinition};
use scene_event_bus::EventBus;
use scene_service_registry::ServiceRegistry;
use scene_state_store::StateStore;
use scene_tracker::{
    ExclusionFilter, LocalHost, Phase, SceneChange, SceneTracker, TrackerOptions,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// Fixtures
// ============================================================================

fn scenes() -> Vec<SceneDefinition> {
    vec![
        SceneDefinition::new("movie_night", "Movie Night")
            .with_entity(
                "light.living_room",
                ExpectedSnapshot::state("on").with_attribute("brightness", json!(40)),
            )
            .with_entity("media_player.tv", ExpectedSnapshot::state("on"))
            .with_entity("switch.circadian_lighting_living_room", ExpectedSnapshot::state("off")),
        SceneDefinition::new("bright", "Bright")
            .with_entity(
                "light.living_room",
                ExpectedSnapshot::state("on").with_attribute("brightness", json!(255)),
            ),
    ]
}

struct Home {
    host: Arc<LocalHost>,
    services: Arc<ServiceRegistry>,
    states: Arc<StateStore>,
}

fn home() -> Home {
    let bus = Arc::new(EventBus::new());
    let states = Arc::new(StateStore::new(bus.clone()));
    let services = Arc::new(ServiceRegistry::new(bus.clone()));

    let entities = Arc::new(SceneEntities::new(states.clone()));
    entities.load(&scenes());
    register_scene_services(&services, entities);
    register_homeassistant_services(&services, states.clone());

    let attrs = serde_json::from_value(json!({"brightness": 0})).unwrap();
    states.set("light.living_room", "off", attrs);
    states.set_value("media_player.tv", "off");
    states.set_value("switch.circadian_lighting_living_room", "on");

    Home {
        host: Arc::new(LocalHost::new(bus, states.clone(), services.clone())),
        services,
        states,
    }
}

fn tracker(home: &Home) -> SceneTracker {
    let options = TrackerOptions {
        matching: MatchOptions {
            number_tolerance: 2,
            ignore_unavailable: true,
            ignore_attributes: false,
        },
        ..TrackerOptions::default()
    };
    let exclusions = ExclusionFilter::new(["switch.circadian_lighting*"]).unwrap();
    SceneTracker::new(home.host.clone(), scenes(), options, &exclusions)
}

fn drain(rx: &mut broadcast::Receiver<SceneChange>) -> Vec<(String, bool)> {
    let mut seen = Vec::new();
    while let Ok(change) = rx.try_recv() {
        seen.push((change.scene_id, change.active));
    }
    seen
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_activate_one_scene_deactivates_the_other() {
    let home = home();
    let tracker = tracker(&home);
    let mut changes = tracker.subscribe_changes();
    tracker.start().await;
    assert!(drain(&mut changes).is_empty());

    tracker.activate("bright").await.unwrap();
    sleep_ms(1600).await;
    assert!(tracker.is_active("bright").await);

    tracker.activate("movie_night").await.unwrap();
    sleep_ms(10).await;
    assert_eq!(
        home.states.get("light.living_room").unwrap().attribute::<u64>("brightness"),
        Some(40)
    );
    // The shared light moved, so bright no longer matches
    assert!(!tracker.is_active("bright").await);
    assert!(tracker.is_active("movie_night").await);

    sleep_ms(1600).await;
    assert_eq!(tracker.phase("movie_night").await, Some(Phase::Active));
    assert_eq!(
        drain(&mut changes),
        vec![
            ("bright".to_string(), true),
            ("movie_night".to_string(), true),
            ("bright".to_string(), false),
        ]
    );

    tracker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_deactivate_right_after_activate_stays_inactive() {
    let home = home();
    let tracker = tracker(&home);
    let mut changes = tracker.subscribe_changes();
    tracker.start().await;

    // The scene.turn_on call from activate is still queued when deactivate runs
    tracker.activate("movie_night").await.unwrap();
    tracker.deactivate("movie_night").await.unwrap();
    assert!(!tracker.is_active("movie_night").await);

    sleep_ms(10).await;
    assert!(!tracker.is_active("movie_night").await);
    assert_eq!(tracker.phase("movie_night").await, Some(Phase::SuppressedInactive));
    assert_eq!(home.states.get_state("light.living_room").as_deref(), Some("off"));
    assert_eq!(home.states.get_state("media_player.tv").as_deref(), Some("off"));

    sleep_ms(1600).await;
    assert_eq!(tracker.phase("movie_night").await, Some(Phase::Inactive));
    assert_eq!(
        drain(&mut changes),
        vec![
            ("movie_night".to_string(), true),
            ("movie_night".to_string(), false),
        ]
    );

    tracker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_excluded_member_is_neither_matched_nor_turned_off() {
    let home = home();
    let tracker = tracker(&home);
    tracker.start().await;

    tracker.activate("movie_night").await.unwrap();
    sleep_ms(1600).await;

    // Circadian control takes the switch back; the scene does not care
    home.states.set_value("switch.circadian_lighting_living_room", "on");
    sleep_ms(10).await;
    assert!(tracker.is_active("movie_night").await);
    assert_eq!(tracker.counts("movie_night").await.unwrap().total(), 2);

    tracker.deactivate("movie_night").await.unwrap();
    sleep_ms(10).await;
    assert_eq!(home.states.get_state("light.living_room").as_deref(), Some("off"));
    assert_eq!(home.states.get_state("media_player.tv").as_deref(), Some("off"));
    assert_eq!(
        home.states.get_state("switch.circadian_lighting_living_room").as_deref(),
        Some("on")
    );

    sleep_ms(1600).await;
    assert_eq!(tracker.phase("movie_night").await, Some(Phase::Inactive));

    tracker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_detects_activation_by_another_caller() {
    let home = home();
    let tracker = tracker(&home);
    tracker.start().await;

    home.services
        .call(
            "scene",
            "turn_on",
            json!({"transition": 5}),
            json!({"entity_id": "scene.movie_night"}),
        )
        .await
        .unwrap();
    sleep_ms(10).await;
    assert_eq!(tracker.phase("movie_night").await, Some(Phase::OptimisticActive));
    assert_eq!(
        tracker.resolved_target("movie_night").await.as_deref(),
        Some("scene.movie_night")
    );

    // Held for the transition, not just the settle time
    sleep_ms(2000).await;
    assert_eq!(tracker.phase("movie_night").await, Some(Phase::OptimisticActive));

    sleep_ms(3100).await;
    assert_eq!(tracker.phase("movie_night").await, Some(Phase::Active));

    tracker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_change_breaks_scene() {
    let home = home();
    let tracker = tracker(&home);
    let mut changes = tracker.subscribe_changes();
    tracker.start().await;

    tracker.activate("movie_night").await.unwrap();
    sleep_ms(1600).await;
    drain(&mut changes);

    // Within tolerance
    let dimmer = serde_json::from_value(json!({"brightness": 42})).unwrap();
    home.states.set("light.living_room", "on", dimmer);
    sleep_ms(10).await;
    assert!(tracker.is_active("movie_night").await);

    let dimmer = serde_json::from_value(json!({"brightness": 43})).unwrap();
    home.states.set("light.living_room", "on", dimmer);
    sleep_ms(10).await;
    assert!(!tracker.is_active("movie_night").await);

    // Unavailable members are ignored
    let restored = serde_json::from_value(json!({"brightness": 40})).unwrap();
    home.states.set("light.living_room", "on", restored);
    home.states.set_value("media_player.tv", "unavailable");
    sleep_ms(10).await;
    assert!(tracker.is_active("movie_night").await);

    assert_eq!(
        drain(&mut changes),
        vec![
            ("movie_night".to_string(), false),
            ("movie_night".to_string(), true),
        ]
    );

    tracker.stop().await;
}
