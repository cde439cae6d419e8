//! Async scene tracker
//!
//! `SceneTracker` owns a [`SceneEngine`] and drives it from one spawned loop
//! that selects over dispatched service calls, member state changes,
//! activate/deactivate commands, fired window timers and a shutdown signal.
//! Host events already delivered are always handled before a command, so a
//! command never overtakes the service call of an earlier one. Changes of a
//! scene's visible active flag are broadcast to subscribers.

use crate::engine::{SceneChange, SceneEngine, TrackerOptions};
use crate::error::TrackerError;
use crate::host::{SceneHost, StateSource};
use crate::resolver::StateTargetResolver;
use crate::runtime::{ExclusionFilter, MatchCounts, Phase};
use crate::scheduler::{TokioScheduler, WindowElapsed};
use scene_core::SceneDefinition;
use scene_event_bus::RecvError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the scene change broadcast channel
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A command applied by the tracker loop
enum Command {
    Activate {
        scene_id: String,
        reply: oneshot::Sender<Result<String, TrackerError>>,
    },
    Deactivate {
        scene_id: String,
        reply: oneshot::Sender<Result<Vec<String>, TrackerError>>,
    },
}

impl Command {
    fn apply(self, engine: &mut SceneEngine) {
        // A dropped reply means the caller went away
        match self {
            Command::Activate { scene_id, reply } => {
                let _ = reply.send(engine.begin_activate(&scene_id));
            }
            Command::Deactivate { scene_id, reply } => {
                let _ = reply.send(engine.begin_deactivate(&scene_id));
            }
        }
    }
}

/// Tracks which scenes are currently active on a host
pub struct SceneTracker {
    engine: Arc<Mutex<SceneEngine>>,
    host: Arc<dyn SceneHost>,
    changes_tx: broadcast::Sender<SceneChange>,
    shutdown_tx: broadcast::Sender<()>,
    commands_tx: mpsc::UnboundedSender<Command>,
    running: Arc<AtomicBool>,
    /// Fired windows; taken by the loop on start
    timers: std::sync::Mutex<Option<mpsc::UnboundedReceiver<WindowElapsed>>>,
    commands: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SceneTracker {
    /// Create a tracker for `definitions`; nothing runs until [`start`](Self::start)
    pub fn new<H>(
        host: Arc<H>,
        definitions: impl IntoIterator<Item = SceneDefinition>,
        options: TrackerOptions,
        exclusions: &ExclusionFilter,
    ) -> Self
    where
        H: SceneHost + 'static,
    {
        let (scheduler, timers) = TokioScheduler::new();
        let states: Arc<dyn StateSource> = host.clone();
        let engine = SceneEngine::new(
            definitions,
            options,
            exclusions,
            states.clone(),
            Arc::new(StateTargetResolver::new(states)),
            Arc::new(scheduler),
        );

        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);
        let (commands_tx, commands) = mpsc::unbounded_channel();

        Self {
            engine: Arc::new(Mutex::new(engine)),
            host,
            changes_tx,
            shutdown_tx,
            commands_tx,
            running: Arc::new(AtomicBool::new(false)),
            timers: std::sync::Mutex::new(Some(timers)),
            commands: std::sync::Mutex::new(Some(commands)),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Evaluate every scene and start following the host
    ///
    /// A tracker starts at most once; later calls only warn.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scene tracker already running");
            return;
        }
        let timers = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let commands = self
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let (Some(mut timers), Some(mut commands)) = (timers, commands) else {
            warn!("Scene tracker cannot be restarted");
            self.running.store(false, Ordering::SeqCst);
            return;
        };

        let mut changes_rx = {
            let mut engine = self.engine.lock().await;
            let members = engine.member_ids();
            info!(
                scenes = engine.scene_ids().len(),
                members = members.len(),
                "Starting scene tracker"
            );
            let changes_rx = self.host.subscribe_state_changes(members);
            engine.start();
            self.broadcast(engine.take_changes());
            changes_rx
        };
        let mut calls_rx = self.host.subscribe_service_calls();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let engine = self.engine.clone();
        let changes_tx = self.changes_tx.clone();
        let running = self.running.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        debug!("Received shutdown signal");
                        break;
                    }
                    call = calls_rx.recv() => {
                        match call {
                            Ok(call) => {
                                let mut engine = engine.lock().await;
                                engine.on_service_call(&call.data);
                                send_changes(&changes_tx, engine.take_changes());
                            }
                            Err(RecvError::Lagged(n)) => {
                                warn!("Scene tracker lagged by {} service calls", n);
                            }
                            Err(RecvError::Closed) => {
                                info!("Service call stream closed, stopping scene tracker");
                                break;
                            }
                        }
                    }
                    change = changes_rx.recv() => {
                        let mut engine = engine.lock().await;
                        match change {
                            Ok(change) => engine.on_state_changed(&change),
                            Err(RecvError::Lagged(n)) => {
                                warn!("Scene tracker lagged by {} state changes, resyncing", n);
                                engine.resync();
                            }
                            Err(RecvError::Closed) => {
                                info!("State change stream closed, stopping scene tracker");
                                break;
                            }
                        }
                        send_changes(&changes_tx, engine.take_changes());
                    }
                    Some(command) = commands.recv() => {
                        let mut engine = engine.lock().await;
                        command.apply(&mut engine);
                        send_changes(&changes_tx, engine.take_changes());
                    }
                    Some(elapsed) = timers.recv() => {
                        let mut engine = engine.lock().await;
                        engine.on_window_elapsed(elapsed);
                        send_changes(&changes_tx, engine.take_changes());
                    }
                }
            }

            engine.lock().await.shutdown();
            running.store(false, Ordering::SeqCst);
            info!("Scene tracker stopped");
        });

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Stop following the host and cancel every window
    ///
    /// Waits for the loop to exit. Safe to call more than once.
    pub async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };

        info!("Stopping scene tracker");
        let _ = self.shutdown_tx.send(());
        if let Err(e) = task.await {
            warn!(error = %e, "Scene tracker task ended abnormally");
            self.engine.lock().await.shutdown();
            self.running.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Receive every change of a scene's visible active flag
    pub fn subscribe_changes(&self) -> broadcast::Receiver<SceneChange> {
        self.changes_tx.subscribe()
    }

    /// Activate a scene and wait for the host to apply it
    ///
    /// The scene is reported active right away. If the host rejects the
    /// command the error is returned and the optimistic window still runs
    /// out normally.
    pub async fn activate(&self, scene_id: &str) -> Result<(), TrackerError> {
        let target = self
            .run(
                |reply| Command::Activate {
                    scene_id: scene_id.to_string(),
                    reply,
                },
                |engine| engine.begin_activate(scene_id),
            )
            .await?;

        debug!(scene_id, target = %target, "Activating scene");
        self.host
            .activate_scene(&target)
            .await
            .map_err(|source| TrackerError::Dispatch {
                scene_id: scene_id.to_string(),
                source,
            })
    }

    /// Deactivate a scene and turn its members off in the background
    ///
    /// The scene is reported inactive right away. A failed turn-off is
    /// logged and the suppression window still runs out normally.
    pub async fn deactivate(&self, scene_id: &str) -> Result<(), TrackerError> {
        let members = self
            .run(
                |reply| Command::Deactivate {
                    scene_id: scene_id.to_string(),
                    reply,
                },
                |engine| engine.begin_deactivate(scene_id),
            )
            .await?;
        if members.is_empty() {
            return Ok(());
        }

        debug!(scene_id, members = members.len(), "Turning scene members off");
        let host = self.host.clone();
        let scene_id = scene_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = host.turn_off(members).await {
                warn!(scene_id = %scene_id, error = %e, "Failed to turn off scene members");
            }
        });
        Ok(())
    }

    pub async fn is_active(&self, scene_id: &str) -> bool {
        self.engine.lock().await.is_active(scene_id)
    }

    pub async fn resolved_target(&self, scene_id: &str) -> Option<String> {
        self.engine.lock().await.resolved_target(scene_id)
    }

    pub async fn phase(&self, scene_id: &str) -> Option<Phase> {
        self.engine.lock().await.phase(scene_id)
    }

    pub async fn counts(&self, scene_id: &str) -> Option<MatchCounts> {
        self.engine.lock().await.counts(scene_id)
    }

    pub async fn scene_ids(&self) -> Vec<String> {
        self.engine.lock().await.scene_ids()
    }

    /// The tracked definition, with excluded members removed
    pub async fn definition(&self, scene_id: &str) -> Option<SceneDefinition> {
        self.engine.lock().await.definition(scene_id).cloned()
    }

    /// Apply a command in order with the host events already delivered
    ///
    /// Without a running loop there are no events to order against and the
    /// command goes straight to the engine.
    async fn run<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
        direct: impl FnOnce(&mut SceneEngine) -> T,
    ) -> T {
        if self.is_running() {
            let (reply, rx) = oneshot::channel();
            if self.commands_tx.send(command(reply)).is_ok() {
                if let Ok(result) = rx.await {
                    return result;
                }
            }
        }

        let mut engine = self.engine.lock().await;
        let result = direct(&mut engine);
        self.broadcast(engine.take_changes());
        result
    }

    fn broadcast(&self, changes: Vec<SceneChange>) {
        send_changes(&self.changes_tx, changes);
    }
}

fn send_changes(tx: &broadcast::Sender<SceneChange>, changes: Vec<SceneChange>) {
    for change in changes {
        debug!(scene_id = %change.scene_id, active = change.active, "Scene changed");
        // Nobody listening is fine
        let _ = tx.send(change);
    }
}
