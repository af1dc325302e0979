use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use modelops::{
    training_process_name, write_programs_if_missing, Artifact, ArtifactStore, ModelName,
    ModelOpsError, ModelPhase, ModelStatus, ProgramSpec, Slot, SlotId, ARTIFACT_DIR,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::endpoint::{Health, WorkerEndpoint};
use crate::error::{ControlError, Result};
use crate::supervisor::{ProcessState, Supervisor};

/// Relative path -> file content, as supplied with an update request.
pub type Files = BTreeMap<String, String>;

/// Settings shared by every controller.
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub template_dir: Option<PathBuf>,
    pub programs: ProgramSpec,
}

#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Accepted(ModelStatus),
    Busy(ModelStatus),
    Rejected(String),
}

/// At most one outstanding training run per model.
#[derive(Debug)]
struct TrainingJob {
    process: String,
    in_flight: bool,
}

/// Effect of an explicit stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    None,
    /// Requested but not every process confirmed stopped; retried on reconcile.
    Stopping,
    Stopped,
}

/// Lifecycle state machine of a single model.
///
/// Every mutation goes through `&mut self`, so callers serialize access
/// (the manager keeps each controller behind its own mutex). Readers get
/// the status through the `watch` channel and never wait on a reconcile.
pub struct ModelController {
    name: ModelName,
    store: ArtifactStore,
    slots: [Slot; 2],
    active: SlotId,
    training: TrainingJob,
    /// Set by an explicit stop; cleared by the next update request.
    hold: Hold,
    /// Accepted update whose training run has not been started yet.
    pending: Option<Files>,
    config_applied: bool,
    settings: Arc<ControllerSettings>,
    supervisor: Arc<dyn Supervisor>,
    endpoint: Arc<dyn WorkerEndpoint>,
    status: watch::Sender<ModelStatus>,
}

impl ModelController {
    pub fn new(
        name: ModelName,
        dir: PathBuf,
        ports: [u16; 2],
        settings: Arc<ControllerSettings>,
        supervisor: Arc<dyn Supervisor>,
        endpoint: Arc<dyn WorkerEndpoint>,
    ) -> Self {
        let slots = [
            Slot::new(&name, SlotId::A, ports[0]),
            Slot::new(&name, SlotId::B, ports[1]),
        ];
        let (status, _) = watch::channel(ModelStatus::new(&name, &slots[0]));
        Self {
            training: TrainingJob {
                process: training_process_name(&name),
                in_flight: false,
            },
            store: ArtifactStore::new(dir),
            name,
            slots,
            active: SlotId::A,
            hold: Hold::None,
            pending: None,
            config_applied: false,
            settings,
            supervisor,
            endpoint,
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ModelStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ModelStatus {
        self.status.borrow().clone()
    }

    pub fn active_slot(&self) -> &Slot {
        self.slot(self.active)
    }

    /// Advances the state machine one step toward "serving the latest
    /// artifact". Never fails: errors land in the published status and the
    /// next call starts over. An update that could not start its training
    /// run is retried here.
    pub async fn reconcile(&mut self) -> ModelStatus {
        match self.hold {
            Hold::Stopped => {
                debug!(model=%self.name, "reconcile: stopped, skipping");
                return self.status();
            }
            Hold::Stopping => return self.stop().await,
            Hold::None => {}
        }

        let pending = self.pending.take();
        match self.step(pending.as_ref()).await {
            Ok(()) => {}
            Err(ControlError::DuplicateTraining(_)) => {
                debug!(model=%self.name, "reconcile: update waits for running training");
                self.pending = pending;
            }
            Err(e) if is_invalid_update(&e) => {
                warn!(model=%self.name, "reconcile: dropping pending update: {e}");
                self.fail(e);
            }
            Err(e) => {
                self.pending = pending;
                self.fail(e);
            }
        }
        self.status()
    }

    /// Writes `files` and retrains. Busy while a training run is in flight.
    /// Files are validated before anything else; once validated the update
    /// is kept until its training run has been started.
    pub async fn request_update(&mut self, files: &Files) -> UpdateOutcome {
        let hold = std::mem::replace(&mut self.hold, Hold::None);
        match self.step(Some(files)).await {
            Ok(()) => {
                self.pending = None;
                UpdateOutcome::Accepted(self.status())
            }
            Err(ControlError::DuplicateTraining(_)) => UpdateOutcome::Busy(self.status()),
            Err(e) if is_invalid_update(&e) => {
                warn!(model=%self.name, "update rejected: {e}");
                self.hold = hold;
                UpdateOutcome::Rejected(e.to_string())
            }
            Err(e) => {
                info!(model=%self.name, "update queued until the next reconcile");
                self.pending = Some(files.clone());
                self.fail(e);
                UpdateOutcome::Accepted(self.status())
            }
        }
    }

    /// Stops the trainer and both slots. The model stays stopped until the
    /// next update request; if a stop call fails, reconcile repeats it.
    pub async fn stop(&mut self) -> ModelStatus {
        self.hold = Hold::Stopping;
        let mut result = self.supervisor.stop(&self.training.process).await;
        for slot in &self.slots {
            if result.is_err() {
                break;
            }
            result = self.supervisor.stop(&slot.process).await;
        }
        match result {
            Ok(()) => {
                self.hold = Hold::Stopped;
                self.pending = None;
                self.training.in_flight = false;
                info!(model=%self.name, "stopped");
                self.publish(|s| {
                    s.phase = ModelPhase::Stopped;
                    s.message = "stopped by request".to_string();
                    s.is_running = false;
                    s.active_artifact.clear();
                });
            }
            Err(e) => self.fail(e),
        }
        self.status()
    }

    async fn step(&mut self, update: Option<&Files>) -> Result<()> {
        if let Some(files) = update {
            self.store
                .check_all(files.iter().map(|(p, c)| (p.as_str(), c.as_bytes())))?;
        }
        self.provision().await?;

        if self.refresh_training().await? {
            self.publish(|s| {
                s.phase = ModelPhase::Training;
                s.message = "training in progress".to_string();
            });
            if update.is_some() {
                return Err(ControlError::DuplicateTraining(self.name.to_string()));
            }
            return Ok(());
        }

        let latest = match (self.store.latest()?, update) {
            (Some(latest), None) => latest,
            (_, update) => return self.start_training(update).await,
        };

        let a = self.slot_running(SlotId::A).await;
        let b = self.slot_running(SlotId::B).await;
        match (a, b) {
            (true, true) => self.resolve_overlap(&latest).await,
            (false, false) => self.start_active().await,
            (true, false) => self.converge(SlotId::A, &latest).await,
            (false, true) => self.converge(SlotId::B, &latest).await,
        }
    }

    /// Creates the directory layout and process definitions, then makes the
    /// supervisor load them (once per controller, and whenever a definition
    /// was written).
    async fn provision(&mut self) -> Result<()> {
        if !self.store.artifact_dir().is_dir() {
            let copied = self
                .store
                .deploy_defaults(self.settings.template_dir.as_deref())?;
            info!(model=%self.name, copied, dir=%self.store.dir().display(), "provisioned model directory");
        }
        if write_programs_if_missing(&self.name, self.store.dir(), &self.slots, &self.settings.programs)? {
            info!(model=%self.name, "wrote process definitions");
            self.config_applied = false;
        }
        if !self.config_applied {
            self.supervisor.apply_config().await?;
            self.config_applied = true;
        }
        Ok(())
    }

    /// Refreshes the in-flight flag from the supervisor. A trainer that is
    /// already running (e.g. from a previous orchestrator) is adopted.
    async fn refresh_training(&mut self) -> Result<bool> {
        let running = self.supervisor.process_state(&self.training.process).await? == ProcessState::Running;
        match (self.training.in_flight, running) {
            (true, false) => info!(model=%self.name, "training finished"),
            (false, true) => info!(model=%self.name, "found training in progress"),
            _ => {}
        }
        self.training.in_flight = running;
        Ok(running)
    }

    async fn start_training(&mut self, update: Option<&Files>) -> Result<()> {
        if let Some(files) = update {
            let changed = self
                .store
                .put_all(files.iter().map(|(p, c)| (p.as_str(), c.as_bytes())))?;
            info!(model=%self.name, files=files.len(), changed, "applied configuration update");
        }
        self.store
            .deploy_defaults(self.settings.template_dir.as_deref())?;

        self.supervisor.restart(&self.training.process, true).await?;
        self.training.in_flight = true;
        info!(model=%self.name, process=%self.training.process, "training started");

        let message = if update.is_some() {
            "training with updated configuration"
        } else {
            "no artifact yet, training"
        };
        self.publish(|s| {
            s.phase = ModelPhase::Training;
            s.message = message.to_string();
        });
        Ok(())
    }

    /// Neither slot is up: bring the designated active slot back.
    async fn start_active(&mut self) -> Result<()> {
        let slot = self.active_slot().clone();
        self.supervisor.restart(&slot.process, false).await?;
        info!(model=%self.name, slot=%slot.id, port=slot.port, "starting slot");
        self.publish(|s| {
            s.phase = ModelPhase::Starting;
            s.message = format!("starting slot {} on port {}", slot.id, slot.port);
            s.is_running = false;
            s.active_artifact.clear();
        });
        Ok(())
    }

    /// Exactly one slot is up. It becomes the active slot; if it serves a
    /// stale artifact the other slot is started with the latest one.
    async fn converge(&mut self, live: SlotId, latest: &Artifact) -> Result<()> {
        if live != self.active {
            info!(model=%self.name, slot=%live, "only live slot, designating active");
            self.active = live;
        }
        let slot = self.slot(live).clone();

        match self.endpoint.health(slot.port).await {
            Health::Unreachable => {
                self.publish(|s| {
                    s.phase = ModelPhase::Starting;
                    s.message = format!("waiting for slot {} on port {}", slot.id, slot.port);
                    s.is_running = false;
                    s.active_artifact.clear();
                });
            }
            Health::Unloaded { status } => {
                debug!(model=%self.name, slot=%slot.id, status, "slot up without artifact");
                self.load_latest(&slot, latest).await?;
                self.publish(|s| {
                    s.phase = ModelPhase::Starting;
                    s.message = format!("loading {} into slot {}", latest.filename, slot.id);
                    s.is_running = false;
                    s.active_artifact.clear();
                });
            }
            Health::Loaded(current) if current == latest.filename => {
                self.publish_serving(&current, latest);
            }
            Health::Loaded(current) => {
                let standby = self.slot(live.other()).clone();
                self.supervisor.restart(&standby.process, true).await?;
                info!(
                    model=%self.name,
                    from=%current,
                    to=%latest.filename,
                    slot=%standby.id,
                    "replacing artifact"
                );
                self.publish(|s| {
                    s.phase = ModelPhase::Replacing;
                    s.message = format!("starting slot {} for {}", standby.id, latest.filename);
                    s.is_running = true;
                    s.active_artifact = current.clone();
                });
            }
        }
        Ok(())
    }

    /// Both slots are up. Once both have an artifact loaded, the one with
    /// the newer (greater) artifact name wins and the other is stopped.
    async fn resolve_overlap(&mut self, latest: &Artifact) -> Result<()> {
        let active = self.active_slot().clone();
        let standby = self.slot(self.active.other()).clone();
        let active_health = self.endpoint.health(active.port).await;
        let standby_health = self.endpoint.health(standby.port).await;

        match (active_health.artifact(), standby_health.artifact()) {
            (Some(current), Some(candidate)) => {
                let (winner, loser, artifact) = if candidate > current {
                    (standby, active, candidate.to_string())
                } else {
                    (active, standby, current.to_string())
                };
                self.retire(&loser, &winner).await?;
                self.publish_serving(&artifact, latest);
            }
            (None, Some(candidate)) => {
                let artifact = candidate.to_string();
                self.retire(&active, &standby).await?;
                self.publish_serving(&artifact, latest);
            }
            (Some(current), None) => {
                if let Health::Unloaded { .. } = standby_health {
                    self.load_latest(&standby, latest).await?;
                }
                let current = current.to_string();
                self.publish(|s| {
                    s.phase = ModelPhase::Replacing;
                    s.message = format!("warming up slot {} on port {}", standby.id, standby.port);
                    s.is_running = true;
                    s.active_artifact = current;
                });
            }
            (None, None) => {
                if let Health::Unloaded { .. } = active_health {
                    self.load_latest(&active, latest).await?;
                }
                self.publish(|s| {
                    s.phase = ModelPhase::Starting;
                    s.message = "waiting for a slot to load an artifact".to_string();
                    s.is_running = false;
                    s.active_artifact.clear();
                });
            }
        }
        Ok(())
    }

    async fn retire(&mut self, loser: &Slot, winner: &Slot) -> Result<()> {
        self.supervisor.stop(&loser.process).await?;
        self.active = winner.id;
        info!(model=%self.name, stopped=%loser.id, active=%winner.id, "retired slot");
        Ok(())
    }

    async fn load_latest(&self, slot: &Slot, latest: &Artifact) -> Result<()> {
        let reference = format!("{ARTIFACT_DIR}/{}", latest.filename);
        let outcome = self.endpoint.swap_artifact(slot.port, &reference).await;
        if !outcome.accepted {
            return Err(ControlError::SwapRejected {
                port: slot.port,
                detail: outcome.detail,
            });
        }
        info!(model=%self.name, slot=%slot.id, artifact=%latest.filename, "swap accepted");
        Ok(())
    }

    async fn slot_running(&self, id: SlotId) -> bool {
        let slot = self.slot(id);
        match self.supervisor.process_state(&slot.process).await {
            Ok(state) => state == ProcessState::Running,
            Err(e) => {
                warn!(model=%self.name, slot=%id, "state unknown, assuming stopped: {e}");
                false
            }
        }
    }

    fn publish_serving(&self, artifact: &str, latest: &Artifact) {
        let (phase, message) = if artifact == latest.filename {
            (ModelPhase::Running, String::new())
        } else {
            (
                ModelPhase::Replacing,
                format!("serving {artifact}, latest is {}", latest.filename),
            )
        };
        self.publish(|s| {
            s.phase = phase;
            s.message = message;
            s.is_running = true;
            s.active_artifact = artifact.to_string();
        });
    }

    fn fail(&self, e: ControlError) {
        warn!(model=%self.name, "reconcile failed: {e}");
        self.publish(|s| {
            s.phase = ModelPhase::Error;
            s.message = e.to_string();
        });
    }

    fn publish(&self, f: impl FnOnce(&mut ModelStatus)) {
        let active = self.active_slot();
        self.status.send_modify(|s| {
            f(s);
            s.active_slot = active.id;
            s.active_port = active.port;
            s.updated_at = Utc::now();
        });
    }

    fn slot(&self, id: SlotId) -> &Slot {
        match id {
            SlotId::A => &self.slots[0],
            SlotId::B => &self.slots[1],
        }
    }
}

fn is_invalid_update(e: &ControlError) -> bool {
    matches!(
        e,
        ControlError::InvalidConfig(_) | ControlError::Store(ModelOpsError::InvalidPath(_))
    )
}

#[cfg(test)]
impl ModelController {
    pub fn training_in_flight(&self) -> bool {
        self.training.in_flight
    }
}
