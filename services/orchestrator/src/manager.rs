use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use modelops::{ModelName, ModelStatus, PortRegistry};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::controller::{ControllerSettings, Files, ModelController, UpdateOutcome};
use crate::endpoint::{HttpMethod, WorkerEndpoint};
use crate::error::{ControlError, Result};
use crate::supervisor::Supervisor;

/// A controller plus a lock-free view of its status.
pub struct ModelHandle {
    controller: Mutex<ModelController>,
    status: watch::Receiver<ModelStatus>,
}

impl ModelHandle {
    pub fn status(&self) -> ModelStatus {
        self.status.borrow().clone()
    }
}

/// Owns one controller per model. Reconciles of different models run
/// concurrently; calls for the same model are serialized by its mutex.
pub struct ModelManager {
    root: PathBuf,
    settings: Arc<ControllerSettings>,
    ports: Arc<PortRegistry>,
    supervisor: Arc<dyn Supervisor>,
    endpoint: Arc<dyn WorkerEndpoint>,
    models: RwLock<HashMap<ModelName, Arc<ModelHandle>>>,
}

impl ModelManager {
    pub fn new(
        settings: ControllerSettings,
        ports: Arc<PortRegistry>,
        supervisor: Arc<dyn Supervisor>,
        endpoint: Arc<dyn WorkerEndpoint>,
    ) -> Self {
        Self {
            root: ports.root().to_path_buf(),
            settings: Arc::new(settings),
            ports,
            supervisor,
            endpoint,
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the handle for `name`, creating its controller (and claiming
    /// its two ports) on first use.
    pub async fn handle(&self, name: &ModelName) -> Result<Arc<ModelHandle>> {
        if let Some(h) = self.models.read().await.get(name) {
            return Ok(h.clone());
        }

        let mut models = self.models.write().await;
        if let Some(h) = models.get(name) {
            return Ok(h.clone());
        }

        let ports = self.ports.allocate(name, 2)?;
        let controller = ModelController::new(
            name.clone(),
            self.root.join(name.as_str()),
            [ports[0], ports[1]],
            self.settings.clone(),
            self.supervisor.clone(),
            self.endpoint.clone(),
        );
        let handle = Arc::new(ModelHandle {
            status: controller.subscribe(),
            controller: Mutex::new(controller),
        });
        info!(model=%name, port_a=ports[0], port_b=ports[1], "manager: registered model");
        models.insert(name.clone(), handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, name: &ModelName) -> Option<Arc<ModelHandle>> {
        self.models.read().await.get(name).cloned()
    }

    pub async fn status(&self, name: &ModelName) -> Option<ModelStatus> {
        self.get(name).await.map(|h| h.status())
    }

    pub async fn statuses(&self) -> Vec<ModelStatus> {
        let mut all: Vec<ModelStatus> = self
            .models
            .read()
            .await
            .values()
            .map(|h| h.status())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Every model directory under the root plus every registered model.
    /// Directory names that are not valid model names are ignored.
    pub async fn discover(&self) -> Result<Vec<ModelName>> {
        let mut names: BTreeSet<ModelName> = self.models.read().await.keys().cloned().collect();

        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(names.into_iter().collect());
            }
            Err(e) => return Err(self.root_io(e)),
        };
        while let Some(entry) = dir.next_entry().await.map_err(|e| self.root_io(e))? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let raw = entry.file_name().to_string_lossy().to_string();
            match ModelName::new(raw.as_str()) {
                Ok(name) => {
                    names.insert(name);
                }
                Err(_) => debug!(dir=%raw, "manager: skipping non-model directory"),
            }
        }
        Ok(names.into_iter().collect())
    }

    fn root_io(&self, source: std::io::Error) -> ControlError {
        modelops::ModelOpsError::Io {
            path: self.root.display().to_string(),
            source,
        }
        .into()
    }

    /// One reconcile of `name`. `None` when a reconcile or update for the
    /// same model is already executing.
    pub async fn reconcile(&self, name: &ModelName) -> Result<Option<ModelStatus>> {
        let handle = self.handle(name).await?;
        let Ok(mut ctl) = handle.controller.try_lock() else {
            debug!(model=%name, "manager: reconcile already in progress");
            return Ok(None);
        };
        Ok(Some(ctl.reconcile().await))
    }

    pub async fn request_update(&self, name: &ModelName, files: &Files) -> Result<UpdateOutcome> {
        let handle = self.handle(name).await?;
        let Ok(mut ctl) = handle.controller.try_lock() else {
            return Ok(UpdateOutcome::Busy(handle.status()));
        };
        Ok(ctl.request_update(files).await)
    }

    pub async fn stop(&self, name: &ModelName) -> Result<ModelStatus> {
        let handle = self
            .get(name)
            .await
            .ok_or_else(|| ControlError::UnknownModel(name.to_string()))?;
        let mut ctl = handle.controller.lock().await;
        Ok(ctl.stop().await)
    }

    /// Forwards a request to the active slot of a serving model.
    pub async fn proxy(&self, name: &ModelName, method: HttpMethod, path: &str, payload: Bytes) -> Result<(u16, Bytes)> {
        let status = self
            .status(name)
            .await
            .ok_or_else(|| ControlError::UnknownModel(name.to_string()))?;
        if !status.is_running {
            return Err(ControlError::NotServing(name.to_string()));
        }
        let result = self
            .endpoint
            .invoke(status.active_port, method, path, payload)
            .await;
        if let Err(e) = &result {
            warn!(model=%name, port=status.active_port, "manager: proxy failed: {e}");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use modelops::ModelPhase;

    use super::*;
    use crate::controller::tests::{settings, FakeEndpoint, FakeSupervisor};
    use crate::endpoint::Health;

    fn manager(root: &std::path::Path) -> (ModelManager, Arc<FakeSupervisor>, Arc<FakeEndpoint>) {
        let sup = Arc::new(FakeSupervisor::default());
        let ep = Arc::new(FakeEndpoint::default());
        let ports = Arc::new(PortRegistry::open(root, 5005).unwrap());
        let settings = (*settings(None)).clone();
        (ModelManager::new(settings, ports, sup.clone(), ep.clone()), sup, ep)
    }

    #[tokio::test]
    async fn test_discover_dirs_and_registered() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("faq")).unwrap();
        fs::create_dir_all(tmp.path().join(".hidden")).unwrap();
        fs::write(tmp.path().join("notes.txt"), "x").unwrap();
        let (mgr, _, _) = manager(tmp.path());

        mgr.handle(&ModelName::new("support").unwrap()).await.unwrap();

        let names: Vec<String> = mgr
            .discover()
            .await
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names, vec!["faq", "support"]);
    }

    #[tokio::test]
    async fn test_discover_reports_unreadable_root() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut mgr, _, _) = manager(tmp.path());
        mgr.root = tmp.path().join("not-a-dir");
        fs::write(&mgr.root, "x").unwrap();

        assert!(matches!(
            mgr.discover().await,
            Err(ControlError::Store(modelops::ModelOpsError::Io { .. }))
        ));
    }

    #[tokio::test]
    async fn test_models_get_distinct_ports() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, _, _) = manager(tmp.path());
        let a = mgr.handle(&ModelName::new("a").unwrap()).await.unwrap();
        let b = mgr.handle(&ModelName::new("b").unwrap()).await.unwrap();
        let again = mgr.handle(&ModelName::new("a").unwrap()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_ne!(a.status().active_port, b.status().active_port);
    }

    #[tokio::test]
    async fn test_update_busy_while_locked() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, _, _) = manager(tmp.path());
        let name = ModelName::new("faq").unwrap();
        let handle = mgr.handle(&name).await.unwrap();

        let _guard = handle.controller.lock().await;
        let outcome = mgr.request_update(&name, &Files::new()).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Busy(_)));
        assert!(mgr.reconcile(&name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_proxy_requires_serving_model() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, sup, ep) = manager(tmp.path());
        let name = ModelName::new("faq").unwrap();

        assert!(matches!(
            mgr.proxy(&name, HttpMethod::Get, "/version", Bytes::new()).await,
            Err(ControlError::UnknownModel(_))
        ));

        let st = mgr.reconcile(&name).await.unwrap().unwrap();
        assert_eq!(st.phase, ModelPhase::Training);
        assert!(matches!(
            mgr.proxy(&name, HttpMethod::Get, "/version", Bytes::new()).await,
            Err(ControlError::NotServing(_))
        ));

        // trainer done, artifact present, slot A serving it
        let dir = tmp.path().join("faq");
        fs::write(dir.join("models/faq-1.tar.gz"), b"").unwrap();
        let port = st.active_port;
        sup.set("faq-train", crate::supervisor::ProcessState::Stopped);
        sup.set("faq-a", crate::supervisor::ProcessState::Running);
        ep.set(port, Health::Loaded("faq-1.tar.gz".into()));

        let st = mgr.reconcile(&name).await.unwrap().unwrap();
        assert_eq!(st.phase, ModelPhase::Running);
        let (code, body) = mgr
            .proxy(&name, HttpMethod::Post, "/webhooks/rest/webhook", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(code, 200);
        assert_eq!(body, Bytes::from(format!("{port}/webhooks/rest/webhook:2")));
    }

    #[tokio::test]
    async fn test_stop_unknown_model() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, _, _) = manager(tmp.path());
        assert!(matches!(
            mgr.stop(&ModelName::new("ghost").unwrap()).await,
            Err(ControlError::UnknownModel(_))
        ));
    }
}
