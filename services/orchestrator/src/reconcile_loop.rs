use std::sync::Arc;
use std::time::Duration;

use modelops::ModelPhase;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::manager::ModelManager;

/// Periodically reconciles every known model until `cancel` fires.
/// Each model gets its own task, so a slow supervisor or worker only
/// delays that model.
pub async fn run_reconcile_loop(manager: Arc<ModelManager>, every: Duration, cancel: CancellationToken) {
    info!(interval_secs = every.as_secs(), "reconcile_loop: started");
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let names = match manager.discover().await {
            Ok(names) => names,
            Err(e) => {
                warn!("reconcile_loop: discovery failed: {e}");
                continue;
            }
        };

        for name in names {
            let mgr = manager.clone();
            tokio::spawn(async move {
                match mgr.reconcile(&name).await {
                    Ok(Some(st)) if st.phase == ModelPhase::Error => {
                        warn!(model=%name, message=%st.message, "reconcile_loop: model in error");
                    }
                    Ok(Some(st)) => debug!(model=%name, phase=?st.phase, "reconcile_loop: reconciled"),
                    Ok(None) => {}
                    Err(e) => error!(model=%name, "reconcile_loop: {e}"),
                }
            });
        }
    }

    info!("reconcile_loop: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::{settings, FakeEndpoint, FakeSupervisor};
    use modelops::{ModelName, PortRegistry};

    #[tokio::test]
    async fn test_loop_reconciles_discovered_models_and_stops() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("faq")).unwrap();

        let sup = Arc::new(FakeSupervisor::default());
        let ports = Arc::new(PortRegistry::open(tmp.path(), 5005).unwrap());
        let mgr = Arc::new(ModelManager::new(
            (*settings(None)).clone(),
            ports,
            sup.clone(),
            Arc::new(FakeEndpoint::default()),
        ));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_reconcile_loop(
            mgr.clone(),
            Duration::from_millis(20),
            cancel.clone(),
        ));

        let name = ModelName::new("faq").unwrap();
        let mut phase = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            phase = mgr.status(&name).await.map(|s| s.phase);
            if phase == Some(ModelPhase::Training) {
                break;
            }
        }
        assert_eq!(phase, Some(ModelPhase::Training));
        assert_eq!(sup.count("restart faq-train"), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
