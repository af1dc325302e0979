use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub model_root: PathBuf,
    pub template_dir: Option<PathBuf>,

    pub supervisor_url: String,
    pub supervisorctl: Vec<String>,

    pub trainer_command: String,
    pub worker_command: String,
    pub port_base: u16,
    pub cpu_reserve: usize,

    pub reconcile_interval: Duration,
    pub call_timeout: Duration,
    pub swap_timeout: Duration,

    pub worker: WorkerApiConfig,
}

/// Worker HTTP contract. The status codes are configurable because workers
/// disagree on what "no model loaded" looks like.
#[derive(Clone, Debug)]
pub struct WorkerApiConfig {
    pub status_path: String,
    pub swap_path: String,
    pub artifact_field: String,
    pub health_ok_status: u16,
    pub health_unloaded_status: u16,
    pub swap_success_status: u16,
}

impl Default for WorkerApiConfig {
    fn default() -> Self {
        Self {
            status_path: "/status".to_string(),
            swap_path: "/model".to_string(),
            artifact_field: "model_file".to_string(),
            health_ok_status: 200,
            health_unloaded_status: 409,
            swap_success_status: 204,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = var_or("ORCH_BIND_ADDR", "0.0.0.0:5000");
        let model_root = PathBuf::from(var_or("MODEL_ROOT", "data/model"));
        let template_dir = std::env::var("TEMPLATE_DIR").ok().map(PathBuf::from);

        let supervisor_url = var_or("SUPERVISOR_URL", "http://127.0.0.1:9999/RPC2");
        let supervisorctl: Vec<String> = var_or("SUPERVISORCTL", "supervisorctl")
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let trainer_command = var_or("TRAINER_COMMAND", "rasa train --num-threads {threads}");
        let worker_command = var_or(
            "WORKER_COMMAND",
            "rasa run --enable-api --port {port} --model models",
        );

        let defaults = WorkerApiConfig::default();
        let worker = WorkerApiConfig {
            status_path: var_or("WORKER_STATUS_PATH", &defaults.status_path),
            swap_path: var_or("WORKER_SWAP_PATH", &defaults.swap_path),
            artifact_field: var_or("WORKER_ARTIFACT_FIELD", &defaults.artifact_field),
            health_ok_status: parse("HEALTH_OK_STATUS", defaults.health_ok_status)?,
            health_unloaded_status: parse("HEALTH_UNLOADED_STATUS", defaults.health_unloaded_status)?,
            swap_success_status: parse("SWAP_SUCCESS_STATUS", defaults.swap_success_status)?,
        };

        let cfg = Self {
            bind_addr,
            model_root,
            template_dir,
            supervisor_url,
            supervisorctl,
            trainer_command,
            worker_command,
            port_base: parse("PORT_BASE", 5005)?,
            cpu_reserve: parse("CPU_RESERVE", 2)?,
            reconcile_interval: Duration::from_secs(parse("RECONCILE_INTERVAL_SECS", 10)?),
            call_timeout: Duration::from_secs(parse("CALL_TIMEOUT_SECS", 5)?),
            swap_timeout: Duration::from_secs(parse("SWAP_TIMEOUT_SECS", 60)?),
            worker,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    // fail fast, fail loud
    fn validate(&self) -> Result<()> {
        if !self.supervisor_url.starts_with("http://") && !self.supervisor_url.starts_with("https://") {
            bail!("SUPERVISOR_URL must start with http:// or https://");
        }
        if self.supervisorctl.is_empty() {
            bail!("SUPERVISORCTL must not be empty");
        }
        if !self.worker_command.contains("{port}") {
            bail!("WORKER_COMMAND must contain a {{port}} placeholder");
        }
        if self.reconcile_interval.is_zero() {
            bail!("RECONCILE_INTERVAL_SECS must be positive");
        }
        if self.call_timeout < Duration::from_secs(2) {
            bail!("CALL_TIMEOUT_SECS must be at least 2");
        }
        for path in [&self.worker.status_path, &self.worker.swap_path] {
            if !path.starts_with('/') {
                bail!("worker paths must start with '/': {path}");
            }
        }
        Ok(())
    }

    /// supervisord `stopwaitsecs`: a stop must finish inside one call.
    pub fn stop_wait_secs(&self) -> u64 {
        self.call_timeout.as_secs().saturating_sub(1).max(1)
    }

    /// Thread hint passed to the trainer: all cores minus a reserve.
    pub fn trainer_threads(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cores.saturating_sub(self.cpu_reserve).max(1)
    }
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for env var {key}: {v:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl AppConfig {
    pub fn for_tests(model_root: PathBuf) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            model_root,
            template_dir: None,
            supervisor_url: "http://127.0.0.1:9999/RPC2".to_string(),
            supervisorctl: vec!["supervisorctl".to_string()],
            trainer_command: "rasa train --num-threads {threads}".to_string(),
            worker_command: "rasa run --enable-api --port {port} --model models".to_string(),
            port_base: 5005,
            cpu_reserve: 2,
            reconcile_interval: Duration::from_secs(10),
            call_timeout: Duration::from_secs(5),
            swap_timeout: Duration::from_secs(60),
            worker: WorkerApiConfig::default(),
        }
    }
}
