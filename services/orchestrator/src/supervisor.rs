use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};
use crate::xmlrpc::{self, Param, Value, XmlRpcError};

// supervisord fault codes
const FAULT_BAD_NAME: i64 = 10;
const FAULT_ALREADY_STARTED: i64 = 60;
const FAULT_NOT_RUNNING: i64 = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    Running,
    Stopped,
    Unknown,
}

impl ProcessState {
    /// Maps a supervisord `statename`.
    pub fn from_statename(name: &str) -> Self {
        match name {
            "STARTING" | "RUNNING" | "BACKOFF" => ProcessState::Running,
            "STOPPED" | "STOPPING" | "EXITED" | "FATAL" => ProcessState::Stopped,
            _ => ProcessState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub group: String,
    pub state: ProcessState,
    pub description: String,
}

/// Narrow view of the external process supervisor.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn process_state(&self, name: &str) -> Result<ProcessState>;
    async fn all_process_info(&self) -> Result<Vec<ProcessInfo>>;
    async fn start(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;
    /// No-op when the process is already running and `force` is false.
    async fn restart(&self, name: &str, force: bool) -> Result<()>;
    /// Makes the supervisor pick up newly written program definitions.
    async fn apply_config(&self) -> Result<()>;
}

/// supervisord over its XML-RPC interface.
pub struct SupervisorRpc {
    url: String,
    ctl: Vec<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl SupervisorRpc {
    pub fn new(url: String, ctl: Vec<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url,
            ctl,
            timeout,
            client,
        })
    }

    async fn call(&self, method: &str, params: &[Param<'_>]) -> std::result::Result<Value, XmlRpcError> {
        let body = xmlrpc::encode_call(method, params);
        let resp = self
            .client
            .post(&self.url)
            .header("Content-Type", "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| XmlRpcError::Malformed(format!("transport: {e}")))?;
        if !resp.status().is_success() {
            return Err(XmlRpcError::Malformed(format!("HTTP {}", resp.status())));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| XmlRpcError::Malformed(format!("transport: {e}")))?;
        xmlrpc::decode_response(&text)
    }

    fn convert(method: &str, e: XmlRpcError) -> ControlError {
        match e {
            XmlRpcError::Fault { code, message } => ControlError::SupervisionFault {
                call: method.to_string(),
                fault: format!("{code} {message}"),
            },
            other => ControlError::SupervisionUnavailable(format!("{method}: {other}")),
        }
    }
}

fn process_info(v: &Value) -> ProcessInfo {
    let field = |k: &str| v.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
    ProcessInfo {
        name: field("name"),
        group: field("group"),
        state: ProcessState::from_statename(&field("statename")),
        description: field("description"),
    }
}

fn is_fault(e: &XmlRpcError, code: i64) -> bool {
    matches!(e, XmlRpcError::Fault { code: c, .. } if *c == code)
}

#[async_trait]
impl Supervisor for SupervisorRpc {
    async fn process_state(&self, name: &str) -> Result<ProcessState> {
        const M: &str = "supervisor.getProcessInfo";
        match self.call(M, &[Param::Str(name)]).await {
            Ok(v) => Ok(process_info(&v).state),
            Err(e) if is_fault(&e, FAULT_BAD_NAME) => Ok(ProcessState::Unknown),
            Err(e) => Err(Self::convert(M, e)),
        }
    }

    async fn all_process_info(&self) -> Result<Vec<ProcessInfo>> {
        const M: &str = "supervisor.getAllProcessInfo";
        let v = self.call(M, &[]).await.map_err(|e| Self::convert(M, e))?;
        Ok(v.as_array()
            .unwrap_or_default()
            .iter()
            .map(process_info)
            .collect())
    }

    async fn start(&self, name: &str) -> Result<()> {
        const M: &str = "supervisor.startProcess";
        match self.call(M, &[Param::Str(name), Param::Bool(false)]).await {
            Ok(_) => {
                info!(process=%name, "supervisor: started");
                Ok(())
            }
            Err(e) if is_fault(&e, FAULT_ALREADY_STARTED) => Ok(()),
            Err(e) => Err(Self::convert(M, e)),
        }
    }

    async fn stop(&self, name: &str) -> Result<()> {
        const M: &str = "supervisor.stopProcess";
        match self.call(M, &[Param::Str(name), Param::Bool(true)]).await {
            Ok(_) => {
                info!(process=%name, "supervisor: stopped");
                Ok(())
            }
            Err(e) if is_fault(&e, FAULT_NOT_RUNNING) => Ok(()),
            Err(e) => Err(Self::convert(M, e)),
        }
    }

    async fn restart(&self, name: &str, force: bool) -> Result<()> {
        if !force && self.process_state(name).await? == ProcessState::Running {
            debug!(process=%name, "supervisor: already running, restart skipped");
            return Ok(());
        }
        self.stop(name).await?;
        self.start(name).await
    }

    async fn apply_config(&self) -> Result<()> {
        const M: &str = "supervisor.reloadConfig";
        // reloadConfig only computes the diff; it does not add or remove
        // process groups, so `supervisorctl update` has to follow.
        if let Err(e) = self.call(M, &[]).await {
            warn!("supervisor: reloadConfig failed: {e}");
        }

        let (program, args) = self
            .ctl
            .split_first()
            .ok_or_else(|| ControlError::SupervisionUnavailable("empty supervisorctl command".into()))?;
        let mut cmd = Command::new(program);
        cmd.args(args).arg("update").kill_on_drop(true);

        let out = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ControlError::SupervisionUnavailable("supervisorctl update timed out".into()))?
            .map_err(|e| ControlError::SupervisionUnavailable(format!("supervisorctl: {e}")))?;

        if !out.status.success() {
            return Err(ControlError::SupervisionUnavailable(format!(
                "supervisorctl update exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        info!("supervisor: configuration applied");
        Ok(())
    }
}
