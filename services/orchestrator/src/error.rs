use thiserror::Error;

/// Failures a reconcile step can hit. All of them end up as
/// `phase=Error` plus message on the model status.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("supervisor unavailable: {0}")]
    SupervisionUnavailable(String),
    #[error("supervisor rejected {call}: {fault}")]
    SupervisionFault { call: String, fault: String },
    #[error("worker endpoint unreachable on port {port}: {detail}")]
    EndpointUnreachable { port: u16, detail: String },
    #[error("artifact swap rejected on port {port}: {detail}")]
    SwapRejected { port: u16, detail: String },
    #[error("training already in progress for {0}")]
    DuplicateTraining(String),
    #[error("unknown model {0}")]
    UnknownModel(String),
    #[error("model {0} is not serving")]
    NotServing(String),
    #[error(transparent)]
    Store(modelops::ModelOpsError),
}

impl From<modelops::ModelOpsError> for ControlError {
    fn from(e: modelops::ModelOpsError) -> Self {
        match e {
            modelops::ModelOpsError::InvalidConfig { path, reason } => {
                ControlError::InvalidConfig(format!("{path}: {reason}"))
            }
            other => ControlError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
