use std::sync::Arc;

use crate::config::AppConfig;
use crate::manager::ModelManager;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub manager: Arc<ModelManager>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(manager: Arc<ModelManager>, config: AppConfig) -> Self {
        Self { manager, config }
    }
}
