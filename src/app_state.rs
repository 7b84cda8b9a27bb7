use std::sync::Arc;

use crate::{config::AppConfig, upstream::connector::UpstreamBackend};

pub struct AppState {
    pub config: AppConfig,
    pub upstream: Arc<dyn UpstreamBackend>,
}

impl AppState {
    pub fn new(config: AppConfig, upstream: Arc<dyn UpstreamBackend>) -> Self {
        Self { config, upstream }
    }
}
