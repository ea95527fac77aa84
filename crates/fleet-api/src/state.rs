use std::sync::Arc;

use fleet_infra::Deployer;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub deployer: Arc<Deployer>,
    pub config: AppConfig,
}
