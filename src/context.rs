use std::sync::Arc;

use crate::adapters;
use crate::config::AppConfig;
use crate::core::hardware::HardwareAdapter;
use crate::core::transfer_engine::{TransferEngine, TransferEngineType, create_engine};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub adapter: Arc<dyn HardwareAdapter>,
    pub engine: Arc<dyn TransferEngine>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        adapter: Arc<dyn HardwareAdapter>,
        engine: Arc<dyn TransferEngine>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            adapter,
            engine,
        }
    }

    /// Host adapter and sync engine as selected by the configuration.
    pub fn from_config(config: AppConfig) -> Self {
        let adapter = adapters::get_adapter(config.simulation, &config.mount_root);
        let engine_type = if config.simulation {
            TransferEngineType::Simulated
        } else {
            TransferEngineType::Rsync
        };
        let engine = Arc::from(create_engine(engine_type, config.rsync_log_file.clone()));
        Self::new(config, adapter, engine)
    }
}
