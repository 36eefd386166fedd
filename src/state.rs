use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::models::progress::OperationKind;
use crate::services::hash::{HashAlgorithm, HashService};
use crate::storage::StorageProvider;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Everything the engines depend on, built once at startup and handed
/// down explicitly.
pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub provider: Arc<dyn StorageProvider>,
    pub hash_algorithm: HashAlgorithm,
    /// One active job per operation kind; maps to the owning progress row.
    pub running_jobs: Arc<Mutex<HashMap<OperationKind, i64>>>,
}

impl AppState {
    pub fn new(
        db: DbPool,
        config: AppConfig,
        provider: Arc<dyn StorageProvider>,
        hash_algorithm: HashAlgorithm,
    ) -> Self {
        Self {
            db,
            config,
            provider,
            hash_algorithm,
            running_jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A hash service wired to the configured algorithm and limits.
    pub fn hash_service(&self) -> Arc<HashService> {
        Arc::new(HashService::new(
            self.provider.clone(),
            self.hash_algorithm,
            self.config.hash_max_file_size,
            self.config.hash_buffer_size,
        ))
    }
}
