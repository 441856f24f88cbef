use std::sync::Arc;

use crate::config::AppConfig;
use crate::llm::SpecBackend;
use crate::pipeline::{JobCoordinator, JobQueue};
use crate::storage::StorageAdapter;
use crate::store::MetadataStore;

pub struct AppState {
    pub config: AppConfig,
    pub coordinator: Arc<JobCoordinator>,
    pub queue: JobQueue,
    pub store: Arc<dyn MetadataStore>,
    pub storage: Arc<dyn StorageAdapter>,
    pub llm_primary: Arc<dyn SpecBackend>,
    pub llm_fallback: Arc<dyn SpecBackend>,
}
