use crate::orchestrator::SaveOrchestrator;
use crate::storage::{Delivery, KeyValueStore};
use std::{sync::Arc, time::Duration};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SaveOrchestrator,
    pub storage: Arc<dyn KeyValueStore>,
}

impl AppState {
    pub fn new(storage: Arc<dyn KeyValueStore>, delivery: Arc<dyn Delivery>, idle_timeout: Duration) -> Self {
        Self {
            orchestrator: SaveOrchestrator::new(Arc::clone(&storage), delivery, idle_timeout),
            storage,
        }
    }
}
