use std::sync::Arc;

use streamload_core::DOWNLOAD_QUEUE;
use streamload_queue::JobStore;

/// Shared state for all handlers.
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    /// Queue that new download jobs are enqueued on.
    pub queue: String,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, queue: impl Into<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
        }
    }

    /// State on the default `download_file` queue.
    pub fn with_default_queue(store: Arc<dyn JobStore>) -> Self {
        Self::new(store, DOWNLOAD_QUEUE)
    }
}
