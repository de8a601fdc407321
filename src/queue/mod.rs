mod cache;
mod error;
mod layout;
mod manager;
mod metadata;
mod ordered;
mod resources;
mod retry;

pub use cache::CorrelationCache;
pub use error::{QueueError, QueueResult};
pub use layout::{QueuePath, ERRORS_DIR, META_DIR, META_SUFFIX, RESPONSE_CACHE_DIR};
pub use manager::QueueManager;
pub use ordered::OrderedQueue;
pub use resources::{Resource, ResourceTable};
pub use retry::RetryPolicy;
