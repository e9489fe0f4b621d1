//! Worker runtime: the session scheduler, the agent loop, and the response
//! pipeline that turns LLM replies into durable rows.

pub mod agent_runner;
pub mod events;
pub mod health;
pub mod parser;
pub mod processor;
pub mod prompts;
pub mod session_manager;
pub mod truncate;

use std::sync::Arc;

use cm_domain::settings::Settings;
use cm_process::ProcessRegistry;
use cm_providers::MemoryAgent;
use cm_storage::{PendingQueue, Store};
use cm_vector::VectorSync;

use events::EventBroadcaster;

/// Shared handles every runtime component works against.
pub struct Runtime {
    pub settings: Arc<Settings>,
    pub store: Arc<Store>,
    pub queue: Arc<PendingQueue>,
    pub vector: Arc<VectorSync>,
    pub registry: Arc<ProcessRegistry>,
    pub events: EventBroadcaster,
    pub primary: Arc<dyn MemoryAgent>,
    pub fallback: Option<Arc<dyn MemoryAgent>>,
}
