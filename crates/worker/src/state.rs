//! Shared application state for the HTTP layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::runtime::session_manager::SessionManager;
use crate::runtime::Runtime;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub sessions: Arc<SessionManager>,
    /// Flips true once Store and VectorSync are ready to serve.
    pub initialized: Arc<AtomicBool>,
    /// Cancelled by `/api/admin/shutdown`, signals, or fatal errors.
    pub shutdown: CancellationToken,
    /// Set by `/api/admin/restart` so the supervisor re-execs after the
    /// graceful shutdown completes.
    pub restart_requested: Arc<AtomicBool>,
}

impl AppState {
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn request_restart(&self) {
        self.restart_requested.store(true, Ordering::Release);
    }

    pub fn restart_was_requested(&self) -> bool {
        self.restart_requested.load(Ordering::Acquire)
    }
}
