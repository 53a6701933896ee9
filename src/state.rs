//! Shared application state for the HTTP surface.

use crate::controller::SessionController;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Default wait for `GET /session/ready` (30 seconds)
pub const READY_WAIT_MS: u64 = 30_000;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub session: SessionController,
    /// Last URL reported by the dev server, cleared on restart and dispose.
    pub ready_url: Arc<watch::Sender<Option<String>>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(session: SessionController) -> Self {
        let (ready_url, _) = watch::channel(None);
        Self {
            session,
            ready_url: Arc::new(ready_url),
            started_at: Instant::now(),
        }
    }

    /// Callback that records the reported URL.
    pub fn ready_recorder(&self) -> impl Fn(&str) + Send + Sync + 'static {
        let ready_url = Arc::clone(&self.ready_url);
        move |url: &str| {
            ready_url.send_replace(Some(url.to_string()));
        }
    }

    pub fn current_url(&self) -> Option<String> {
        self.ready_url.borrow().clone()
    }
}
