use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::ArchiveApi;

/// An upload session that must be cancelled remotely if the process dies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSession {
    pub session_id: String,
    pub cancel_url: String,
    pub auth_token: Option<String>,
}

/// Process-wide record of in-flight upload sessions.
///
/// Uploads register a session when they open it and unregister it once it
/// completes or has been aborted. Whatever is left at shutdown is cancelled
/// with [`CancellationRegistry::drain_and_cancel_all`]. This is best-effort
/// cleanup: failures are logged, never raised.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    sessions: Mutex<BTreeMap<String, PendingSession>>,
}

static GLOBAL_REGISTRY: Lazy<Arc<CancellationRegistry>> =
    Lazy::new(|| Arc::new(CancellationRegistry::new()));

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by every uploader in the process
    pub fn global() -> Arc<CancellationRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    pub fn register(&self, session: PendingSession) {
        self.lock().insert(session.session_id.clone(), session);
    }

    /// Returns true if the session was registered
    pub fn unregister(&self, session_id: &str) -> bool {
        self.lock().remove(session_id).is_some()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Cancel every outstanding session; returns how many cancels succeeded
    pub async fn drain_and_cancel_all(&self, api: &dyn ArchiveApi) -> usize {
        let drained: Vec<PendingSession> = std::mem::take(&mut *self.lock()).into_values().collect();
        let mut cancelled = 0;
        for session in drained {
            match api.cancel_session(&session).await {
                Ok(()) => {
                    info!(session_id = %session.session_id, "Cancelled outstanding upload session");
                    cancelled += 1;
                }
                Err(e) => {
                    warn!(
                        session_id = %session.session_id,
                        cancel_url = %session.cancel_url,
                        "Failed to cancel upload session: {}",
                        e
                    );
                }
            }
        }
        cancelled
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, PendingSession>> {
        // A panic while holding the lock leaves the map itself intact
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
