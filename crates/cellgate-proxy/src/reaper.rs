//! Deferred kernel deletion.
//!
//! When a client connection closes, the backing kernel is kept alive for
//! a retention window so brief disconnect/reconnect cycles (page reload)
//! do not destroy kernel state. Each pending deletion is a spawned timer
//! task cancellable through an `mpsc` channel, keyed by kernel id.

use crate::proxy::http::backend_target;
use cellgate_core::{GateError, GateResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Backend deletion collaborator.
#[async_trait::async_trait]
pub trait KernelDeleter: Send + Sync {
    async fn delete(&self, kernel_id: &str) -> GateResult<()>;
}

/// Deletes kernels through the gateway's REST interface.
pub struct HttpKernelDeleter {
    client: reqwest::Client,
    gateway_url: reqwest::Url,
    auth_token: Option<String>,
}

impl HttpKernelDeleter {
    pub fn new(gateway_url: reqwest::Url, auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            gateway_url,
            auth_token,
        }
    }

    /// Deletion endpoint, composed the same way as every other backend
    /// target so a gateway URL with a base path stays consistent.
    fn delete_url(&self, kernel_id: &str) -> GateResult<reqwest::Url> {
        backend_target(&self.gateway_url, &format!("/kernels/{kernel_id}"))
    }
}

#[async_trait::async_trait]
impl KernelDeleter for HttpKernelDeleter {
    async fn delete(&self, kernel_id: &str) -> GateResult<()> {
        let url = self.delete_url(kernel_id)?;

        let mut request = self.client.delete(url);
        if let Some(token) = &self.auth_token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("token {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| GateError::Deletion(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| GateError::Deletion(e.to_string()))?;
        Ok(())
    }
}

/// Pending-deletion table: kernel id to cancel-signal sender.
pub struct KernelReaper {
    pending: Arc<Mutex<HashMap<String, mpsc::Sender<()>>>>,
    deleter: Arc<dyn KernelDeleter>,
    retention: Duration,
}

impl KernelReaper {
    pub fn new(deleter: Arc<dyn KernelDeleter>, retention: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            deleter,
            retention,
        }
    }

    /// Schedule deletion of `kernel_id` after the retention window.
    ///
    /// A second schedule for the same kernel replaces the first, resetting
    /// the window. The timer fires at most once; on expiry the entry is
    /// removed before the deletion call so a late cancel is a no-op.
    pub async fn schedule(&self, kernel_id: &str) {
        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        let own_tx = cancel_tx.clone();
        {
            let mut pending = self.pending.lock().await;
            if let Some(previous) = pending.insert(kernel_id.to_string(), cancel_tx) {
                let _ = previous.try_send(());
            }
        }

        debug!(kernel_id, retention_secs = self.retention.as_secs(), "deletion scheduled");

        let pending = Arc::clone(&self.pending);
        let deleter = Arc::clone(&self.deleter);
        let retention = self.retention;
        let kernel_id = kernel_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    debug!(kernel_id = %kernel_id, "pending deletion cancelled");
                }
                _ = tokio::time::sleep(retention) => {
                    // Guard against a concurrent replace: only the task
                    // whose own sender is still registered may fire. A
                    // stale timer whose entry was replaced must not
                    // remove the replacement.
                    if take_if_current(&pending, &kernel_id, &own_tx).await {
                        info!(kernel_id = %kernel_id, "retention window elapsed, deleting kernel");
                        // Best effort: log and move on, never retry.
                        if let Err(e) = deleter.delete(&kernel_id).await {
                            warn!(kernel_id = %kernel_id, error = %e, "kernel deletion failed");
                        }
                    }
                }
            }
        });
    }

    /// Cancel a pending deletion. Returns whether one was outstanding.
    pub async fn cancel(&self, kernel_id: &str) -> bool {
        if let Some(tx) = self.pending.lock().await.remove(kernel_id) {
            let _ = tx.try_send(());
            debug!(kernel_id, "reconnect cancelled pending deletion");
            true
        } else {
            false
        }
    }

    /// Number of deletions currently pending.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Remove the entry for `kernel_id` only if it still holds `sender`.
///
/// An expired timer races a reschedule for the same id: by the time the
/// timer runs, its entry may have been replaced by a fresh one whose
/// window has not elapsed. Matching on channel identity, not just the
/// key, keeps a stale timer from firing inside the reset window.
async fn take_if_current(
    pending: &Mutex<HashMap<String, mpsc::Sender<()>>>,
    kernel_id: &str,
    sender: &mpsc::Sender<()>,
) -> bool {
    let mut pending = pending.lock().await;
    match pending.get(kernel_id) {
        Some(current) if current.same_channel(sender) => {
            pending.remove(kernel_id);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    #[derive(Default)]
    struct CountingDeleter {
        deletions: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl KernelDeleter for CountingDeleter {
        async fn delete(&self, _kernel_id: &str) -> GateResult<()> {
            self.deletions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const RETENTION: Duration = Duration::from_secs(60);

    fn reaper() -> (Arc<KernelReaper>, Arc<CountingDeleter>) {
        let deleter = Arc::new(CountingDeleter::default());
        let reaper = Arc::new(KernelReaper::new(deleter.clone(), RETENTION));
        (reaper, deleter)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_retention_window() {
        let (reaper, deleter) = reaper();
        reaper.schedule("k1").await;

        sleep(RETENTION / 2).await;
        assert_eq!(deleter.deletions.load(Ordering::SeqCst), 0);

        sleep(RETENTION).await;
        assert_eq!(deleter.deletions.load(Ordering::SeqCst), 1);
        assert_eq!(reaper.pending_count().await, 0);

        // No second firing, ever.
        sleep(RETENTION * 3).await;
        assert_eq!(deleter.deletions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_cancels_pending_deletion() {
        let (reaper, deleter) = reaper();
        reaper.schedule("k1").await;

        sleep(RETENTION / 2).await;
        assert!(reaper.cancel("k1").await);

        sleep(RETENTION * 2).await;
        assert_eq!(deleter.deletions.load(Ordering::SeqCst), 0);
        assert_eq!(reaper.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_without_pending_is_a_noop() {
        let (reaper, _) = reaper();
        assert!(!reaper.cancel("k1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_resets_the_window() {
        let (reaper, deleter) = reaper();
        reaper.schedule("k1").await;

        // Just before expiry, a new disconnect reschedules.
        sleep(RETENTION - Duration::from_secs(1)).await;
        reaper.schedule("k1").await;

        sleep(Duration::from_secs(2)).await;
        assert_eq!(deleter.deletions.load(Ordering::SeqCst), 0);

        sleep(RETENTION).await;
        assert_eq!(deleter.deletions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delete_url_honors_gateway_base_path() {
        let deleter = HttpKernelDeleter::new(
            reqwest::Url::parse("http://kg:8888/base").unwrap(),
            None,
        );
        assert_eq!(
            deleter.delete_url("k-1").unwrap().as_str(),
            "http://kg:8888/base/api/kernels/k-1"
        );

        let deleter =
            HttpKernelDeleter::new(reqwest::Url::parse("http://kg:8888").unwrap(), None);
        assert_eq!(
            deleter.delete_url("k-1").unwrap().as_str(),
            "http://kg:8888/api/kernels/k-1"
        );
    }

    #[tokio::test]
    async fn stale_timer_cannot_remove_a_rescheduled_entry() {
        let pending = Mutex::new(HashMap::new());
        let (stale_tx, _stale_rx) = mpsc::channel::<()>(1);
        let (current_tx, _current_rx) = mpsc::channel::<()>(1);
        pending
            .lock()
            .await
            .insert("k1".to_string(), current_tx.clone());

        // A timer whose entry was replaced must leave the new one alone.
        assert!(!take_if_current(&pending, "k1", &stale_tx).await);
        assert!(pending.lock().await.contains_key("k1"));

        // The registered timer still fires normally.
        assert!(take_if_current(&pending, "k1", &current_tx).await);
        assert!(!pending.lock().await.contains_key("k1"));
    }

    #[tokio::test(start_paused = true)]
    async fn independent_kernels_do_not_interfere() {
        let (reaper, deleter) = reaper();
        reaper.schedule("k1").await;
        reaper.schedule("k2").await;

        assert!(reaper.cancel("k1").await);
        sleep(RETENTION * 2).await;

        assert_eq!(deleter.deletions.load(Ordering::SeqCst), 1);
    }
}
