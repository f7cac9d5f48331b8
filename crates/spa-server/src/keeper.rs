//! Term lifecycle: install, expiry sweep, and shutdown cleanup.
//!
//! [`TermKeeper`] owns the [`TermRegistry`] and the firewall binding. Two
//! locks are involved:
//!
//! - the registry mutex, held only for in-memory bookkeeping and never
//!   across a firewall call;
//! - a per-tuple mutex, held across the firewall call for that tuple, so an
//!   install cannot interleave with the revoke of a just-expired term for
//!   the same tuple.
//!
//! Tuple locks are created on demand and dropped once nobody holds them. A
//! revoke that times out keeps its tuple locked until the call returns.

use crate::firewall::FirewallBinding;
use crate::registry::{ActiveTerm, Admission, TermRegistry};
use crate::term::{Term, TermKey};
use futures_util::future::join_all;
use spa_core::{unix_now, SpaError, SpaResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Sweep and revoke tuning.
#[derive(Debug, Clone)]
pub struct KeeperOptions {
    /// How often the sweeper looks for expired terms.
    pub sweep_interval: Duration,
    /// Attempts per revoke before giving up on a native rule.
    pub revoke_attempts: u32,
    /// Bound on a single revoke attempt.
    pub revoke_timeout: Duration,
}

impl Default for KeeperOptions {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            revoke_attempts: 3,
            revoke_timeout: Duration::from_secs(5),
        }
    }
}

pub struct TermKeeper {
    binding: Arc<dyn FirewallBinding>,
    registry: Mutex<TermRegistry>,
    /// Set under the registry lock by [`shutdown`](Self::shutdown); no term
    /// is recorded afterwards.
    closed: AtomicBool,
    tuple_locks: std::sync::Mutex<HashMap<TermKey, Arc<Mutex<()>>>>,
    options: KeeperOptions,
}

impl TermKeeper {
    pub fn new(binding: Arc<dyn FirewallBinding>) -> Self {
        Self::with_options(binding, KeeperOptions::default())
    }

    pub fn with_options(binding: Arc<dyn FirewallBinding>, options: KeeperOptions) -> Self {
        Self {
            binding,
            registry: Mutex::new(TermRegistry::new()),
            closed: AtomicBool::new(false),
            tuple_locks: std::sync::Mutex::new(HashMap::new()),
            options,
        }
    }

    /// Grant `term` natively and record it.
    ///
    /// A live entry for the same tuple absorbs the term without a native
    /// call. On firewall failure nothing is recorded. Once the keeper has
    /// shut down, installs fail with [`SpaError::ShuttingDown`] and a grant
    /// that was already in flight is revoked again.
    pub async fn install(&self, term: Term) -> SpaResult<Admission> {
        let key = term.key();
        let tuple = self.tuple_lock(key);
        let held = tuple.clone().lock_owned().await;
        let result = self.install_locked(term, held).await;
        drop(tuple);
        self.prune_tuple_lock(&key);
        result
    }

    async fn install_locked(&self, term: Term, held: OwnedMutexGuard<()>) -> SpaResult<Admission> {
        {
            let mut registry = self.registry.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(SpaError::ShuttingDown);
            }
            if let Some(admission) = registry.coalesce(&term) {
                debug!(term = %term, ?admission, "term coalesced into existing grant");
                return Ok(admission);
            }
        }

        let native = term.clone();
        let handle = self.blocking(move |b| b.grant(&native)).await?;

        let mut registry = self.registry.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            drop(registry);
            warn!(term = %term, "granted during shutdown; revoking");
            self.revoke_with_retry(&ActiveTerm { term, handle }, held).await;
            return Err(SpaError::ShuttingDown);
        }
        let admission = registry.insert(term.clone(), handle);
        drop(registry);
        info!(
            term = %term,
            backend = self.binding.name(),
            "term installed"
        );
        Ok(admission)
    }

    /// Revoke and remove every term with `expires_at <= now`.
    ///
    /// Returns how many terms were removed. Revoke failures are logged; the
    /// terms are removed regardless.
    pub async fn sweep(&self, now: i64) -> usize {
        let expired = self.registry.lock().await.pop_expired(now);
        if expired.is_empty() {
            return 0;
        }

        let count = expired.len();
        debug!(count, now, "sweeping expired terms");
        join_all(expired.into_iter().map(|entry| self.retire(entry))).await;
        count
    }

    /// Run [`sweep`](Self::sweep) every interval until `shutdown` fires.
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.options.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.sweep(unix_now()).await;
                    }
                    _ = shutdown.recv() => {
                        debug!("sweeper stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Stop accepting terms and revoke every active one, best effort.
    /// Returns how many were removed.
    pub async fn shutdown(&self) -> usize {
        let active = {
            let mut registry = self.registry.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            registry.drain()
        };
        let count = active.len();
        if count > 0 {
            info!(count, "revoking active terms");
        }
        join_all(active.into_iter().map(|entry| self.retire(entry))).await;
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.registry.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.lock().await.is_empty()
    }

    /// Active terms, ordered by expiry.
    pub async fn snapshot(&self) -> Vec<Term> {
        self.registry.lock().await.snapshot()
    }

    /// Revoke the native rule of an entry already removed from the registry.
    async fn retire(&self, entry: ActiveTerm) {
        let key = entry.term.key();
        let tuple = self.tuple_lock(key);
        let held = tuple.clone().lock_owned().await;
        // A shared rule now belongs to the term that replaced this one.
        let reinstalled = self.registry.lock().await.lookup(&key).is_some();
        if entry.handle.is_shared() && reinstalled {
            debug!(term = %entry.term, "rule still in use; skipping revoke");
            drop(held);
        } else {
            self.revoke_with_retry(&entry, held).await;
        }
        drop(tuple);
        self.prune_tuple_lock(&key);
    }

    /// Revoke with bounded attempts while holding the tuple lock.
    ///
    /// Failed attempts are retried. A timed-out attempt cannot be cancelled
    /// on the blocking pool, so it ends the retries and the tuple lock
    /// stays held until that call returns: a late revoke must not remove a
    /// rule that a newer install for the tuple has found and reused.
    async fn revoke_with_retry(&self, entry: &ActiveTerm, held: OwnedMutexGuard<()>) -> bool {
        let attempts = self.options.revoke_attempts.max(1);
        for attempt in 1..=attempts {
            let binding = self.binding.clone();
            let term = entry.term.clone();
            let handle = entry.handle;
            let mut call = tokio::task::spawn_blocking(move || binding.revoke(&term, &handle));
            match tokio::time::timeout(self.options.revoke_timeout, &mut call).await {
                Ok(Ok(Ok(()))) => {
                    info!(term = %entry.term, "term revoked");
                    return true;
                }
                Ok(Ok(Err(e))) => {
                    warn!(term = %entry.term, attempt, error = %e, "revoke failed");
                }
                Ok(Err(e)) => {
                    warn!(term = %entry.term, attempt, error = %e, "revoke task failed");
                }
                Err(_) => {
                    error!(term = %entry.term, attempt, "revoke timed out; rule may remain");
                    tokio::spawn(async move {
                        let _ = call.await;
                        drop(held);
                    });
                    return false;
                }
            }
        }
        error!(term = %entry.term, attempts, "giving up on revoke; rule may remain");
        false
    }

    /// Run a firewall call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> SpaResult<T>
    where
        F: FnOnce(&dyn FirewallBinding) -> SpaResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let binding = self.binding.clone();
        tokio::task::spawn_blocking(move || f(&*binding))
            .await
            .map_err(|e| SpaError::Firewall(format!("firewall task failed: {e}")))?
    }

    fn tuple_lock(&self, key: TermKey) -> Arc<Mutex<()>> {
        let mut locks = self
            .tuple_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key).or_default().clone()
    }

    fn prune_tuple_lock(&self, key: &TermKey) {
        let mut locks = self
            .tuple_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn tuple_lock_count(&self) -> usize {
        self.tuple_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
