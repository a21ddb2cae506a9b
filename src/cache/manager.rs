//! Namespaced TTL map with per-entry expiry timers and deadline-bounded
//! locked sections.
//!
//! ## Locking model
//!
//! Each namespace is gated by a fair semaphore: shared access takes one
//! permit, exclusive access takes all of them. The entry map behind the gate
//! sits in a `parking_lot::Mutex` that is only locked for microscopic map
//! operations while the gate is held, never across an await. Expiry timer
//! callbacks acquire the gate like any other caller.
//!
//! ## Forced release
//!
//! `with_exclusive_lock`/`with_shared_lock` arm a deadline when they acquire
//! the gate. If the caller's section is still running when the deadline
//! fires, the permits are force-returned by the deadline task. This is
//! **bounded-duration, not true, mutual exclusion**: a section that outlives
//! the deadline can interleave with a second holder. The trade is
//! deliberate — the process can never deadlock forever on a stuck section —
//! and callers must keep sections far below the deadline. Do not "fix" this
//! by upgrading to a plain mutex; callers rely on the auto-release liveness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Action invoked with the removed value when an entry expires. Ownership of
/// the value transfers to the single invocation.
pub type Finalizer<V> = Arc<dyn Fn(String, V) -> BoxFuture<'static, ()> + Send + Sync>;

/// Permits representing exclusive ownership of a namespace gate. Shared
/// holders take one each.
const EXCLUSIVE_PERMITS: u32 = 64;

const DEFAULT_LOCK_DEADLINE: Duration = Duration::from_secs(5);

struct Entry<V> {
    value: V,
    /// Bumped on every overwrite so a timer that already slept out can tell
    /// it lost the race to a newer write.
    generation: u64,
    timer: Option<JoinHandle<()>>,
    finalizer: Option<Finalizer<V>>,
}

enum FinalizerUpdate<V> {
    /// Keep the previous finalizer if the previous entry had a live timer
    /// (a refresh merely reschedules the window).
    Keep,
    /// Install this finalizer, replacing any previous one (resets the window
    /// *and* replaces the action).
    Replace(Finalizer<V>),
}

struct Namespace<V> {
    name: String,
    gate: Arc<Semaphore>,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V> Namespace<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            gate: Arc::new(Semaphore::new(EXCLUSIVE_PERMITS as usize)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Install or overwrite an entry. Must be called with the gate held
    /// exclusively. Any previous timer is cancelled unconditionally — a
    /// reset to permanent must never leave an old timer armed that could
    /// delete the value later.
    fn install(
        ns: &Arc<Self>,
        key: &str,
        value: V,
        ttl: Option<Duration>,
        update: FinalizerUpdate<V>,
    ) {
        let mut entries = ns.entries.lock();

        let previous = entries.remove(key);
        let (prev_generation, prev_finalizer, prev_had_timer) = match previous {
            Some(entry) => {
                if let Some(timer) = entry.timer.as_ref() {
                    timer.abort();
                }
                (entry.generation, entry.finalizer, entry.timer.is_some())
            }
            None => (0, None, false),
        };
        let generation = prev_generation + 1;

        let Some(ttl) = ttl else {
            entries.insert(
                key.to_string(),
                Entry {
                    value,
                    generation,
                    timer: None,
                    finalizer: None,
                },
            );
            return;
        };

        let finalizer = match update {
            FinalizerUpdate::Replace(f) => Some(f),
            FinalizerUpdate::Keep if prev_had_timer => prev_finalizer,
            FinalizerUpdate::Keep => None,
        };

        // the window is measured from the install, not from whenever the
        // timer task first gets polled
        let deadline = tokio::time::Instant::now() + ttl;
        let timer = {
            let ns = Arc::clone(ns);
            let key = key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                ns.expire(key, generation).await;
            })
        };

        entries.insert(
            key.to_string(),
            Entry {
                value,
                generation,
                timer: Some(timer),
                finalizer,
            },
        );
    }

    /// Expiry path: runs under the gate like an ordinary caller, removes the
    /// entry atomically, and only then dispatches the finalizer with the
    /// removed value.
    async fn expire(self: Arc<Self>, key: String, generation: u64) {
        let Ok(permit) = self.gate.acquire_many(EXCLUSIVE_PERMITS).await else {
            return;
        };

        let fired = {
            let mut entries = self.entries.lock();
            let current = entries.get(&key).map(|e| e.generation == generation);
            if current == Some(true) {
                entries.remove(&key)
            } else {
                None
            }
        };

        drop(permit);

        if let Some(entry) = fired {
            debug!(namespace = %self.name, key = %key, "cache entry expired");
            if let Some(finalizer) = entry.finalizer {
                finalizer(key, entry.value).await;
            }
        }
    }
}

/// Guard handed to `with_exclusive_lock` sections. Mutations go straight to
/// the entry map; timers and finalizers are untouched — re-arming a window
/// is a separate `set`/`set_with_finalizer` call after the section returns.
pub struct LockedNamespace<'a, V> {
    ns: &'a Arc<Namespace<V>>,
}

impl<V> LockedNamespace<'_, V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn get(&self, key: &str) -> Option<V> {
        self.ns.entries.lock().get(key).map(|e| e.value.clone())
    }

    /// Mutate a value in place, returning the closure's result.
    pub fn update<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.ns.entries.lock().get_mut(key).map(|e| f(&mut e.value))
    }

    /// Overwrite a value without touching its timer. Returns `false` if the
    /// key is absent.
    pub fn set_value(&self, key: &str, value: V) -> bool {
        match self.ns.entries.lock().get_mut(key) {
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &str) {
        if let Some(entry) = self.ns.entries.lock().remove(key) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }
}

/// Guard handed to `with_shared_lock` sections; read-only.
pub struct SharedNamespace<'a, V> {
    ns: &'a Arc<Namespace<V>>,
}

impl<V> SharedNamespace<'_, V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn get(&self, key: &str) -> Option<V> {
        self.ns.entries.lock().get(key).map(|e| e.value.clone())
    }

    pub fn len(&self) -> usize {
        self.ns.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ns.entries.lock().is_empty()
    }
}

/// Namespaced TTL cache. Owns all namespace and entry memory; callers get
/// clones and must not assume lifetime beyond the documented TTL.
pub struct CacheManager<V> {
    /// Table-level lock, distinct from every namespace gate.
    namespaces: RwLock<HashMap<String, Arc<Namespace<V>>>>,
    lock_deadline: Duration,
}

impl<V> Default for CacheManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CacheManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_lock_deadline(DEFAULT_LOCK_DEADLINE)
    }

    pub fn with_lock_deadline(lock_deadline: Duration) -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            lock_deadline,
        }
    }

    /// Create (or reset) a namespace. Writes to a namespace that was never
    /// created fail silently; creation is always explicit.
    pub fn create_namespace(&self, name: &str) {
        self.namespaces
            .write()
            .insert(name.to_string(), Arc::new(Namespace::new(name)));
    }

    pub fn namespace_exists(&self, name: &str) -> bool {
        self.namespaces.read().contains_key(name)
    }

    fn lookup(&self, name: &str) -> Option<Arc<Namespace<V>>> {
        self.namespaces.read().get(name).cloned()
    }

    /// Set a key. `ttl = None` installs a permanent entry; `Some(d)` arms
    /// (or reschedules) a single expiry timer. A rescheduled timer keeps any
    /// finalizer it already had. Returns `false` if the namespace does not
    /// exist.
    pub async fn set(&self, namespace: &str, key: &str, value: V, ttl: Option<Duration>) -> bool {
        let Some(ns) = self.lookup(namespace) else {
            return false;
        };
        let Ok(_permit) = ns.gate.acquire_many(EXCLUSIVE_PERMITS).await else {
            return false;
        };
        Namespace::install(&ns, key, value, ttl, FinalizerUpdate::Keep);
        true
    }

    /// Set a key with an expiry action. The finalizer replaces any previous
    /// one and a fresh timer is armed, which both resets the debounce window
    /// and replaces the action. Returns `false` if the namespace does not
    /// exist.
    pub async fn set_with_finalizer(
        &self,
        namespace: &str,
        key: &str,
        value: V,
        ttl: Option<Duration>,
        finalizer: Finalizer<V>,
    ) -> bool {
        let Some(ns) = self.lookup(namespace) else {
            return false;
        };
        let Ok(_permit) = ns.gate.acquire_many(EXCLUSIVE_PERMITS).await else {
            return false;
        };
        Namespace::install(&ns, key, value, ttl, FinalizerUpdate::Replace(finalizer));
        true
    }

    /// Re-arm the expiry window of an existing key without touching its
    /// value. The value is re-read under the gate, so a mutation made by a
    /// concurrent locked section is never clobbered by a stale re-arm.
    /// Returns `false` if the namespace or key is absent (the entry may have
    /// expired in the meantime).
    pub async fn refresh_with_finalizer(
        &self,
        namespace: &str,
        key: &str,
        ttl: Option<Duration>,
        finalizer: Finalizer<V>,
    ) -> bool {
        let Some(ns) = self.lookup(namespace) else {
            return false;
        };
        let Ok(_permit) = ns.gate.acquire_many(EXCLUSIVE_PERMITS).await else {
            return false;
        };
        let current = ns.entries.lock().get(key).map(|e| e.value.clone());
        match current {
            Some(value) => {
                Namespace::install(&ns, key, value, ttl, FinalizerUpdate::Replace(finalizer));
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, namespace: &str, key: &str) -> Option<V> {
        let ns = self.lookup(namespace)?;
        let _permit = ns.gate.acquire().await.ok()?;
        let entries = ns.entries.lock();
        entries.get(key).map(|e| e.value.clone())
    }

    pub async fn delete(&self, namespace: &str, key: &str) {
        let Some(ns) = self.lookup(namespace) else {
            return;
        };
        let Ok(_permit) = ns.gate.acquire_many(EXCLUSIVE_PERMITS).await else {
            return;
        };
        let mut entries = ns.entries.lock();
        if let Some(entry) = entries.remove(key) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }

    /// Snapshot of every live value in a namespace.
    pub async fn values(&self, namespace: &str) -> Vec<V> {
        let Some(ns) = self.lookup(namespace) else {
            return Vec::new();
        };
        let Ok(_permit) = ns.gate.acquire().await else {
            return Vec::new();
        };
        let entries = ns.entries.lock();
        entries.values().map(|e| e.value.clone()).collect()
    }

    /// Run `f` while holding the namespace gate exclusively, with the
    /// forced-release deadline armed. See the module docs for the hazard.
    pub async fn with_exclusive_lock<T>(
        &self,
        namespace: &str,
        f: impl FnOnce(&LockedNamespace<'_, V>) -> T,
    ) -> Result<T> {
        let ns = self
            .lookup(namespace)
            .ok_or_else(|| EngineError::NotFound(format!("namespace {namespace}")))?;
        self.locked_section(&ns, EXCLUSIVE_PERMITS, || f(&LockedNamespace { ns: &ns }))
            .await
    }

    /// Run `f` while holding the namespace gate for shared reading, with the
    /// forced-release deadline armed.
    pub async fn with_shared_lock<T>(
        &self,
        namespace: &str,
        f: impl FnOnce(&SharedNamespace<'_, V>) -> T,
    ) -> Result<T> {
        let ns = self
            .lookup(namespace)
            .ok_or_else(|| EngineError::NotFound(format!("namespace {namespace}")))?;
        self.locked_section(&ns, 1, || f(&SharedNamespace { ns: &ns }))
            .await
    }

    async fn locked_section<T>(
        &self,
        ns: &Arc<Namespace<V>>,
        permits: u32,
        f: impl FnOnce() -> T,
    ) -> Result<T> {
        let acquired = ns
            .gate
            .clone()
            .acquire_many_owned(permits)
            .await
            .map_err(|_| EngineError::Canceled(format!("namespace {} gate closed", ns.name)))?;
        acquired.forget();

        let released = Arc::new(AtomicBool::new(false));
        let deadline = {
            let gate = Arc::clone(&ns.gate);
            let released = Arc::clone(&released);
            let name = ns.name.clone();
            let after = self.lock_deadline;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                if !released.swap(true, Ordering::SeqCst) {
                    warn!(
                        namespace = %name,
                        deadline_ms = after.as_millis() as u64,
                        "locked section exceeded deadline, force-releasing gate"
                    );
                    gate.add_permits(permits as usize);
                }
            })
        };

        let out = f();

        if !released.swap(true, Ordering::SeqCst) {
            ns.gate.add_permits(permits as usize);
            deadline.abort();
        }

        Ok(out)
    }
}
