//! In-process actor substrate.
//!
//! Every actor lives in this process and shares one vantage point, so the
//! location hint passed to [`ActorNamespace::create`] is only logged. Calls
//! into one actor are serialized behind an async mutex; the guard is held by
//! a detached task until the call's background work has drained, so callers
//! return immediately while the next call into the same actor waits.
//!
//! Actor state does not survive a restart; [`LocalNamespace::rehydrate`]
//! rebuilds one locked actor per registry row at startup.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hickory_proto::rr::RecordType;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::actor::{FanOutResults, ProbeActor, ProbeDeps};
use crate::codec::DnsAnswer;
use crate::error::ProbeError;
use crate::location::{FineLocationCode, Location};
use crate::registry::Registry;
use crate::resolver::{CancelSignal, ResolverEndpoint};
use crate::substrate::{ActorHost, ActorNamespace, LifecycleState, ProbeHandle, ProbeId};

/// Per-actor storage and alarm slot held in memory.
pub struct MemoryActorHost {
    storage: Mutex<HashMap<String, Bytes>>,
    alarm: watch::Sender<Option<DateTime<Utc>>>,
    destroyed: AtomicBool,
}

impl MemoryActorHost {
    /// Empty host.
    pub fn new() -> Self {
        let (alarm, _) = watch::channel(None);
        Self {
            storage: Mutex::new(HashMap::new()),
            alarm,
            destroyed: AtomicBool::new(false),
        }
    }

    /// True once the actor has self-destructed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn alarm_changes(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.alarm.subscribe()
    }

    /// Clear the slot if it still holds `at`. Returns whether it did.
    fn consume_alarm(&self, at: DateTime<Utc>) -> bool {
        self.alarm.send_if_modified(|slot| {
            if *slot == Some(at) {
                *slot = None;
                true
            } else {
                false
            }
        })
    }
}

impl Default for MemoryActorHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActorHost for MemoryActorHost {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, ProbeError> {
        Ok(self.storage.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), ProbeError> {
        self.storage.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), ProbeError> {
        self.storage.lock().clear();
        Ok(())
    }

    async fn alarm(&self) -> Result<Option<DateTime<Utc>>, ProbeError> {
        Ok(*self.alarm.borrow())
    }

    async fn set_alarm(&self, at: DateTime<Utc>) -> Result<(), ProbeError> {
        self.alarm.send_replace(Some(at));
        Ok(())
    }

    async fn delete_alarm(&self) -> Result<(), ProbeError> {
        self.alarm.send_replace(None);
        Ok(())
    }

    async fn self_destruct(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.storage.lock().clear();
        self.alarm.send_replace(None);
    }
}

type ActorCell = Arc<AsyncMutex<ProbeActor>>;

struct LocalActor {
    host: Arc<MemoryActorHost>,
    cell: ActorCell,
    driver: AbortHandle,
}

/// Namespace of in-process actors.
pub struct LocalNamespace {
    deps: ProbeDeps,
    actors: Mutex<HashMap<ProbeId, Arc<LocalActor>>>,
}

impl LocalNamespace {
    /// Namespace whose actors share `deps`.
    pub fn new(deps: ProbeDeps) -> Self {
        Self {
            deps,
            actors: Mutex::new(HashMap::new()),
        }
    }

    fn live(&self, id: ProbeId) -> Option<Arc<LocalActor>> {
        self.actors
            .lock()
            .get(&id)
            .filter(|actor| !actor.host.is_destroyed())
            .cloned()
    }

    /// Forget actors that have self-destructed.
    fn prune(&self) {
        self.actors.lock().retain(|id, actor| {
            if !actor.host.is_destroyed() {
                return true;
            }
            actor.driver.abort();
            debug!(%id, "dropped destroyed actor");
            false
        });
    }

    async fn instantiate(&self, id: ProbeId) -> Result<Arc<LocalActor>, ProbeError> {
        if let Some(existing) = self.live(id) {
            return Ok(existing);
        }
        self.prune();

        let host = Arc::new(MemoryActorHost::new());
        let actor = ProbeActor::load(id, host.clone(), self.deps.clone()).await?;
        let cell: ActorCell = Arc::new(AsyncMutex::new(actor));
        let driver = tokio::spawn(drive_alarm(id, host.clone(), Arc::downgrade(&cell))).abort_handle();
        let local = Arc::new(LocalActor { host, cell, driver });

        let mut actors = self.actors.lock();
        if let Some(existing) = actors.get(&id).filter(|a| !a.host.is_destroyed()) {
            local.driver.abort();
            return Ok(existing.clone());
        }
        if let Some(stale) = actors.insert(id, local.clone()) {
            stale.driver.abort();
        }
        Ok(local)
    }

    fn handle(id: ProbeId, local: &LocalActor) -> Arc<dyn ProbeHandle> {
        Arc::new(LocalHandle {
            id,
            cell: local.cell.clone(),
        })
    }

    /// Storage host of a live actor.
    pub fn host(&self, id: ProbeId) -> Option<Arc<MemoryActorHost>> {
        self.live(id).map(|actor| actor.host.clone())
    }

    /// Lifecycle state of a live actor.
    pub async fn state(&self, id: ProbeId) -> Option<LifecycleState> {
        let actor = self.live(id)?;
        let guard = actor.cell.lock().await;
        Some(guard.state())
    }

    /// Run the alarm handler of `id` now.
    pub async fn fire_alarm(&self, id: ProbeId) -> Result<(), ProbeError> {
        let actor = self.live(id).ok_or_else(|| ProbeError::InvalidId(id.to_string()))?;
        let mut guard = actor.cell.clone().lock_owned().await;
        let result = guard.on_alarm().await;
        guard.drain_background().await;
        result
    }

    /// Identities of actors that have not self-destructed.
    pub fn live_ids(&self) -> Vec<ProbeId> {
        self.prune();
        self.actors.lock().keys().copied().collect()
    }

    /// Number of actors currently held, destroyed ones included.
    pub fn tracked(&self) -> usize {
        self.actors.lock().len()
    }

    /// Bring back one locked actor per registry row.
    ///
    /// Actor state lives in memory, so after a restart the registry still
    /// lists instances that no longer exist here. Each row is re-locked to
    /// its recorded code, which also arms the daily self-check. Returns the
    /// number of actors restored.
    pub async fn rehydrate(&self, registry: &dyn Registry) -> Result<usize, ProbeError> {
        let rows = registry.list_instances().await?;
        let mut restored = 0;
        for row in rows {
            let local = self.instantiate(row.id).await?;
            match Self::handle(row.id, &local).lock(row.code.clone()).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(id = %row.id, code = %row.code, error = %e, "failed to restore actor"),
            }
        }
        info!(restored, "restored local actors from registry");
        Ok(restored)
    }
}

impl Drop for LocalNamespace {
    fn drop(&mut self) {
        for actor in self.actors.lock().values() {
            actor.driver.abort();
        }
    }
}

#[async_trait]
impl ActorNamespace for LocalNamespace {
    fn new_unique_id(&self) -> ProbeId {
        ProbeId::random()
    }

    async fn create(&self, id: ProbeId, hint: Location) -> Result<Arc<dyn ProbeHandle>, ProbeError> {
        let local = self.instantiate(id).await?;
        info!(%id, %hint, "created local actor");
        Ok(Self::handle(id, &local))
    }

    async fn get(&self, id: ProbeId) -> Result<Arc<dyn ProbeHandle>, ProbeError> {
        let local = self.instantiate(id).await?;
        Ok(Self::handle(id, &local))
    }
}

async fn drive_alarm(id: ProbeId, host: Arc<MemoryActorHost>, cell: Weak<AsyncMutex<ProbeActor>>) {
    let mut changes = host.alarm_changes();
    loop {
        if host.is_destroyed() {
            debug!(%id, "alarm driver stopped");
            return;
        }
        let armed = *changes.borrow_and_update();
        let Some(at) = armed else {
            if changes.changed().await.is_err() {
                return;
            }
            continue;
        };

        let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                if !host.consume_alarm(at) {
                    continue;
                }
                let Some(cell) = cell.upgrade() else { return };
                let mut actor = cell.lock_owned().await;
                if let Err(e) = actor.on_alarm().await {
                    warn!(%id, error = %e, "alarm handler failed");
                }
                actor.drain_background().await;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

struct LocalHandle {
    id: ProbeId,
    cell: ActorCell,
}

impl LocalHandle {
    async fn enter(&self) -> OwnedMutexGuard<ProbeActor> {
        self.cell.clone().lock_owned().await
    }
}

/// Hand the guard to a task that drains background work before releasing it.
fn release(mut actor: OwnedMutexGuard<ProbeActor>) {
    if actor.pending_background() == 0 {
        return;
    }
    tokio::spawn(async move {
        actor.drain_background().await;
    });
}

#[async_trait]
impl ProbeHandle for LocalHandle {
    fn id(&self) -> ProbeId {
        self.id
    }

    async fn verify_location(&self) -> Result<FineLocationCode, ProbeError> {
        let actor = self.enter().await;
        let result = actor.verify_location().await;
        release(actor);
        result
    }

    async fn lock(&self, code: FineLocationCode) -> Result<(), ProbeError> {
        let mut actor = self.enter().await;
        let result = actor.lock(code).await;
        release(actor);
        result
    }

    async fn evict(&self) -> Result<(), ProbeError> {
        let mut actor = self.enter().await;
        let result = actor.evict().await;
        release(actor);
        result
    }

    async fn resolve(
        &self,
        endpoint: ResolverEndpoint,
        name: String,
        record_type: RecordType,
        use_cache: bool,
        cancel: CancelSignal,
    ) -> Result<Vec<DnsAnswer>, ProbeError> {
        let mut actor = self.enter().await;
        let result = actor
            .resolve(endpoint, name, record_type, use_cache, cancel)
            .await;
        release(actor);
        result
    }

    async fn resolve_all(
        &self,
        name: String,
        record_type: RecordType,
        use_cache: bool,
        cancel: CancelSignal,
    ) -> Result<FanOutResults, ProbeError> {
        let mut actor = self.enter().await;
        let result = actor.resolve_all(name, record_type, use_cache, cancel).await;
        release(actor);
        result
    }
}
