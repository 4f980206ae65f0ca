//! Probe actor: one per point-of-presence.
//!
//! An actor starts Unlocked, is locked by the controller once its vantage
//! point has been verified, and evicts itself when a periodic self-check
//! finds it has drifted or been orphaned. Eviction is terminal.
//!
//! The actor is a plain struct driven by its host. The host must serialize
//! calls into one actor and call [`ProbeActor::drain_background`] after each
//! one, before the next call is delivered.

use bytes::Bytes;
use chrono::{DateTime, Days, Utc};
use futures::future::join_all;
use hickory_proto::rr::RecordType;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, ResponseCache};
use crate::codec::DnsAnswer;
use crate::error::ProbeError;
use crate::location::FineLocationCode;
use crate::metrics::{self, EvictionReason};
use crate::registry::Registry;
use crate::resolver::{CancelSignal, Resolve, ResolverEndpoint};
use crate::substrate::{ActorHost, LifecycleState, ProbeId};
use crate::vantage::VantageProbe;

/// Durable storage key holding the Locked State.
pub const LOCKED_KEY: &str = "locked";

/// Per-endpoint outcome of [`ProbeActor::resolve_all`], in resolver order.
pub type FanOutResults = Vec<(ResolverEndpoint, Result<Vec<DnsAnswer>, ProbeError>)>;

/// Collaborators shared by every actor in a process.
#[derive(Clone)]
pub struct ProbeDeps {
    /// Live vantage point lookup.
    pub vantage: Arc<dyn VantageProbe>,
    /// Fleet registry.
    pub registry: Arc<dyn Registry>,
    /// Resolver transport.
    pub resolver: Arc<dyn Resolve>,
    /// Response cache, partitioned per actor.
    pub cache: ResponseCache,
}

/// Next alarm time: the UTC midnight following `now`.
pub fn next_alarm_after(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now + chrono::Duration::days(1))
}

/// One probe actor.
pub struct ProbeActor {
    id: ProbeId,
    host: Arc<dyn ActorHost>,
    deps: ProbeDeps,
    locked: Option<FineLocationCode>,
    evicted: bool,
    background: JoinSet<()>,
}

impl ProbeActor {
    /// Load the actor's durable state from its host.
    pub async fn load(
        id: ProbeId,
        host: Arc<dyn ActorHost>,
        deps: ProbeDeps,
    ) -> Result<Self, ProbeError> {
        let locked = match host.get(LOCKED_KEY).await? {
            Some(raw) => {
                let text = std::str::from_utf8(&raw)
                    .map_err(|_| ProbeError::InvalidCode(format!("{raw:?}")))?;
                Some(FineLocationCode::new(text)?)
            }
            None => None,
        };

        Ok(Self {
            id,
            host,
            deps,
            locked,
            evicted: false,
            background: JoinSet::new(),
        })
    }

    /// Identity of this actor.
    pub fn id(&self) -> ProbeId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        if self.evicted {
            return LifecycleState::Evicted;
        }
        match &self.locked {
            Some(code) => LifecycleState::Locked(code.clone()),
            None => LifecycleState::Unlocked,
        }
    }

    /// Live fine location code of this actor.
    pub async fn verify_location(&self) -> Result<FineLocationCode, ProbeError> {
        if self.evicted {
            return Err(ProbeError::Evicted);
        }
        self.deps.vantage.own_location().await
    }

    /// Commit to `code`. Repeating the same code is a no-op; a different code
    /// is refused and leaves the stored state untouched.
    pub async fn lock(&mut self, code: FineLocationCode) -> Result<(), ProbeError> {
        if self.evicted {
            return Err(ProbeError::Evicted);
        }
        match &self.locked {
            Some(existing) if *existing == code => return Ok(()),
            Some(existing) => {
                return Err(ProbeError::AlreadyLocked {
                    existing: existing.clone(),
                    requested: code,
                })
            }
            None => {}
        }

        self.host
            .put(LOCKED_KEY, Bytes::copy_from_slice(code.as_str().as_bytes()))
            .await?;
        self.locked = Some(code.clone());

        if self.host.alarm().await?.is_none() {
            let at = next_alarm_after(Utc::now());
            self.host.set_alarm(at).await?;
            debug!(id = %self.id, %at, "armed self-check alarm");
        }

        info!(id = %self.id, %code, "actor locked");
        Ok(())
    }

    /// Evict on command. Idempotent.
    pub async fn evict(&mut self) -> Result<(), ProbeError> {
        self.evict_for(EvictionReason::Commanded).await
    }

    async fn evict_for(&mut self, reason: EvictionReason) -> Result<(), ProbeError> {
        if self.evicted {
            return Ok(());
        }

        self.host.delete_all().await?;
        self.host.delete_alarm().await?;
        let code = self.locked.take();
        self.evicted = true;

        match self.deps.registry.delete_instance(self.id).await {
            Ok(removed) => debug!(id = %self.id, removed, "deregistered"),
            Err(e) => warn!(id = %self.id, error = %e, "failed to delete own registry row"),
        }

        metrics::record_eviction(reason);
        info!(id = %self.id, code = ?code, ?reason, "actor evicted");

        let host = self.host.clone();
        self.background.spawn(async move {
            tokio::task::yield_now().await;
            host.self_destruct().await;
        });
        Ok(())
    }

    fn locked_code(&self) -> Result<FineLocationCode, ProbeError> {
        if self.evicted {
            return Err(ProbeError::Evicted);
        }
        self.locked.clone().ok_or(ProbeError::NotLocked)
    }

    /// Resolve through this actor, reading and filling its cache partition
    /// when `use_cache` is set.
    pub async fn resolve(
        &mut self,
        endpoint: ResolverEndpoint,
        name: String,
        record_type: RecordType,
        use_cache: bool,
        cancel: CancelSignal,
    ) -> Result<Vec<DnsAnswer>, ProbeError> {
        let code = self.locked_code()?;
        let key = use_cache.then(|| CacheKey::new(&code, &endpoint, &name, record_type));

        if let Some(key) = &key {
            if let Some(hit) = self.deps.cache.get(key).await {
                return Ok(hit.answers.clone());
            }
        }

        let answers = self
            .deps
            .resolver
            .resolve(&endpoint, &name, record_type, cancel)
            .await?;

        if let Some(key) = key {
            self.store_in_background(key, answers.clone());
        }
        Ok(answers)
    }

    /// Resolve against every endpoint registered for this actor's location
    /// plus the global list, concurrently.
    ///
    /// An actor without a registry row has no resolver list and is treated as
    /// not locked.
    pub async fn resolve_all(
        &mut self,
        name: String,
        record_type: RecordType,
        use_cache: bool,
        cancel: CancelSignal,
    ) -> Result<FanOutResults, ProbeError> {
        let code = self.locked_code()?;
        let row = self
            .deps
            .registry
            .find_instance(self.id)
            .await?
            .ok_or(ProbeError::NotLocked)?;
        let endpoints = self.deps.registry.resolvers_for(row.location).await?;

        let mut slots: Vec<Option<Result<Vec<DnsAnswer>, ProbeError>>> =
            Vec::with_capacity(endpoints.len());
        let mut pending = Vec::new();
        for (idx, endpoint) in endpoints.iter().enumerate() {
            let key = use_cache.then(|| CacheKey::new(&code, endpoint, &name, record_type));
            let hit = match &key {
                Some(key) => self.deps.cache.get(key).await,
                None => None,
            };
            match hit {
                Some(hit) => slots.push(Some(Ok(hit.answers.clone()))),
                None => {
                    slots.push(None);
                    pending.push((idx, key));
                }
            }
        }

        let resolver = &self.deps.resolver;
        let lookups = pending.iter().map(|(idx, _)| {
            let endpoint = &endpoints[*idx];
            resolver.resolve(endpoint, &name, record_type, cancel.clone())
        });
        let outcomes = join_all(lookups).await;

        for ((idx, key), outcome) in pending.into_iter().zip(outcomes) {
            if let (Some(key), Ok(answers)) = (key, &outcome) {
                self.store_in_background(key, answers.clone());
            }
            slots[idx] = Some(outcome);
        }

        debug!(id = %self.id, %name, rtype = %record_type, endpoints = endpoints.len(), "fan-out resolution complete");
        Ok(endpoints
            .into_iter()
            .zip(slots)
            .filter_map(|(endpoint, slot)| slot.map(|result| (endpoint, result)))
            .collect())
    }

    fn store_in_background(&mut self, key: CacheKey, answers: Vec<DnsAnswer>) {
        let cache = self.deps.cache.clone();
        let id = self.id;
        self.background.spawn(async move {
            if let Err(e) = cache.store(key, answers).await {
                warn!(%id, error = %e, "failed to cache resolution");
            }
        });
    }

    /// Alarm handler: re-arm, then check that this actor is still where its
    /// Locked State says and still registered.
    pub async fn on_alarm(&mut self) -> Result<(), ProbeError> {
        if self.evicted {
            return Ok(());
        }

        let at = next_alarm_after(Utc::now());
        self.host.set_alarm(at).await?;

        let Some(code) = self.locked.clone() else {
            debug!(id = %self.id, %at, "alarm while unlocked, re-armed");
            return Ok(());
        };

        let (live, row) = tokio::join!(
            self.deps.vantage.own_location(),
            self.deps.registry.find_instance(self.id)
        );

        match live {
            Ok(live) if live != code => {
                warn!(id = %self.id, locked = %code, %live, "vantage drifted, evicting");
                return self.evict_for(EvictionReason::Drift).await;
            }
            Ok(_) => {}
            Err(e) => {
                metrics::record_inconclusive_check();
                warn!(id = %self.id, error = %e, "vantage check failed");
            }
        }

        match row {
            Ok(None) => {
                warn!(id = %self.id, %code, "no registry row, evicting orphan");
                return self.evict_for(EvictionReason::Orphaned).await;
            }
            Ok(Some(_)) => {}
            Err(e) => {
                metrics::record_inconclusive_check();
                warn!(id = %self.id, error = %e, "registry check failed");
            }
        }

        debug!(id = %self.id, %code, next = %at, "self-check passed");
        Ok(())
    }

    /// Wait for every background task spawned by previous calls.
    pub async fn drain_background(&mut self) {
        while let Some(joined) = self.background.join_next().await {
            if let Err(e) = joined {
                warn!(id = %self.id, error = %e, "background task failed");
            }
        }
    }

    /// Number of background tasks not yet drained.
    pub fn pending_background(&self) -> usize {
        self.background.len()
    }
}
