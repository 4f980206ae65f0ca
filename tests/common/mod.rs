//! Shared test infrastructure for fleet integration tests.
//!
//! The fakes here replace every external collaborator: placement is scripted
//! per location hint, each actor gets a vantage point the test can move, and
//! resolution is answered in memory.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::rr::RecordType;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use probe_dns::actor::{FanOutResults, ProbeActor, ProbeDeps};
use probe_dns::codec::{AnswerData, DnsAnswer};
use probe_dns::config::RegionsConfig;
use probe_dns::controller::Reconciler;
use probe_dns::discovery::{Discovery, SiteDirectory, TableRegionMapper};
use probe_dns::local::MemoryActorHost;
use probe_dns::location::{FineLocationCode, Location, SiteInfo};
use probe_dns::registry::{Registry, RegistryRow, SqliteRegistry};
use probe_dns::resolver::{CancelSignal, Resolve, ResolverEndpoint};
use probe_dns::substrate::{ActorNamespace, LifecycleState, ProbeHandle, ProbeId};
use probe_dns::vantage::VantageProbe;
use probe_dns::{ProbeError, ResponseCache};

// --- Helpers ---

pub fn code(s: &str) -> FineLocationCode {
    FineLocationCode::new(s).unwrap()
}

pub fn doh(url: &str) -> ResolverEndpoint {
    url.parse().unwrap()
}

pub fn a_answer(name: &str, ttl: u32, addr: &str) -> DnsAnswer {
    DnsAnswer {
        name: name.to_string(),
        record_type: RecordType::A,
        ttl,
        data: AnswerData::String(addr.to_string()),
    }
}

// --- MovableVantage ---

/// Vantage point a test can move or break.
pub struct MovableVantage {
    current: Mutex<Result<FineLocationCode, String>>,
}

impl MovableVantage {
    pub fn at(code: FineLocationCode) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(Ok(code)),
        })
    }

    pub fn move_to(&self, code: FineLocationCode) {
        *self.current.lock() = Ok(code);
    }

    pub fn break_with(&self, reason: &str) {
        *self.current.lock() = Err(reason.to_string());
    }
}

#[async_trait]
impl VantageProbe for MovableVantage {
    async fn own_location(&self) -> Result<FineLocationCode, ProbeError> {
        self.current.lock().clone().map_err(ProbeError::malformed)
    }
}

// --- StubResolver ---

/// Answers every query with one A record whose address names the endpoint.
pub struct StubResolver {
    calls: AtomicUsize,
    ttl: u32,
    failing: Mutex<Vec<ResolverEndpoint>>,
}

impl StubResolver {
    pub fn new(ttl: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            ttl,
            failing: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_for(&self, endpoint: ResolverEndpoint) {
        self.failing.lock().push(endpoint);
    }
}

#[async_trait]
impl Resolve for StubResolver {
    async fn resolve(
        &self,
        endpoint: &ResolverEndpoint,
        name: &str,
        _record_type: RecordType,
        cancel: CancelSignal,
    ) -> Result<Vec<DnsAnswer>, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = cancel.reason() {
            return Err(ProbeError::Cancelled(reason));
        }
        if self.failing.lock().contains(endpoint) {
            return Err(ProbeError::UpstreamStatus {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        Ok(vec![a_answer(name, self.ttl, &endpoint.to_string())])
    }
}

// --- FlakyRegistry ---

/// SQLite registry with switchable failures.
pub struct FlakyRegistry {
    inner: SqliteRegistry,
    fail_inserts: AtomicBool,
    fail_lookups: AtomicBool,
    fail_listing: AtomicBool,
}

impl FlakyRegistry {
    pub fn new() -> Arc<Self> {
        Self::over(SqliteRegistry::in_memory().unwrap())
    }

    pub fn over(inner: SqliteRegistry) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_inserts: AtomicBool::new(false),
            fail_lookups: AtomicBool::new(false),
            fail_listing: AtomicBool::new(false),
        })
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }
}

fn injected(what: &str) -> ProbeError {
    ProbeError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("injected {what} failure"),
    ))
}

#[async_trait]
impl Registry for FlakyRegistry {
    async fn ensure_locations(&self) -> Result<(), ProbeError> {
        self.inner.ensure_locations().await
    }

    async fn list_instances(&self) -> Result<Vec<RegistryRow>, ProbeError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(injected("listing"));
        }
        self.inner.list_instances().await
    }

    async fn find_instance(&self, id: ProbeId) -> Result<Option<RegistryRow>, ProbeError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(injected("lookup"));
        }
        self.inner.find_instance(id).await
    }

    async fn insert_instance(&self, row: RegistryRow) -> Result<(), ProbeError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(injected("insert"));
        }
        self.inner.insert_instance(row).await
    }

    async fn delete_instance(&self, id: ProbeId) -> Result<bool, ProbeError> {
        self.inner.delete_instance(id).await
    }

    async fn set_location_resolvers(
        &self,
        location: Location,
        endpoints: Vec<ResolverEndpoint>,
    ) -> Result<(), ProbeError> {
        self.inner.set_location_resolvers(location, endpoints).await
    }

    async fn add_global_resolver(&self, endpoint: ResolverEndpoint) -> Result<(), ProbeError> {
        self.inner.add_global_resolver(endpoint).await
    }

    async fn resolvers_for(&self, location: Location) -> Result<Vec<ResolverEndpoint>, ProbeError> {
        self.inner.resolvers_for(location).await
    }
}

// --- FakeDiscovery ---

pub struct FakeDiscovery {
    codes: Mutex<Result<Vec<FineLocationCode>, String>>,
}

impl FakeDiscovery {
    pub fn new(codes: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            codes: Mutex::new(Ok(codes.iter().map(|c| code(c)).collect())),
        })
    }

    pub fn set(&self, codes: &[&str]) {
        *self.codes.lock() = Ok(codes.iter().map(|c| code(c)).collect());
    }

    pub fn fail(&self, reason: &str) {
        *self.codes.lock() = Err(reason.to_string());
    }
}

#[async_trait]
impl Discovery for FakeDiscovery {
    async fn desired_locations(&self) -> Result<Vec<FineLocationCode>, ProbeError> {
        self.codes
            .lock()
            .clone()
            .map_err(ProbeError::DiscoveryUnavailable)
    }
}

// --- FakeNamespace ---

struct FakeActor {
    host: Arc<MemoryActorHost>,
    vantage: Arc<MovableVantage>,
    cell: Arc<AsyncMutex<ProbeActor>>,
}

/// Actor namespace whose placements are scripted per location hint.
///
/// A created actor lands at the next queued code for its hint, or at
/// `fallback` once the queue is empty.
pub struct FakeNamespace {
    registry: Arc<dyn Registry>,
    resolver: Arc<dyn Resolve>,
    cache: ResponseCache,
    fallback: FineLocationCode,
    placements: Mutex<HashMap<Location, VecDeque<FineLocationCode>>>,
    actors: Mutex<HashMap<ProbeId, Arc<FakeActor>>>,
    created: AtomicUsize,
}

impl FakeNamespace {
    pub fn new(registry: Arc<dyn Registry>, resolver: Arc<dyn Resolve>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            resolver,
            cache: ResponseCache::new(1_000),
            fallback: code("ZZZ"),
            placements: Mutex::new(HashMap::new()),
            actors: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
        })
    }

    /// Queue where the next actors hinted at `location` will land.
    pub fn script(&self, location: Location, codes: &[&str]) {
        self.placements
            .lock()
            .entry(location)
            .or_default()
            .extend(codes.iter().map(|c| code(c)));
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    fn actor(&self, id: ProbeId) -> Arc<FakeActor> {
        self.actors.lock().get(&id).cloned().expect("unknown actor")
    }

    pub fn host(&self, id: ProbeId) -> Arc<MemoryActorHost> {
        self.actor(id).host.clone()
    }

    pub fn vantage(&self, id: ProbeId) -> Arc<MovableVantage> {
        self.actor(id).vantage.clone()
    }

    pub fn contains(&self, id: ProbeId) -> bool {
        self.actors.lock().contains_key(&id)
    }

    pub async fn state(&self, id: ProbeId) -> LifecycleState {
        let actor = self.actor(id);
        let guard = actor.cell.lock().await;
        guard.state()
    }

    pub async fn fire_alarm(&self, id: ProbeId) -> Result<(), ProbeError> {
        let actor = self.actor(id);
        let mut guard = actor.cell.lock().await;
        let result = guard.on_alarm().await;
        guard.drain_background().await;
        result
    }

    pub async fn resolve_all(
        &self,
        id: ProbeId,
        name: &str,
        use_cache: bool,
    ) -> Result<FanOutResults, ProbeError> {
        self.handle(id)
            .await
            .resolve_all(name.to_string(), RecordType::A, use_cache, CancelSignal::never())
            .await
    }

    /// Handle to an actor created earlier.
    pub async fn handle(&self, id: ProbeId) -> Arc<dyn ProbeHandle> {
        let actor = self.actor(id);
        Arc::new(FakeHandle {
            id,
            cell: actor.cell.clone(),
        })
    }

    /// Instantiate an actor already sitting at `at`.
    pub async fn spawn_at(&self, id: ProbeId, at: FineLocationCode) -> Arc<dyn ProbeHandle> {
        let host = Arc::new(MemoryActorHost::new());
        let vantage = MovableVantage::at(at);
        let deps = ProbeDeps {
            vantage: vantage.clone(),
            registry: self.registry.clone(),
            resolver: self.resolver.clone(),
            cache: self.cache.clone(),
        };
        let actor = ProbeActor::load(id, host.clone(), deps).await.unwrap();
        let cell = Arc::new(AsyncMutex::new(actor));
        self.actors.lock().insert(
            id,
            Arc::new(FakeActor {
                host,
                vantage,
                cell: cell.clone(),
            }),
        );
        Arc::new(FakeHandle { id, cell })
    }
}

#[async_trait]
impl ActorNamespace for FakeNamespace {
    fn new_unique_id(&self) -> ProbeId {
        ProbeId::random()
    }

    async fn create(&self, id: ProbeId, hint: Location) -> Result<Arc<dyn ProbeHandle>, ProbeError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let landing = self
            .placements
            .lock()
            .get_mut(&hint)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.fallback.clone());
        Ok(self.spawn_at(id, landing).await)
    }

    async fn get(&self, id: ProbeId) -> Result<Arc<dyn ProbeHandle>, ProbeError> {
        let existing = self.actors.lock().get(&id).map(|a| a.cell.clone());
        match existing {
            Some(cell) => Ok(Arc::new(FakeHandle { id, cell })),
            None => Ok(self.spawn_at(id, self.fallback.clone()).await),
        }
    }
}

/// Runs each call to completion, background work included.
struct FakeHandle {
    id: ProbeId,
    cell: Arc<AsyncMutex<ProbeActor>>,
}

#[async_trait]
impl ProbeHandle for FakeHandle {
    fn id(&self) -> ProbeId {
        self.id
    }

    async fn verify_location(&self) -> Result<FineLocationCode, ProbeError> {
        let actor = self.cell.lock().await;
        actor.verify_location().await
    }

    async fn lock(&self, code: FineLocationCode) -> Result<(), ProbeError> {
        let mut actor = self.cell.lock().await;
        let result = actor.lock(code).await;
        actor.drain_background().await;
        result
    }

    async fn evict(&self) -> Result<(), ProbeError> {
        let mut actor = self.cell.lock().await;
        let result = actor.evict().await;
        actor.drain_background().await;
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
        let mut actor = self.cell.lock().await;
        let result = actor
            .resolve(endpoint, name, record_type, use_cache, cancel)
            .await;
        actor.drain_background().await;
        result
    }

    async fn resolve_all(
        &self,
        name: String,
        record_type: RecordType,
        use_cache: bool,
        cancel: CancelSignal,
    ) -> Result<FanOutResults, ProbeError> {
        let mut actor = self.cell.lock().await;
        let result = actor.resolve_all(name, record_type, use_cache, cancel).await;
        actor.drain_background().await;
        result
    }
}

// --- Fleet builder ---

/// Everything a reconciliation test needs, wired together.
pub struct TestFleet {
    pub registry: Arc<FlakyRegistry>,
    pub resolver: Arc<StubResolver>,
    pub namespace: Arc<FakeNamespace>,
    pub discovery: Arc<FakeDiscovery>,
    pub reconciler: Reconciler,
}

pub struct TestFleetBuilder {
    desired: Vec<String>,
    sites: HashMap<String, SiteInfo>,
    countries: HashMap<String, Location>,
    operation_budget: u32,
}

impl TestFleetBuilder {
    pub fn new() -> Self {
        Self {
            desired: Vec::new(),
            sites: HashMap::new(),
            countries: HashMap::new(),
            operation_budget: 1000,
        }
    }

    /// Add a desired site in `country`, which maps to `location`.
    pub fn site(mut self, code: &str, country: &str, location: Location) -> Self {
        self.desired.push(code.to_string());
        self.sites.insert(
            code.to_string(),
            SiteInfo {
                country: country.to_string(),
                subdivision: None,
            },
        );
        self.countries.insert(country.to_string(), location);
        self
    }

    /// Add a desired code with no site directory entry.
    pub fn unknown_site(mut self, code: &str) -> Self {
        self.desired.push(code.to_string());
        self
    }

    pub fn operation_budget(mut self, budget: u32) -> Self {
        self.operation_budget = budget;
        self
    }

    pub fn build(self) -> TestFleet {
        let registry = FlakyRegistry::new();
        let resolver = StubResolver::new(300);
        let namespace = FakeNamespace::new(registry.clone(), resolver.clone());
        let desired: Vec<&str> = self.desired.iter().map(String::as_str).collect();
        let discovery = FakeDiscovery::new(&desired);

        let regions = TableRegionMapper::from_config(&RegionsConfig {
            service_url: None,
            countries: self.countries,
            subdivisions: HashMap::new(),
        });

        let reconciler = Reconciler::new(
            namespace.clone(),
            registry.clone(),
            discovery.clone(),
            Arc::new(regions),
            SiteDirectory::from_config(&self.sites),
            self.operation_budget,
        );

        TestFleet {
            registry,
            resolver,
            namespace,
            discovery,
            reconciler,
        }
    }
}

impl TestFleet {
    /// Register an actor at `at` directly, as an earlier cycle would have.
    pub async fn register_existing(&self, at: &str, location: Location) -> ProbeId {
        let id = ProbeId::random();
        let handle = self.namespace.spawn_at(id, code(at)).await;
        handle.lock(code(at)).await.unwrap();
        self.registry.ensure_locations().await.unwrap();
        self.registry
            .insert_instance(RegistryRow {
                id,
                location,
                code: code(at),
                country: "US".into(),
                subdivision: None,
            })
            .await
            .unwrap();
        id
    }

    pub async fn registered_codes(&self) -> Vec<String> {
        self.registry
            .list_instances()
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.code.to_string())
            .collect()
    }
}
