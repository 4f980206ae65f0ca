//! Reconciliation controller: keeps the actor fleet in line with the
//! desired-location feed.
//!
//! One cycle seeds the location table, diffs the feed against the registry,
//! tears down actors whose location disappeared and creates actors for new
//! locations. Creation is a bounded retry loop because the substrate only
//! honors a coarse placement hint: a candidate is kept only when it verifies
//! at exactly the wanted fine location code.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::discovery::{Discovery, RegionMapper, SiteDirectory};
use crate::error::ProbeError;
use crate::location::FineLocationCode;
use crate::metrics;
use crate::registry::{Registry, RegistryRow};
use crate::substrate::{ActorNamespace, ProbeHandle, ProbeId};

/// Platform operations one placement attempt costs (instantiate + verify).
pub const OPS_PER_ATTEMPT: u32 = 2;

/// Attempts each missing location may use in one cycle. Never below one.
pub fn attempt_budget(operation_budget: u32, missing: usize) -> u32 {
    let attempts = (operation_budget / OPS_PER_ATTEMPT) as usize / missing.max(1);
    u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
}

/// Outcome of tearing down one stale actor.
#[derive(Debug)]
pub struct TeardownOutcome {
    /// Actor identity.
    pub id: ProbeId,
    /// Code the actor was registered under.
    pub code: FineLocationCode,
    /// First failure, if any.
    pub result: Result<(), ProbeError>,
}

/// Outcome of filling one missing location.
#[derive(Debug)]
pub struct CreationOutcome {
    /// Code being filled.
    pub code: FineLocationCode,
    /// Attempts used.
    pub attempts: u32,
    /// Attempts allowed.
    pub budget: u32,
    /// Identity of the registered actor on success.
    pub result: Result<ProbeId, ProbeError>,
}

/// Per-item results of one reconciliation cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Size of the Desired Location Set.
    pub desired: usize,
    /// Registry rows at the start of the cycle.
    pub registered: usize,
    /// Stale actors torn down.
    pub removed: Vec<TeardownOutcome>,
    /// Missing locations attempted.
    pub created: Vec<CreationOutcome>,
}

impl CycleReport {
    /// True when the fleet already matched the feed.
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.created.is_empty()
    }

    /// Number of items that failed.
    pub fn failures(&self) -> usize {
        self.removed.iter().filter(|o| o.result.is_err()).count()
            + self.created.iter().filter(|o| o.result.is_err()).count()
    }
}

/// Drives reconciliation cycles.
pub struct Reconciler {
    namespace: Arc<dyn ActorNamespace>,
    registry: Arc<dyn Registry>,
    discovery: Arc<dyn Discovery>,
    regions: Arc<dyn RegionMapper>,
    sites: SiteDirectory,
    operation_budget: u32,
}

impl Reconciler {
    /// Wire a controller to its collaborators.
    pub fn new(
        namespace: Arc<dyn ActorNamespace>,
        registry: Arc<dyn Registry>,
        discovery: Arc<dyn Discovery>,
        regions: Arc<dyn RegionMapper>,
        sites: SiteDirectory,
        operation_budget: u32,
    ) -> Self {
        Self {
            namespace,
            registry,
            discovery,
            regions,
            sites,
            operation_budget,
        }
    }

    /// Run one cycle.
    ///
    /// Only a failure to seed locations, fetch the feed, or read the registry
    /// fails the cycle. Everything else is reported per item.
    pub async fn run_cycle(&self) -> Result<CycleReport, ProbeError> {
        let timer = metrics::Timer::start();

        if let Err(e) = self.registry.ensure_locations().await {
            metrics::record_cycle_failed();
            return Err(e);
        }

        let (desired, rows) = tokio::join!(
            self.discovery.desired_locations(),
            self.registry.list_instances()
        );
        let desired = desired.map_err(|e| match e {
            ProbeError::DiscoveryUnavailable(_) => e,
            other => ProbeError::DiscoveryUnavailable(other.to_string()),
        });
        let (desired, rows) = match (desired, rows) {
            (Ok(desired), Ok(rows)) => (desired, rows),
            (Err(e), _) | (_, Err(e)) => {
                metrics::record_cycle_failed();
                warn!(error = %e, "reconciliation cycle abandoned");
                return Err(e);
            }
        };

        let wanted: HashSet<&FineLocationCode> = desired.iter().collect();
        let have: HashSet<&FineLocationCode> = rows.iter().map(|r| &r.code).collect();

        let stale: Vec<&RegistryRow> = rows.iter().filter(|r| !wanted.contains(&r.code)).collect();
        let missing: Vec<&FineLocationCode> =
            desired.iter().filter(|c| !have.contains(c)).collect();

        metrics::record_cycle(desired.len(), rows.len(), stale.len(), missing.len());
        let budget = attempt_budget(self.operation_budget, missing.len());
        info!(
            desired = desired.len(),
            registered = rows.len(),
            stale = stale.len(),
            missing = missing.len(),
            budget,
            "reconciling fleet"
        );

        let (removed, created) = tokio::join!(
            join_all(stale.into_iter().map(|row| self.teardown(row))),
            join_all(missing.into_iter().map(|code| self.fill(code, budget)))
        );

        let report = CycleReport {
            desired: desired.len(),
            registered: rows.len(),
            removed,
            created,
        };
        info!(
            removed = report.removed.len(),
            created = report.created.len(),
            failures = report.failures(),
            elapsed_ms = timer.elapsed().as_millis() as u64,
            "reconciliation cycle complete"
        );
        Ok(report)
    }

    async fn teardown(&self, row: &RegistryRow) -> TeardownOutcome {
        let evicted = match self.namespace.get(row.id).await {
            Ok(handle) => handle.evict().await,
            Err(e) => Err(e),
        };
        if let Err(e) = &evicted {
            warn!(id = %row.id, code = %row.code, error = %e, "failed to evict stale actor");
        }

        let deleted = self.registry.delete_instance(row.id).await.map(|_| ());
        if let Err(e) = &deleted {
            warn!(id = %row.id, code = %row.code, error = %e, "failed to delete stale row");
        }

        let result = evicted.and(deleted);
        metrics::record_teardown(result.is_ok());
        if result.is_ok() {
            info!(id = %row.id, code = %row.code, "tore down stale actor");
        }
        TeardownOutcome {
            id: row.id,
            code: row.code.clone(),
            result,
        }
    }

    async fn fill(&self, code: &FineLocationCode, budget: u32) -> CreationOutcome {
        let mut attempts = 0;
        let result = self.place(code, budget, &mut attempts).await;

        metrics::record_creation(result.is_ok(), attempts);
        match &result {
            Ok(id) => info!(%code, %id, attempts, budget, "placed actor"),
            Err(e) => warn!(%code, attempts, budget, error = %e, "failed to place actor"),
        }
        CreationOutcome {
            code: code.clone(),
            attempts,
            budget,
            result,
        }
    }

    async fn place(
        &self,
        code: &FineLocationCode,
        budget: u32,
        attempts: &mut u32,
    ) -> Result<ProbeId, ProbeError> {
        let site = self.sites.lookup(code)?;
        let location = self
            .regions
            .map(&site.country, site.subdivision.as_deref())
            .await?
            .ok_or_else(|| ProbeError::RegionUnmapped {
                country: site.country.clone(),
                subdivision: site.subdivision.clone(),
            })?;

        while *attempts < budget {
            *attempts += 1;

            let id = self.namespace.new_unique_id();
            let handle = match self.namespace.create(id, location).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(%code, %id, error = %e, "failed to create candidate");
                    continue;
                }
            };

            match handle.verify_location().await {
                Ok(actual) if actual == *code => {}
                Ok(actual) => {
                    let mismatch = ProbeError::PlacementMismatch {
                        expected: code.clone(),
                        actual,
                    };
                    debug!(%id, attempt = *attempts, error = %mismatch, "discarding candidate");
                    discard(handle.as_ref()).await;
                    continue;
                }
                Err(e) => {
                    warn!(%code, %id, error = %e, "candidate failed to verify");
                    discard(handle.as_ref()).await;
                    continue;
                }
            }

            if let Err(e) = handle.lock(code.clone()).await {
                warn!(%code, %id, error = %e, "failed to lock candidate");
                discard(handle.as_ref()).await;
                continue;
            }

            let row = RegistryRow {
                id,
                location,
                code: code.clone(),
                country: site.country.clone(),
                subdivision: site.subdivision.clone(),
            };
            if let Err(e) = self.registry.insert_instance(row).await {
                discard(handle.as_ref()).await;
                return Err(ProbeError::RegistryWriteFailed {
                    code: code.clone(),
                    reason: e.to_string(),
                });
            }

            return Ok(id);
        }

        Err(ProbeError::PlacementBudgetExhausted {
            code: code.clone(),
            attempts: *attempts,
        })
    }
}

async fn discard(handle: &dyn ProbeHandle) {
    if let Err(e) = handle.evict().await {
        warn!(id = %handle.id(), error = %e, "failed to evict candidate");
    }
}
