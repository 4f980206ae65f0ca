//! Reconciliation cycles against scripted placements.
//!
//! Every test drives `Reconciler::run_cycle()` over the fakes in `common`:
//! actors land wherever the namespace script says, the registry is SQLite in
//! memory, and the feed is set per test.

mod common;

use common::*;
use probe_dns::location::Location;
use probe_dns::registry::Registry;
use probe_dns::substrate::LifecycleState;
use probe_dns::ProbeError;

// =========================================================================
// Creation
// =========================================================================

#[tokio::test]
async fn one_location_placed_other_exhausts_budget() {
    let fleet = TestFleetBuilder::new()
        .site("AAA", "US", Location::Enam)
        .site("BBB", "DE", Location::Weur)
        .operation_budget(8)
        .build();
    fleet.namespace.script(Location::Enam, &["AAA"]);

    let report = fleet.reconciler.run_cycle().await.unwrap();

    assert_eq!(report.created.len(), 2);
    let aaa = report.created.iter().find(|o| o.code == code("AAA")).unwrap();
    let bbb = report.created.iter().find(|o| o.code == code("BBB")).unwrap();

    assert!(aaa.result.is_ok());
    assert_eq!(aaa.attempts, 1);
    assert_eq!(aaa.budget, 2);

    assert!(matches!(
        bbb.result,
        Err(ProbeError::PlacementBudgetExhausted { attempts: 2, .. })
    ));
    assert_eq!(bbb.attempts, 2);

    assert_eq!(fleet.registered_codes().await, vec!["AAA".to_string()]);
    assert_eq!(fleet.namespace.created(), 3);
    assert_eq!(report.failures(), 1);
}

#[tokio::test]
async fn mismatched_candidates_are_evicted_before_retry() {
    let fleet = TestFleetBuilder::new()
        .site("LHR", "GB", Location::Weur)
        .build();
    fleet.namespace.script(Location::Weur, &["AMS", "LHR"]);

    let report = fleet.reconciler.run_cycle().await.unwrap();

    let outcome = &report.created[0];
    let id = *outcome.result.as_ref().unwrap();
    assert_eq!(outcome.attempts, 2);
    assert_eq!(
        fleet.namespace.state(id).await,
        LifecycleState::Locked(code("LHR"))
    );

    let row = fleet.registry.find_instance(id).await.unwrap().unwrap();
    assert_eq!(row.location, Location::Weur);
    assert_eq!(row.country, "GB");
}

#[tokio::test]
async fn attempts_never_exceed_budget() {
    let fleet = TestFleetBuilder::new()
        .site("AAA", "US", Location::Enam)
        .site("BBB", "DE", Location::Weur)
        .site("CCC", "JP", Location::Apac)
        .operation_budget(1)
        .build();

    let report = fleet.reconciler.run_cycle().await.unwrap();

    assert_eq!(report.created.len(), 3);
    for outcome in &report.created {
        assert_eq!(outcome.budget, 1);
        assert!(outcome.attempts <= outcome.budget);
        assert!(outcome.result.is_err());
    }
    assert_eq!(fleet.namespace.created(), 3);
}

#[tokio::test]
async fn registry_write_failure_evicts_candidate() {
    let fleet = TestFleetBuilder::new()
        .site("SJC", "US", Location::Wnam)
        .build();
    fleet.namespace.script(Location::Wnam, &["SJC"]);
    fleet.registry.fail_inserts(true);

    let report = fleet.reconciler.run_cycle().await.unwrap();

    let outcome = &report.created[0];
    assert!(matches!(
        outcome.result,
        Err(ProbeError::RegistryWriteFailed { .. })
    ));
    assert_eq!(outcome.attempts, 1);
    assert!(fleet.registered_codes().await.is_empty());
}

#[tokio::test]
async fn unknown_site_fails_only_that_location() {
    let fleet = TestFleetBuilder::new()
        .site("SJC", "US", Location::Wnam)
        .unknown_site("QQQ")
        .build();
    fleet.namespace.script(Location::Wnam, &["SJC"]);

    let report = fleet.reconciler.run_cycle().await.unwrap();

    let qqq = report.created.iter().find(|o| o.code == code("QQQ")).unwrap();
    assert!(matches!(qqq.result, Err(ProbeError::UnknownSite(_))));
    assert_eq!(qqq.attempts, 0);
    assert_eq!(fleet.registered_codes().await, vec!["SJC".to_string()]);
}

// =========================================================================
// Teardown
// =========================================================================

#[tokio::test]
async fn stale_actor_torn_down_then_noop() {
    let fleet = TestFleetBuilder::new().build();
    let id = fleet.register_existing("CCC", Location::Enam).await;

    let report = fleet.reconciler.run_cycle().await.unwrap();

    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.removed[0].id, id);
    assert!(report.removed[0].result.is_ok());
    assert!(fleet.registered_codes().await.is_empty());
    assert_eq!(fleet.namespace.state(id).await, LifecycleState::Evicted);
    assert!(fleet.namespace.host(id).is_destroyed());

    let again = fleet.reconciler.run_cycle().await.unwrap();
    assert!(again.is_noop());
    assert_eq!(fleet.namespace.created(), 0);
}

#[tokio::test]
async fn matching_fleet_is_left_alone() {
    let fleet = TestFleetBuilder::new()
        .site("SJC", "US", Location::Wnam)
        .build();
    let id = fleet.register_existing("SJC", Location::Wnam).await;

    let report = fleet.reconciler.run_cycle().await.unwrap();

    assert!(report.is_noop());
    assert_eq!(report.desired, 1);
    assert_eq!(report.registered, 1);
    assert_eq!(
        fleet.namespace.state(id).await,
        LifecycleState::Locked(code("SJC"))
    );
}

// =========================================================================
// Cycle failures
// =========================================================================

#[tokio::test]
async fn discovery_failure_abandons_cycle() {
    let fleet = TestFleetBuilder::new()
        .site("SJC", "US", Location::Wnam)
        .build();
    let id = fleet.register_existing("AMS", Location::Weur).await;
    fleet.discovery.fail("feed down");

    let err = fleet.reconciler.run_cycle().await.unwrap_err();

    assert!(matches!(err, ProbeError::DiscoveryUnavailable(_)));
    assert_eq!(fleet.namespace.created(), 0);
    assert_eq!(
        fleet.namespace.state(id).await,
        LifecycleState::Locked(code("AMS"))
    );
}

#[tokio::test]
async fn registry_read_failure_abandons_cycle() {
    let fleet = TestFleetBuilder::new()
        .site("SJC", "US", Location::Wnam)
        .build();
    fleet.registry.fail_listing(true);

    assert!(fleet.reconciler.run_cycle().await.is_err());
    assert_eq!(fleet.namespace.created(), 0);
}

#[tokio::test]
async fn feed_change_replaces_location() {
    let fleet = TestFleetBuilder::new()
        .site("SJC", "US", Location::Wnam)
        .site("AMS", "NL", Location::Weur)
        .build();
    fleet.namespace.script(Location::Wnam, &["SJC"]);
    fleet.namespace.script(Location::Weur, &["AMS"]);
    fleet.discovery.set(&["SJC"]);

    fleet.reconciler.run_cycle().await.unwrap();
    assert_eq!(fleet.registered_codes().await, vec!["SJC".to_string()]);

    fleet.discovery.set(&["AMS"]);
    let report = fleet.reconciler.run_cycle().await.unwrap();

    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.created.len(), 1);
    assert_eq!(fleet.registered_codes().await, vec!["AMS".to_string()]);
}
