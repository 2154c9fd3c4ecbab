//! IP allocation, overrides and pool balancing
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use chrono::{DateTime, TimeDelta};
use outpost_common::Clock;
use outpost_dispatch::{
    BalanceError, DispatchConfig, DispatchError, EmailIpMappings, IpAddressId, IpPoolId,
    MappingError, PoolAssignmentRequest, PoolRule, ServerPoolRules, ServerPools, UsageWindow,
    WorkerId,
};
use pretty_assertions::assert_eq;
use rand::{SeedableRng, rngs::StdRng};
use support::{Fixture, ORGANIZATION, SERVER, ScriptedMx, address, fixture, harness_with, outgoing};

fn pools_enabled() -> DispatchConfig {
    DispatchConfig {
        ip_pools_enabled: true,
        ..DispatchConfig::default()
    }
}

fn default_pool(pool: IpPoolId) -> ServerPoolRules {
    ServerPoolRules::new().with(
        SERVER,
        ServerPools {
            default_pool: Some(pool),
            rules: Vec::new(),
        },
    )
}

#[test]
fn test_priority_weighted_sampling() {
    let Fixture {
        registry,
        primary,
        heavy,
        light,
        ..
    } = fixture();
    let mut rng = StdRng::seed_from_u64(7);

    let mut heavy_draws = 0;
    let mut light_draws = 0;
    for _ in 0..10_000 {
        match registry.select_by_priority(primary.id, &mut rng) {
            Some(ip) if ip.id == heavy.id => heavy_draws += 1,
            Some(ip) if ip.id == light.id => light_draws += 1,
            other => panic!("unexpected draw {other:?}"),
        }
    }

    assert!(heavy_draws > 9_500, "priority 100 won only {heavy_draws} draws");
    assert!(light_draws > 0);
}

#[tokio::test]
async fn test_exact_override_beats_pool() {
    let Fixture {
        registry,
        primary,
        light,
        ..
    } = fixture();
    let mut mappings = EmailIpMappings::new();
    mappings
        .insert(&registry, SERVER, "ceo@shop.example", light.id)
        .unwrap();

    let h = harness_with(
        pools_enabled(),
        ScriptedMx::new(),
        registry,
        mappings,
        default_pool(primary.id),
    );

    // The low-priority address wins every time for the mapped sender
    for id in 0..50 {
        let queued = h
            .dispatcher
            .enqueue(outgoing(id, "ceo@shop.example", "x@corp.com"))
            .await
            .unwrap();
        assert_eq!(queued.ip_address, Some(light.id));
    }
}

#[tokio::test]
async fn test_wildcard_override_and_pool_fallback() {
    let Fixture {
        registry,
        primary,
        bulk_ip,
        ..
    } = fixture();
    let mut mappings = EmailIpMappings::new();
    mappings
        .insert(&registry, SERVER, "*@marketing.example", bulk_ip.id)
        .unwrap();

    let h = harness_with(
        pools_enabled(),
        ScriptedMx::new(),
        registry,
        mappings,
        default_pool(primary.id),
    );

    let mapped = h
        .dispatcher
        .enqueue(outgoing(1, "anyone@Marketing.example", "x@corp.com"))
        .await
        .unwrap();
    assert_eq!(mapped.ip_address, Some(bulk_ip.id));

    let pooled = h
        .dispatcher
        .enqueue(outgoing(2, "anyone@shop.example", "x@corp.com"))
        .await
        .unwrap();
    let members: Vec<IpAddressId> = h
        .dispatcher
        .registry()
        .read()
        .members(primary.id)
        .iter()
        .map(|ip| ip.id)
        .collect();
    assert!(members.contains(&pooled.ip_address.unwrap()));
}

#[test]
fn test_mapping_outside_organization_is_rejected() {
    let Fixture { mut registry, .. } = fixture();
    let foreign = registry.insert_address(address("203.0.113.9", 100)).unwrap();
    let other_pool = registry.insert_pool("elsewhere", true).unwrap();
    registry.add_to_pool(foreign.id, other_pool.id).unwrap();

    let mut mappings = EmailIpMappings::new();
    let result = mappings.insert(&registry, SERVER, "a@shop.example", foreign.id);
    assert_eq!(
        result,
        Err(MappingError::ForeignIpAddress {
            ip: foreign.id,
            server: SERVER,
        })
    );
}

#[tokio::test]
async fn test_pool_rules_route_by_recipient() {
    let Fixture {
        registry,
        primary,
        bulk,
        bulk_ip,
        ..
    } = fixture();
    let rules = ServerPoolRules::new().with(
        SERVER,
        ServerPools {
            default_pool: Some(primary.id),
            rules: vec![PoolRule {
                to: vec!["gmail.com".to_string()],
                from: Vec::new(),
                pool: bulk.id,
            }],
        },
    );

    let h = harness_with(
        pools_enabled(),
        ScriptedMx::new(),
        registry,
        EmailIpMappings::new(),
        rules,
    );

    let queued = h
        .dispatcher
        .enqueue(outgoing(1, "a@shop.example", "someone@gmail.com"))
        .await
        .unwrap();
    assert_eq!(queued.ip_address, Some(bulk_ip.id));
}

#[tokio::test]
async fn test_no_pool_leaves_message_unassigned() {
    let Fixture { registry, empty, .. } = fixture();
    let h = harness_with(
        pools_enabled(),
        ScriptedMx::new(),
        registry,
        EmailIpMappings::new(),
        default_pool(empty.id),
    );

    let queued = h
        .dispatcher
        .enqueue(outgoing(1, "a@shop.example", "x@corp.com"))
        .await
        .unwrap();
    assert_eq!(queued.ip_address, None);

    // Still deliverable
    let batch = h
        .dispatcher
        .claim_ready(&WorkerId::new("w1"), 10)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.primary.id, queued.id);
}

#[tokio::test]
async fn test_disabled_pools_ignore_overrides() {
    let Fixture {
        registry,
        primary,
        light,
        ..
    } = fixture();
    let mut mappings = EmailIpMappings::new();
    mappings
        .insert(&registry, SERVER, "ceo@shop.example", light.id)
        .unwrap();

    let h = harness_with(
        DispatchConfig::default(),
        ScriptedMx::new(),
        registry,
        mappings,
        default_pool(primary.id),
    );

    let queued = h
        .dispatcher
        .enqueue(outgoing(1, "ceo@shop.example", "x@corp.com"))
        .await
        .unwrap();
    assert_eq!(queued.ip_address, None);
}

#[tokio::test]
async fn test_least_used_pool_prefers_lower_ratio() {
    let Fixture {
        registry,
        primary,
        bulk,
        bulk_ip,
        ..
    } = fixture();
    let h = harness_with(
        pools_enabled(),
        ScriptedMx::new(),
        registry,
        EmailIpMappings::new(),
        default_pool(primary.id),
    );

    // 4 queued over 2 primary addresses = 2, 5 delivered over 1 bulk address = 5
    for id in 0..4 {
        h.dispatcher
            .enqueue(outgoing(id, "a@shop.example", "x@corp.com"))
            .await
            .unwrap();
    }
    h.store.record_delivery(bulk_ip.id, h.clock.now(), 5);

    let pool = h
        .dispatcher
        .least_used_pool(&[bulk.id, primary.id], 1, UsageWindow::AllTime)
        .await
        .unwrap();
    assert_eq!(pool.id, primary.id);

    let candidates = h
        .dispatcher
        .registry()
        .read()
        .pool_candidates(&[primary.id, bulk.id]);
    let usage = h
        .dispatcher
        .balancer()
        .usage(&candidates, UsageWindow::Today)
        .await
        .unwrap();
    assert_eq!(usage.len(), 2);
    assert!((usage[0].ratio - 2.0).abs() < f64::EPSILON);
    assert!((usage[1].ratio - 5.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_least_used_pool_rotates_by_minute() {
    let Fixture {
        registry,
        primary,
        bulk,
        empty,
        ..
    } = fixture();
    let h = harness_with(
        DispatchConfig::default(),
        ScriptedMx::new(),
        registry,
        EmailIpMappings::new(),
        ServerPoolRules::new(),
    );

    // Both pools idle: ranked by id, primary then bulk. The empty pool never
    // takes part.
    let mut picks = Vec::new();
    for minute in [0_i64, 1, 2, 3] {
        let at = (1_700_000_040 / 60 + minute) * 60;
        h.clock.set(DateTime::from_timestamp(at, 0).unwrap());
        let pool = h
            .dispatcher
            .least_used_pool_for_organization(ORGANIZATION, 5, UsageWindow::AllTime)
            .await
            .unwrap();
        picks.push(pool.id);
    }

    let base = usize::try_from((1_700_000_040_i64 / 60) % 2).unwrap();
    let order = [primary.id, bulk.id];
    let expected: Vec<_> = (0..4).map(|minute| order[(base + minute) % 2]).collect();
    assert_eq!(picks, expected);
    assert!(!picks.contains(&empty.id));

    // Within the same minute the answer is stable
    h.clock.advance(TimeDelta::seconds(30));
    let again = h
        .dispatcher
        .least_used_pool_for_organization(ORGANIZATION, 5, UsageWindow::AllTime)
        .await
        .unwrap();
    assert_eq!(Some(&again.id), picks.last());
}

#[tokio::test]
async fn test_least_used_pool_without_addresses_fails() {
    let Fixture { registry, empty, .. } = fixture();
    let h = harness_with(
        DispatchConfig::default(),
        ScriptedMx::new(),
        registry,
        EmailIpMappings::new(),
        ServerPoolRules::new(),
    );

    let result = h
        .dispatcher
        .least_used_pool(&[empty.id], 5, UsageWindow::AllTime)
        .await;
    assert!(matches!(
        result,
        Err(DispatchError::Balance(BalanceError::NoValidPools))
    ));
}

#[tokio::test]
async fn test_assign_pool_for_new_server() {
    let Fixture {
        registry,
        primary,
        bulk,
        ..
    } = fixture();
    let h = harness_with(
        pools_enabled(),
        ScriptedMx::new(),
        registry,
        EmailIpMappings::new(),
        default_pool(primary.id),
    );
    for id in 0..10 {
        h.dispatcher
            .enqueue(outgoing(id, "a@shop.example", "x@corp.com"))
            .await
            .unwrap();
    }

    let explicit = PoolAssignmentRequest {
        pool: Some(primary.id),
        ..PoolAssignmentRequest::default()
    };
    assert_eq!(
        h.dispatcher
            .assign_pool_for_new_server(ORGANIZATION, &explicit)
            .await
            .unwrap(),
        Some(primary.id)
    );

    // Only the idle bulk pool is in the top 1
    let automatic = PoolAssignmentRequest {
        top_n: 1,
        ..PoolAssignmentRequest::default()
    };
    assert_eq!(
        h.dispatcher
            .assign_pool_for_new_server(ORGANIZATION, &automatic)
            .await
            .unwrap(),
        Some(bulk.id)
    );

    let opted_out = PoolAssignmentRequest {
        auto_assign: false,
        ..PoolAssignmentRequest::default()
    };
    assert_eq!(
        h.dispatcher
            .assign_pool_for_new_server(ORGANIZATION, &opted_out)
            .await
            .unwrap(),
        None
    );
}
