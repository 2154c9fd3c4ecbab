//! Shared fakes for dispatch integration tests
#![allow(dead_code)] // Not every test file uses every helper

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use async_trait::async_trait;
use outpost_common::ManualClock;
use outpost_dispatch::{
    BounceSink, ClaimedBatch, Deliverer, DeliveryReport, DispatchConfig, Dispatcher, DnsError,
    EmailIpMappings, IpAddress, IpPool, IpRegistry, MemoryQueueStore, MessageId, MxLookup,
    MxRecord, NewIpAddress, NewQueuedMessage, OrganizationId, QueuedMessage, ServerId,
    ServerPoolRules,
};
use parking_lot::{Mutex, RwLock};

pub const START: i64 = 1_700_000_000;
pub const SERVER: ServerId = ServerId(1);
pub const ORGANIZATION: OrganizationId = OrganizationId(1);

/// MX answers from a table, counting lookups per domain.
#[derive(Debug, Default)]
pub struct ScriptedMx {
    answers: AHashMap<String, Result<Vec<MxRecord>, String>>,
    calls: Mutex<AHashMap<String, usize>>,
}

impl ScriptedMx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, domain: &str, hosts: &[(u16, &str)]) -> Self {
        self.answers.insert(
            domain.to_string(),
            Ok(hosts
                .iter()
                .map(|(priority, host)| MxRecord::new(*priority, *host))
                .collect()),
        );
        self
    }

    pub fn failing(mut self, domain: &str) -> Self {
        self.answers
            .insert(domain.to_string(), Err("SERVFAIL".to_string()));
        self
    }

    pub fn calls(&self, domain: &str) -> usize {
        self.calls.lock().get(domain).copied().unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl MxLookup for ScriptedMx {
    async fn mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError> {
        *self.calls.lock().entry(domain.to_string()).or_default() += 1;

        match self.answers.get(domain) {
            Some(Ok(records)) => Ok(records.clone()),
            Some(Err(error)) => Err(DnsError::LookupFailed(error.clone())),
            None => Ok(Vec::new()),
        }
    }
}

/// Records every batch it is handed and reports success for all of it.
#[derive(Debug, Default)]
pub struct RecordingDeliverer {
    pub batches: Mutex<Vec<ClaimedBatch>>,
}

#[async_trait]
impl Deliverer for RecordingDeliverer {
    async fn deliver(&self, batch: &ClaimedBatch) -> Vec<DeliveryReport> {
        self.batches.lock().push(batch.clone());
        batch
            .messages()
            .map(|message| DeliveryReport::delivered(message.id))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct RecordingBounces {
    pub bounced: Mutex<Vec<(QueuedMessage, String)>>,
    pub count: AtomicUsize,
}

#[async_trait]
impl BounceSink for RecordingBounces {
    async fn bounce(&self, message: &QueuedMessage, reason: &str) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.bounced
            .lock()
            .push((message.clone(), reason.to_string()));
    }
}

/// Registry with one organization owning two pools:
/// - `primary`: 192.0.2.1 (priority 100) and 192.0.2.2 (priority 1)
/// - `bulk`: 198.51.100.1
///
/// plus a pool `empty` with no addresses.
pub struct Fixture {
    pub registry: IpRegistry,
    pub primary: IpPool,
    pub bulk: IpPool,
    pub empty: IpPool,
    pub heavy: IpAddress,
    pub light: IpAddress,
    pub bulk_ip: IpAddress,
}

pub fn address(ipv4: &str, priority: u8) -> NewIpAddress {
    NewIpAddress {
        ipv4: ipv4.to_string(),
        hostname: format!("mta-{}.example.net", ipv4.replace('.', "-")),
        priority: Some(priority),
        ..NewIpAddress::default()
    }
}

pub fn fixture() -> Fixture {
    let mut registry = IpRegistry::new();

    let heavy = registry.insert_address(address("192.0.2.1", 100)).unwrap();
    let light = registry.insert_address(address("192.0.2.2", 1)).unwrap();
    let bulk_ip = registry.insert_address(address("198.51.100.1", 100)).unwrap();

    let primary = registry.insert_pool("primary", true).unwrap();
    let bulk = registry.insert_pool("bulk", false).unwrap();
    let empty = registry.insert_pool("empty", false).unwrap();

    registry.add_to_pool(heavy.id, primary.id).unwrap();
    registry.add_to_pool(light.id, primary.id).unwrap();
    registry.add_to_pool(bulk_ip.id, bulk.id).unwrap();

    for pool in [primary.id, bulk.id, empty.id] {
        registry.attach_pool(ORGANIZATION, pool).unwrap();
    }
    registry.register_server(SERVER, ORGANIZATION);

    Fixture {
        registry,
        primary,
        bulk,
        empty,
        heavy,
        light,
        bulk_ip,
    }
}

pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub clock: ManualClock,
    pub mx: Arc<ScriptedMx>,
    pub store: MemoryQueueStore,
}

pub fn harness(config: DispatchConfig, mx: ScriptedMx) -> Harness {
    harness_with(config, mx, IpRegistry::new(), EmailIpMappings::new(), ServerPoolRules::new())
}

pub fn harness_with(
    config: DispatchConfig,
    mx: ScriptedMx,
    registry: IpRegistry,
    mappings: EmailIpMappings,
    pools: ServerPoolRules,
) -> Harness {
    let clock = ManualClock::at_unix(START);
    let mx = Arc::new(mx);
    let store = MemoryQueueStore::new();

    let dispatcher = Dispatcher::builder()
        .with_config(config)
        .with_memory_store(store.clone())
        .with_mx_lookup(mx.clone())
        .with_registry(Arc::new(RwLock::new(registry)))
        .with_mappings(Arc::new(RwLock::new(mappings)))
        .with_pool_resolver(Arc::new(pools))
        .with_clock(Arc::new(clock.clone()))
        .build()
        .unwrap();

    Harness {
        dispatcher: Arc::new(dispatcher),
        clock,
        mx,
        store,
    }
}

pub fn outgoing(id: u64, from: &str, to: &str) -> NewQueuedMessage {
    NewQueuedMessage::outgoing(SERVER, MessageId(id), from, to)
}
