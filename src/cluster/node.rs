// Node handles and the address-keyed node registry

use crate::client::NodeClient;
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

const LOADING_EXPIRY_SECS: u64 = 60;
const LATENCY_PROBES: u32 = 10;

/// One handle per server address. Owns the node's single-node client
/// and the atomic counters the routing policies read.
pub struct NodeHandle {
    addr: String,
    client: NodeClient,

    /// Microseconds; starts at the sentinel maximum until probed
    latency_us: AtomicU32,
    /// Raised to the newest snapshot that references this node
    generation: AtomicU64,
    /// Epoch seconds of the last LOADING reply, 0 when clear
    loading_since: AtomicU64,
}

impl NodeHandle {
    pub(crate) fn new(addr: String, config: Arc<ClusterConfig>) -> Arc<Self> {
        let node = Arc::new(Self {
            client: NodeClient::new(addr.clone(), config.clone()),
            addr,
            latency_us: AtomicU32::new(u32::MAX),
            generation: AtomicU64::new(0),
            loading_since: AtomicU64::new(0),
        });

        if config.route_by_latency {
            let probe = node.clone();
            tokio::spawn(async move {
                probe.update_latency().await;
            });
        }
        node
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn client(&self) -> &NodeClient {
        &self.client
    }

    /// Liveness probe used on first contact
    pub async fn test(&self) -> Result<()> {
        self.client.cluster_info().await
    }

    /// One-shot probe: serial pings folded by `(latency + sample) / 2`,
    /// published once at the end. Until then readers see the sentinel.
    async fn update_latency(&self) {
        let mut latency: u32 = 0;
        for _ in 0..LATENCY_PROBES {
            let start = Instant::now();
            let _ = self.client.ping().await;
            let sample = start.elapsed().as_micros().min(u32::MAX as u128) as u32;
            latency = (latency + sample) / 2;
        }
        self.latency_us.store(latency, Ordering::Release);
        debug!(addr = %self.addr, latency_us = latency, "latency probe finished");
    }

    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us.load(Ordering::Acquire) as u64)
    }

    #[cfg(test)]
    pub(crate) fn set_latency(&self, micros: u32) {
        self.latency_us.store(micros, Ordering::Release);
    }

    pub fn mark_loading(&self) {
        self.loading_since.store(epoch_secs(), Ordering::Release);
    }

    /// True within 60 s of the last LOADING reply; clears the flag as a
    /// side effect once it expires
    pub fn is_loading(&self) -> bool {
        let since = self.loading_since.load(Ordering::Acquire);
        if since == 0 {
            return false;
        }
        if epoch_secs().saturating_sub(since) < LOADING_EXPIRY_SECS {
            return true;
        }
        self.loading_since.store(0, Ordering::Release);
        false
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Monotonic: only ever raises the tag
    pub fn set_generation(&self, generation: u64) {
        loop {
            let current = self.generation.load(Ordering::Acquire);
            if generation < current {
                break;
            }
            if self
                .generation
                .compare_exchange(current, generation, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    pub(crate) fn close(&self) {
        self.client.close();
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct RegistryInner {
    /// Every address ever seen: seeds, snapshot nodes, redirect targets
    all_addrs: Vec<String>,
    /// Addresses that answered the liveness probe
    reachable_addrs: Vec<String>,
    nodes: HashMap<String, Arc<NodeHandle>>,
    closed: bool,
}

/// Address-keyed table of node handles. Creation is deduplicated with a
/// per-address single flight; retirement goes through generational GC.
pub struct NodeRegistry {
    config: Arc<ClusterConfig>,
    inner: RwLock<RegistryInner>,
    creating: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    generation: AtomicU64,
}

impl NodeRegistry {
    pub(crate) fn new(config: Arc<ClusterConfig>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                all_addrs: config.addrs.clone(),
                reachable_addrs: Vec::new(),
                nodes: HashMap::new(),
                closed: false,
            }),
            creating: DashMap::new(),
            generation: AtomicU64::new(0),
            config,
        }
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Get the handle for an address, constructing it on first use.
    /// Concurrent callers for one address share a single construction
    /// attempt, liveness probe included. The address is remembered even
    /// when the probe fails; only successes count as reachable.
    pub async fn get_or_create(&self, addr: &str) -> Result<Arc<NodeHandle>> {
        {
            let inner = self.inner.read().unwrap();
            if inner.closed {
                return Err(ClusterError::PoolClosed);
            }
            if let Some(node) = inner.nodes.get(addr) {
                return Ok(node.clone());
            }
        }

        let gate = self
            .creating
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = gate.lock().await;

        // A flight winner may have inserted the node while we waited
        let settled = {
            let inner = self.inner.read().unwrap();
            if inner.closed {
                Some(Err(ClusterError::PoolClosed))
            } else {
                inner.nodes.get(addr).cloned().map(Ok)
            }
        };
        if let Some(result) = settled {
            drop(guard);
            self.creating.remove(addr);
            return result;
        }

        let node = NodeHandle::new(addr.to_string(), self.config.clone());
        let probed = node.test().await;

        let result = {
            let mut inner = self.inner.write().unwrap();
            if inner.closed {
                node.close();
                Err(ClusterError::PoolClosed)
            } else if let Some(existing) = inner.nodes.get(addr) {
                let existing = existing.clone();
                node.close();
                Ok(existing)
            } else {
                append_if_missing(&mut inner.all_addrs, addr);
                if probed.is_ok() {
                    append_if_missing(&mut inner.reachable_addrs, addr);
                }
                inner.nodes.insert(addr.to_string(), node.clone());
                probed.map(|_| node)
            }
        };

        drop(guard);
        self.creating.remove(addr);
        result
    }

    /// Addresses to try for a map load: reachable ones when any exist,
    /// the full history otherwise
    pub fn addrs(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().unwrap();
        if inner.closed {
            return Err(ClusterError::PoolClosed);
        }
        let addrs = if !inner.reachable_addrs.is_empty() {
            inner.reachable_addrs.clone()
        } else {
            inner.all_addrs.clone()
        };
        if addrs.is_empty() {
            return Err(ClusterError::NoNodes);
        }
        Ok(addrs)
    }

    /// Uniformly random known node
    pub async fn random(&self) -> Result<Arc<NodeHandle>> {
        let addrs = self.addrs()?;
        let pick = rand::thread_rng().gen_range(0..addrs.len());
        self.get_or_create(&addrs[pick]).await
    }

    /// Snapshot of the current handles
    pub fn all(&self) -> Result<Vec<Arc<NodeHandle>>> {
        let inner = self.inner.read().unwrap();
        if inner.closed {
            return Err(ClusterError::PoolClosed);
        }
        Ok(inner.nodes.values().cloned().collect())
    }

    /// Retire nodes no snapshot references anymore: everything tagged
    /// strictly below `generation`. Their addresses stay in the seen
    /// history but stop counting as reachable.
    pub fn gc(&self, generation: u64) {
        let collected = {
            let mut inner = self.inner.write().unwrap();
            let stale: Vec<String> = inner
                .nodes
                .iter()
                .filter(|(_, node)| node.generation() < generation)
                .map(|(addr, _)| addr.clone())
                .collect();

            let mut collected = Vec::with_capacity(stale.len());
            for addr in stale {
                if let Some(node) = inner.nodes.remove(&addr) {
                    collected.push(node);
                }
                inner.reachable_addrs.retain(|a| a != &addr);
            }
            collected
        };

        if !collected.is_empty() {
            debug!(generation, count = collected.len(), "collected stale nodes");
        }
        for node in &collected {
            node.close();
        }
    }

    /// Idempotent; closes every handle
    pub fn close(&self) {
        let nodes = {
            let mut inner = self.inner.write().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.reachable_addrs.clear();
            std::mem::take(&mut inner.nodes)
        };
        for node in nodes.values() {
            node.close();
        }
    }
}

fn append_if_missing(addrs: &mut Vec<String>, addr: &str) {
    if !addrs.iter().any(|a| a == addr) {
        addrs.push(addr.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RespParser, RespSerializer, RespValue};
    use bytes::BytesMut;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal node stub: answers CLUSTER INFO with a status blob and
    /// everything else with +OK, counting CLUSTER INFO requests.
    async fn spawn_stub() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let probes = Arc::new(AtomicUsize::new(0));
        let counter = probes.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut buf = BytesMut::with_capacity(1024);
                    loop {
                        let reply = loop {
                            if let Ok(Some(len)) = RespParser::check_complete(&buf) {
                                let frame = buf.split_to(len);
                                let cmd = RespParser::parse(&frame).unwrap();
                                let args = cmd.as_array().unwrap_or(&[]);
                                let name = args
                                    .first()
                                    .and_then(|a| a.as_text())
                                    .unwrap_or("")
                                    .to_lowercase();
                                if name == "cluster" {
                                    counter.fetch_add(1, Ordering::SeqCst);
                                    break RespValue::BulkString(Some(
                                        b"cluster_state:ok".to_vec(),
                                    ));
                                }
                                break RespValue::SimpleString("OK".to_string());
                            }
                            match socket.read_buf(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(_) => {}
                            }
                        };
                        let out = RespSerializer::serialize(&reply);
                        if socket.write_all(&out).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (addr, probes)
    }

    fn registry_config() -> Arc<ClusterConfig> {
        let mut config = ClusterConfig::new(vec![]);
        config.normalize();
        Arc::new(config)
    }

    #[test]
    fn test_generation_is_monotonic() {
        let node = NodeHandle::new("127.0.0.1:1".to_string(), registry_config());

        node.set_generation(5);
        assert_eq!(node.generation(), 5);
        node.set_generation(3);
        assert_eq!(node.generation(), 5);
        node.set_generation(9);
        assert_eq!(node.generation(), 9);
    }

    #[test]
    fn test_loading_flag() {
        let node = NodeHandle::new("127.0.0.1:1".to_string(), registry_config());

        assert!(!node.is_loading());
        node.mark_loading();
        assert!(node.is_loading());

        // A stamp older than the expiry window clears on read
        node.loading_since
            .store(epoch_secs() - LOADING_EXPIRY_SECS - 1, Ordering::Release);
        assert!(!node.is_loading());
        assert_eq!(node.loading_since.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_latency_sentinel() {
        let node = NodeHandle::new("127.0.0.1:1".to_string(), registry_config());
        assert_eq!(node.latency(), Duration::from_micros(u32::MAX as u64));
    }

    #[tokio::test]
    async fn test_get_or_create_single_flight() {
        let (addr, probes) = spawn_stub().await;
        let registry = Arc::new(NodeRegistry::new(registry_config()));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let addr = addr.clone();
            tasks.push(tokio::spawn(
                async move { registry.get_or_create(&addr).await },
            ));
        }
        let mut nodes = Vec::new();
        for task in tasks {
            nodes.push(task.await.unwrap().unwrap());
        }

        // One construction, one liveness probe, one shared handle
        assert_eq!(probes.load(Ordering::SeqCst), 1);
        for node in &nodes[1..] {
            assert!(Arc::ptr_eq(&nodes[0], node));
        }
    }

    #[tokio::test]
    async fn test_failed_probe_keeps_address_unreachable() {
        // Nothing listens on this address; connect is refused fast
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let registry = NodeRegistry::new(registry_config());
        assert!(registry.get_or_create(&dead_addr).await.is_err());

        // Seen, but not reachable; the cached handle comes back clean
        let addrs = registry.addrs().unwrap();
        assert_eq!(addrs, vec![dead_addr.clone()]);
        assert!(registry.get_or_create(&dead_addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_addrs_prefers_reachable() {
        let (live, _) = spawn_stub().await;
        let mut config = ClusterConfig::new(vec!["10.255.255.1:6379".to_string()]);
        config.normalize();
        let registry = NodeRegistry::new(Arc::new(config));

        registry.get_or_create(&live).await.unwrap();
        assert_eq!(registry.addrs().unwrap(), vec![live]);
    }

    #[tokio::test]
    async fn test_gc_retires_older_generations() {
        let (addr_a, _) = spawn_stub().await;
        let (addr_b, _) = spawn_stub().await;
        let registry = NodeRegistry::new(registry_config());

        let node_a = registry.get_or_create(&addr_a).await.unwrap();
        let node_b = registry.get_or_create(&addr_b).await.unwrap();
        node_a.set_generation(1);
        node_b.set_generation(2);

        registry.gc(2);

        let remaining = registry.all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].addr(), addr_b);
        // The seen history keeps the collected address
        let inner = registry.inner.read().unwrap();
        assert!(inner.all_addrs.contains(&addr_a));
        assert!(!inner.reachable_addrs.contains(&addr_a));
    }

    #[tokio::test]
    async fn test_random_fails_on_empty_registry() {
        let registry = NodeRegistry::new(registry_config());
        assert!(matches!(
            registry.random().await,
            Err(ClusterError::NoNodes)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (addr, _) = spawn_stub().await;
        let registry = NodeRegistry::new(registry_config());
        registry.get_or_create(&addr).await.unwrap();

        registry.close();
        registry.close();
        assert!(matches!(
            registry.get_or_create(&addr).await,
            Err(ClusterError::PoolClosed)
        ));
        assert!(matches!(registry.addrs(), Err(ClusterError::PoolClosed)));
    }
}
