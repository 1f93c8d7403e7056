// Immutable cluster map snapshots and the holder that swaps them

use crate::client::SlotRange;
use crate::cluster::node::{NodeHandle, NodeRegistry};
use crate::cluster::slots::CLUSTER_SLOTS;
use crate::error::{ClusterError, Result};
use rand::Rng;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::debug;

/// How long a snapshot's predecessors may linger before GC
const GC_DELAY: Duration = Duration::from_secs(60);

/// Latency difference below which two nodes count as equally close
const LATENCY_THRESHOLD: Duration = Duration::from_millis(1);

/// Immutable view of the shard map at one point in time. Each slot maps
/// to an ordered node list, primary first; adjacent slots share the
/// same list instance.
pub struct ClusterState {
    generation: u64,
    slots: Vec<Arc<Vec<Arc<NodeHandle>>>>,
    masters: Vec<Arc<NodeHandle>>,
    replicas: Vec<Arc<NodeHandle>>,
}

impl ClusterState {
    /// Build a snapshot from a freshly fetched shard descriptor.
    ///
    /// Stamps every referenced node with a new generation and schedules
    /// the GC that retires nodes absent from this snapshot. Fails on the
    /// first node that cannot be created; partial work is left for that
    /// later GC.
    pub(crate) async fn build(
        registry: &Arc<NodeRegistry>,
        ranges: &[SlotRange],
        origin: &str,
    ) -> Result<Arc<Self>> {
        let generation = registry.next_generation();
        let empty: Arc<Vec<Arc<NodeHandle>>> = Arc::new(Vec::new());
        let mut slots = vec![empty; CLUSTER_SLOTS as usize];
        let mut masters: Vec<Arc<NodeHandle>> = Vec::new();
        let mut replicas: Vec<Arc<NodeHandle>> = Vec::new();

        let loopback_origin = is_loopback_addr(origin);
        for range in ranges {
            let mut nodes = Vec::with_capacity(range.addrs.len());
            for (i, listed) in range.addrs.iter().enumerate() {
                // A cluster co-hosted with its advertised endpoint
                // reports loopback addresses; reach it through the
                // address we actually fetched the map from.
                let addr = if !loopback_origin && use_origin_addr(origin, listed) {
                    origin
                } else {
                    listed.as_str()
                };

                let node = registry.get_or_create(addr).await?;
                node.set_generation(generation);
                if i == 0 {
                    append_node(&mut masters, &node);
                } else {
                    append_node(&mut replicas, &node);
                }
                nodes.push(node);
            }

            let nodes = Arc::new(nodes);
            for slot in range.start..=range.end {
                slots[slot as usize] = nodes.clone();
            }
        }

        let state = Arc::new(Self {
            generation,
            slots,
            masters,
            replicas,
        });

        let registry = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(GC_DELAY).await;
            registry.gc(generation);
        });

        Ok(state)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn masters(&self) -> &[Arc<NodeHandle>] {
        &self.masters
    }

    pub fn replicas(&self) -> &[Arc<NodeHandle>] {
        &self.replicas
    }

    pub fn slot_nodes(&self, slot: u16) -> &[Arc<NodeHandle>] {
        self.slots
            .get(slot as usize)
            .map(|nodes| nodes.as_slice())
            .unwrap_or(&[])
    }

    /// Primary for a slot, any known node when the slot is unassigned
    pub(crate) async fn slot_master_node(
        &self,
        slot: u16,
        registry: &NodeRegistry,
    ) -> Result<Arc<NodeHandle>> {
        if let Some(node) = self.slot_nodes(slot).first() {
            return Ok(node.clone());
        }
        registry.random().await
    }

    /// A replica for read-only routing, avoiding nodes that reported
    /// LOADING. With one replica the primary is the fallback; with more
    /// the replicas are sampled up to 10 times and the last sample is
    /// kept even when still loading.
    pub(crate) async fn slot_slave_node(
        &self,
        slot: u16,
        registry: &NodeRegistry,
    ) -> Result<Arc<NodeHandle>> {
        let nodes = self.slot_nodes(slot);
        match nodes.len() {
            0 => registry.random().await,
            1 => Ok(nodes[0].clone()),
            2 => {
                let replica = &nodes[1];
                if !replica.is_loading() {
                    Ok(replica.clone())
                } else {
                    Ok(nodes[0].clone())
                }
            }
            len => {
                let mut rng = rand::thread_rng();
                let mut slave = nodes[rng.gen_range(1..len)].clone();
                for _ in 1..10 {
                    if !slave.is_loading() {
                        break;
                    }
                    slave = nodes[rng.gen_range(1..len)].clone();
                }
                Ok(slave)
            }
        }
    }

    /// Lowest measured latency among the slot's non-loading nodes, with
    /// a tie-break threshold so noise does not flap the choice
    pub(crate) async fn slot_closest_node(
        &self,
        slot: u16,
        registry: &NodeRegistry,
    ) -> Result<Arc<NodeHandle>> {
        let nodes = self.slot_nodes(slot);
        if nodes.is_empty() {
            return registry.random().await;
        }

        let mut closest: Option<&Arc<NodeHandle>> = None;
        for node in nodes {
            if node.is_loading() {
                continue;
            }
            match closest {
                None => closest = Some(node),
                Some(current) => {
                    if current.latency().saturating_sub(node.latency()) > LATENCY_THRESHOLD {
                        closest = Some(node);
                    }
                }
            }
        }
        match closest {
            Some(node) => Ok(node.clone()),
            None => registry.random().await,
        }
    }

    /// Any node of the slot's list, masters included
    pub(crate) fn slot_random_node(&self, slot: u16) -> Option<Arc<NodeHandle>> {
        let nodes = self.slot_nodes(slot);
        if nodes.is_empty() {
            return None;
        }
        Some(nodes[rand::thread_rng().gen_range(0..nodes.len())].clone())
    }
}

/// True when the address's host part is a loopback IP literal
pub(crate) fn is_loopback_addr(addr: &str) -> bool {
    let Some((host, _port)) = split_host_port(addr) else {
        return false;
    };
    host.parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Substitute the origin for a reported node address? Yes when the node
/// advertises a loopback IP on the origin's port while the origin
/// itself is not loopback.
pub(crate) fn use_origin_addr(origin: &str, node_addr: &str) -> bool {
    let Some((node_host, node_port)) = split_host_port(node_addr) else {
        return false;
    };
    let Ok(node_ip) = node_host.parse::<IpAddr>() else {
        return false;
    };
    if !node_ip.is_loopback() {
        return false;
    }
    match split_host_port(origin) {
        Some((_, origin_port)) => node_port == origin_port,
        None => false,
    }
}

fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = host.strip_prefix('[').unwrap_or(host);
    let host = host.strip_suffix(']').unwrap_or(host);
    Some((host, port))
}

fn append_node(nodes: &mut Vec<Arc<NodeHandle>>, node: &Arc<NodeHandle>) {
    if !nodes.iter().any(|n| Arc::ptr_eq(n, node)) {
        nodes.push(node.clone());
    }
}

/// Concurrency-safe container for the current snapshot: atomic Arc
/// hand-out, a sticky last error, and the CAS flag that keeps reloads
/// single-flight.
pub(crate) struct StateHolder {
    state: RwLock<Option<Arc<ClusterState>>>,
    last_err: Mutex<Option<ClusterError>>,
    reloading: AtomicBool,
}

impl StateHolder {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(None),
            last_err: Mutex::new(None),
            reloading: AtomicBool::new(false),
        }
    }

    /// Current snapshot, else the sticky error, else "no state"
    pub(crate) fn get(&self) -> Result<Arc<ClusterState>> {
        if let Some(state) = self.state.read().unwrap().as_ref() {
            return Ok(state.clone());
        }
        if let Some(err) = self.last_err.lock().unwrap().as_ref() {
            return Err(err.clone());
        }
        Err(ClusterError::NoState)
    }

    /// Publish a fresh snapshot and clear the sticky error
    pub(crate) fn store(&self, state: Arc<ClusterState>) {
        debug!(generation = state.generation(), "published cluster state");
        *self.state.write().unwrap() = Some(state);
        *self.last_err.lock().unwrap() = None;
    }

    /// Record a load failure without touching the previous snapshot
    pub(crate) fn store_err(&self, err: ClusterError) {
        *self.last_err.lock().unwrap() = Some(err);
    }

    /// Claim the single reload slot; false when one is in flight
    pub(crate) fn try_begin_reload(&self) -> bool {
        self.reloading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_reload(&self) {
        self.reloading.store(false, Ordering::Release);
    }
}
