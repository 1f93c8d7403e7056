// Cluster routing engine: dispatches commands against a live shard map

pub mod node;
pub mod slots;
pub(crate) mod state;

use crate::command::{first_key_pos, Cmd, CommandInfo};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, RedirectKind, Result};
use crate::pool::PoolStats;
use crate::protocol::write_command;
use bytes::BytesMut;
use node::{NodeHandle, NodeRegistry};
use slots::{key_hash_slot, random_slot};
use state::{ClusterState, StateHolder};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, warn};

/// Slot shared by a set of keys. Fails when the keys do not co-locate,
/// which transactional callers must guarantee up front.
pub fn keys_hash_slot(keys: &[&[u8]]) -> Result<u16> {
    let Some(first) = keys.first() else {
        return Err(ClusterError::CrossSlot);
    };
    let slot = key_hash_slot(first);
    for key in &keys[1..] {
        if key_hash_slot(key) != slot {
            return Err(ClusterError::CrossSlot);
        }
    }
    Ok(slot)
}

pub(crate) struct Inner {
    pub(crate) config: Arc<ClusterConfig>,
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) holder: StateHolder,
    catalog: OnceCell<HashMap<String, CommandInfo>>,
}

impl Inner {
    /// Iterate known addresses, reachable ones first by construction,
    /// and build a snapshot from the first node that serves the map
    async fn load_state(self: &Arc<Self>) -> Result<Arc<ClusterState>> {
        let addrs = self.registry.addrs()?;

        let mut first_err = None;
        for addr in addrs {
            let node = match self.registry.get_or_create(&addr).await {
                Ok(node) => node,
                Err(err) => {
                    first_err.get_or_insert(err);
                    continue;
                }
            };
            match node.client().cluster_slots().await {
                Ok(ranges) => {
                    return ClusterState::build(&self.registry, &ranges, node.addr()).await
                }
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        Err(first_err.unwrap_or(ClusterError::NoNodes))
    }

    async fn reload(self: &Arc<Self>) -> Result<Arc<ClusterState>> {
        match self.load_state().await {
            Ok(state) => {
                self.holder.store(state.clone());
                Ok(state)
            }
            Err(err) => {
                self.holder.store_err(err.clone());
                Err(err)
            }
        }
    }

    /// Schedule an asynchronous map refresh. At most one runs at a
    /// time, and a successful reload holds the slot for another second
    /// so a storm of redirects produces at most one refresh per second.
    pub(crate) fn lazy_reload(self: &Arc<Self>) {
        if !self.holder.try_begin_reload() {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            match inner.reload().await {
                Ok(_) => tokio::time::sleep(Duration::from_secs(1)).await,
                Err(err) => warn!(error = %err, "cluster state reload failed"),
            }
            inner.holder.end_reload();
        });
    }

    async fn cmd_info(self: &Arc<Self>, name: &str) -> Option<CommandInfo> {
        let catalog = self
            .catalog
            .get_or_try_init(|| async {
                let node = self.registry.random().await?;
                node.client().command_catalog().await
            })
            .await;
        match catalog {
            Ok(map) => {
                let info = map.get(name).cloned();
                if info.is_none() {
                    debug!(command = name, "command not in catalog");
                }
                info
            }
            Err(err) => {
                debug!(error = %err, "command catalog fetch failed");
                None
            }
        }
    }
}

/// One slot of work inside a pipeline bucket: either a real command
/// (by index into the caller's batch) or the ASKING sentinel that must
/// precede a transiently redirected command
enum PipeEntry {
    Asking,
    Cmd(usize),
}

struct Bucket {
    node: Arc<NodeHandle>,
    entries: Vec<PipeEntry>,
}

impl Bucket {
    fn new(node: Arc<NodeHandle>) -> Self {
        Self {
            node,
            entries: Vec::new(),
        }
    }

    fn cmd_indices(&self) -> Vec<usize> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                PipeEntry::Cmd(i) => Some(*i),
                PipeEntry::Asking => None,
            })
            .collect()
    }
}

type Buckets = HashMap<String, Bucket>;

/// Client for a sharded, replicated cluster. Routes every command to
/// the node owning its slot, follows server redirection directives, and
/// keeps its map fresh by asking the cluster itself. Safe to share and
/// call concurrently.
pub struct ClusterClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient").finish_non_exhaustive()
    }
}

impl ClusterClient {
    /// Build a client from seed addresses and load the initial map.
    /// A failing initial load is remembered, not fatal; the next
    /// operation retries it.
    pub async fn connect(mut config: ClusterConfig) -> Result<Self> {
        config.check()?;
        config.normalize();
        let config = Arc::new(config);

        let inner = Arc::new(Inner {
            registry: Arc::new(NodeRegistry::new(config.clone())),
            holder: StateHolder::new(),
            catalog: OnceCell::new(),
            config: config.clone(),
        });

        if let Err(err) = inner.reload().await {
            debug!(error = %err, "initial cluster state load failed");
        }
        if let Some(frequency) = config.idle_check_frequency {
            Self::spawn_reaper(inner.clone(), frequency);
        }
        Ok(Self { inner })
    }

    /// Closes every node; in-flight borrows finish their connection,
    /// everything else fails with PoolClosed
    pub fn close(&self) {
        self.inner.registry.close();
    }

    /// Route and execute one command, retrying across redirects,
    /// loading replicas and transient failures within the configured
    /// budget. The outcome is stored on the command; the returned
    /// result mirrors it.
    pub async fn execute(&self, cmd: &mut Cmd) -> Result<()> {
        let mut node: Option<Arc<NodeHandle>> = None;
        let mut ask = false;

        for attempt in 0..=self.inner.config.max_redirects as u32 {
            if attempt > 0 {
                tokio::time::sleep(self.inner.config.retry_backoff(attempt)).await;
            }

            if node.is_none() {
                match self.cmd_slot_and_node(cmd).await {
                    Ok((_slot, picked)) => node = Some(picked),
                    Err(err) => {
                        cmd.set_err(err);
                        break;
                    }
                }
            }
            let Some(current) = node.clone() else {
                break;
            };

            let outcome = if ask {
                ask = false;
                current.client().execute_with_asking(cmd).await
            } else {
                current.client().execute(cmd).await
            };

            let err = match outcome {
                Ok(()) => break,
                Err(err) => err,
            };
            cmd.set_err(err.clone());

            // A loading replica is remembered and avoided on the fresh
            // selection of the next attempt. Without read routing a
            // LOADING reply surfaces like any other server error.
            if self.inner.config.read_only && err.is_loading() {
                current.mark_loading();
                node = None;
                continue;
            }

            if err.is_retryable() {
                match self.inner.registry.random().await {
                    Ok(random) => {
                        node = Some(random);
                        continue;
                    }
                    Err(err) => {
                        cmd.set_err(err);
                        break;
                    }
                }
            }

            if let Some(redirect) = err.redirect() {
                // The map is stale only for permanent redirects
                if redirect.kind == RedirectKind::Moved {
                    self.inner.lazy_reload();
                } else {
                    ask = true;
                }
                match self.inner.registry.get_or_create(&redirect.addr).await {
                    Ok(target) => {
                        node = Some(target);
                        continue;
                    }
                    Err(err) => {
                        cmd.set_err(err);
                        break;
                    }
                }
            }

            if matches!(err, ClusterError::PoolClosed) {
                node = None;
                continue;
            }

            break;
        }

        match cmd.err() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Best-effort pipeline: commands are bucketed per owning primary,
    /// written back to back and read in order. Redirected members move
    /// to their new node for the next attempt; server errors stay on
    /// their command. The first per-command error in submission order
    /// is the overall outcome.
    pub async fn execute_pipeline(&self, cmds: &mut [Cmd]) -> Result<()> {
        if cmds.is_empty() {
            return Ok(());
        }

        let mut buckets = Buckets::new();
        let all: Vec<usize> = (0..cmds.len()).collect();
        if let Err(err) = self.bucket_by_node(cmds, &all, &mut buckets).await {
            for cmd in cmds.iter_mut() {
                cmd.set_err(err.clone());
            }
            return Err(err);
        }

        for attempt in 0..=self.inner.config.max_redirects as u32 {
            if attempt > 0 {
                tokio::time::sleep(self.inner.config.retry_backoff(attempt)).await;
            }

            let mut failed = Buckets::new();
            for (_, bucket) in std::mem::take(&mut buckets) {
                self.pipeline_process_bucket(cmds, &bucket, &mut failed)
                    .await;
            }
            if failed.is_empty() {
                break;
            }
            buckets = failed;
        }

        first_cmd_err(cmds)
    }

    /// Transactional pipeline: commands are grouped by slot and each
    /// group runs as one MULTI/EXEC block on its slot's primary. A nil
    /// EXEC reply reports the transaction as aborted.
    pub async fn execute_tx_pipeline(&self, cmds: &mut [Cmd]) -> Result<()> {
        if cmds.is_empty() {
            return Ok(());
        }
        let state = self.inner.holder.get()?;

        let mut by_slot: Vec<(u16, Vec<usize>)> = Vec::new();
        for i in 0..cmds.len() {
            let slot = self.cmd_slot(&cmds[i]).await;
            match by_slot.iter_mut().find(|(s, _)| *s == slot) {
                Some((_, indices)) => indices.push(i),
                None => by_slot.push((slot, vec![i])),
            }
        }

        for (slot, indices) in by_slot {
            let node = match state.slot_master_node(slot, &self.inner.registry).await {
                Ok(node) => node,
                Err(err) => {
                    for &i in &indices {
                        cmds[i].set_err(err.clone());
                    }
                    continue;
                }
            };

            let mut bucket = Bucket::new(node);
            bucket.entries = indices.into_iter().map(PipeEntry::Cmd).collect();
            let mut buckets = Buckets::new();
            buckets.insert(bucket.node.addr().to_string(), bucket);

            for attempt in 0..=self.inner.config.max_redirects as u32 {
                if attempt > 0 {
                    tokio::time::sleep(self.inner.config.retry_backoff(attempt)).await;
                }

                let mut failed = Buckets::new();
                for (_, bucket) in std::mem::take(&mut buckets) {
                    self.tx_process_bucket(cmds, &bucket, &mut failed).await;
                }
                if failed.is_empty() {
                    break;
                }
                buckets = failed;
            }
        }

        first_cmd_err(cmds)
    }

    /// Run `f` against the primary owning the keys' shared slot,
    /// following redirects and transient failures like a single
    /// command dispatch. This is the building block for WATCH-style
    /// optimistic transactions.
    pub async fn watch<T, F, Fut>(&self, keys: &[&str], mut f: F) -> Result<T>
    where
        F: FnMut(Arc<NodeHandle>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key_bytes: Vec<&[u8]> = keys.iter().map(|k| k.as_bytes()).collect();
        let slot = keys_hash_slot(&key_bytes)?;
        let mut node = self.master_for_slot(slot).await?;

        let mut last_err = None;
        for attempt in 0..=self.inner.config.max_redirects as u32 {
            if attempt > 0 {
                tokio::time::sleep(self.inner.config.retry_backoff(attempt)).await;
            }

            let err = match f(node.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_retryable() {
                last_err = Some(err);
                continue;
            }
            if let Some(redirect) = err.redirect() {
                self.inner.lazy_reload();
                node = self.inner.registry.get_or_create(&redirect.addr).await?;
                last_err = Some(err);
                continue;
            }
            if matches!(err, ClusterError::PoolClosed) {
                node = self.master_for_slot(slot).await?;
                last_err = Some(err);
                continue;
            }
            return Err(err);
        }
        Err(last_err.unwrap_or(ClusterError::NoNodes))
    }

    /// Primary for one slot under the current snapshot
    pub async fn master_for_slot(&self, slot: u16) -> Result<Arc<NodeHandle>> {
        let state = self.inner.holder.get()?;
        state.slot_master_node(slot, &self.inner.registry).await
    }

    /// Primary owning the slot the keys share
    pub async fn master_for_keys(&self, keys: &[&[u8]]) -> Result<Arc<NodeHandle>> {
        self.master_for_slot(keys_hash_slot(keys)?).await
    }

    /// Concurrently run `f` on every primary, surfacing the first error
    pub async fn for_each_master<F, Fut>(&self, f: F) -> Result<()>
    where
        F: Fn(Arc<NodeHandle>) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let state = self.inner.holder.get()?;
        fan_out(state.masters().to_vec(), f).await
    }

    /// Concurrently run `f` on every replica, surfacing the first error
    pub async fn for_each_replica<F, Fut>(&self, f: F) -> Result<()>
    where
        F: Fn(Arc<NodeHandle>) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let state = self.inner.holder.get()?;
        fan_out(state.replicas().to_vec(), f).await
    }

    /// Concurrently run `f` on every known node, surfacing the first error
    pub async fn for_each_node<F, Fut>(&self, f: F) -> Result<()>
    where
        F: Fn(Arc<NodeHandle>) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let state = self.inner.holder.get()?;
        let mut nodes = state.masters().to_vec();
        for replica in state.replicas() {
            if !nodes.iter().any(|n| Arc::ptr_eq(n, replica)) {
                nodes.push(replica.clone());
            }
        }
        fan_out(nodes, f).await
    }

    /// Pool counters accumulated across the snapshot's nodes
    pub fn pool_stats(&self) -> PoolStats {
        let mut acc = PoolStats::default();
        let Ok(state) = self.inner.holder.get() else {
            return acc;
        };
        for node in state.masters().iter().chain(state.replicas().iter()) {
            let stats = node.client().pool_stats();
            acc.hits += stats.hits;
            acc.misses += stats.misses;
            acc.timeouts += stats.timeouts;
            acc.total_conns += stats.total_conns;
            acc.idle_conns += stats.idle_conns;
            acc.stale_conns += stats.stale_conns;
        }
        acc
    }

    /// Subscribe to channels; the session pins one node and a dedicated
    /// connection chosen from the first channel's slot. With no
    /// channels a random node is pinned for later subscriptions.
    pub async fn subscribe(&self, channels: &[&str]) -> Result<crate::pubsub::ClusterPubSub> {
        let mut pubsub = crate::pubsub::ClusterPubSub::new(self.inner.clone());
        if channels.is_empty() {
            pubsub.ensure_conn(None).await?;
        } else {
            pubsub.subscribe(channels).await?;
        }
        Ok(pubsub)
    }

    /// Pattern variant of [`subscribe`](Self::subscribe)
    pub async fn psubscribe(&self, patterns: &[&str]) -> Result<crate::pubsub::ClusterPubSub> {
        let mut pubsub = crate::pubsub::ClusterPubSub::new(self.inner.clone());
        if patterns.is_empty() {
            pubsub.ensure_conn(None).await?;
        } else {
            pubsub.psubscribe(patterns).await?;
        }
        Ok(pubsub)
    }

    async fn cmd_slot(&self, cmd: &Cmd) -> u16 {
        let info = self.inner.cmd_info(&cmd.name()).await;
        let pos = first_key_pos(cmd, info.as_ref());
        if pos == 0 {
            random_slot()
        } else {
            key_hash_slot(cmd.arg_bytes(pos))
        }
    }

    async fn cmd_slot_and_node(&self, cmd: &Cmd) -> Result<(u16, Arc<NodeHandle>)> {
        let state = self.inner.holder.get()?;
        let info = self.inner.cmd_info(&cmd.name()).await;
        let pos = first_key_pos(cmd, info.as_ref());
        let slot = if pos == 0 {
            random_slot()
        } else {
            key_hash_slot(cmd.arg_bytes(pos))
        };

        let read_only_cmd = info.map(|i| i.read_only).unwrap_or(false);
        if read_only_cmd && self.inner.config.read_only {
            if self.inner.config.route_by_latency {
                let node = state.slot_closest_node(slot, &self.inner.registry).await?;
                return Ok((slot, node));
            }
            if self.inner.config.route_randomly {
                if let Some(node) = state.slot_random_node(slot) {
                    return Ok((slot, node));
                }
                return Ok((slot, self.inner.registry.random().await?));
            }
            let node = state.slot_slave_node(slot, &self.inner.registry).await?;
            return Ok((slot, node));
        }

        let node = state.slot_master_node(slot, &self.inner.registry).await?;
        Ok((slot, node))
    }

    /// Route each listed command to its primary under the current
    /// snapshot, appending to `buckets`
    async fn bucket_by_node(
        &self,
        cmds: &[Cmd],
        indices: &[usize],
        buckets: &mut Buckets,
    ) -> Result<()> {
        let state = self.inner.holder.get()?;
        for &i in indices {
            let slot = self.cmd_slot(&cmds[i]).await;
            let node = state.slot_master_node(slot, &self.inner.registry).await?;
            buckets
                .entry(node.addr().to_string())
                .or_insert_with(|| Bucket::new(node.clone()))
                .entries
                .push(PipeEntry::Cmd(i));
        }
        Ok(())
    }

    /// Re-route commands whose node's pool went away; failures mark the
    /// commands instead of aborting the whole batch
    async fn remap_cmds(&self, cmds: &mut [Cmd], indices: &[usize], failed: &mut Buckets) {
        let mut remapped = Buckets::new();
        match self.bucket_by_node(cmds, indices, &mut remapped).await {
            Ok(()) => {
                for (addr, bucket) in remapped {
                    failed
                        .entry(addr)
                        .or_insert_with(|| Bucket::new(bucket.node.clone()))
                        .entries
                        .extend(bucket.entries);
                }
            }
            Err(err) => {
                for &i in indices {
                    cmds[i].set_err(err.clone());
                }
            }
        }
    }

    /// Interpret a reply error as a redirect: MOVED refreshes the map,
    /// ASK queues an ASKING prefix, and either re-buckets the command
    /// for the next attempt. Returns false for anything else, including
    /// an unreachable redirect target.
    async fn check_moved(&self, err: &ClusterError, idx: usize, failed: &mut Buckets) -> bool {
        let Some(redirect) = err.redirect() else {
            return false;
        };
        if redirect.kind == RedirectKind::Moved {
            self.inner.lazy_reload();
        }
        match self.inner.registry.get_or_create(&redirect.addr).await {
            Ok(node) => {
                let bucket = failed
                    .entry(node.addr().to_string())
                    .or_insert_with(|| Bucket::new(node.clone()));
                if redirect.kind == RedirectKind::Ask {
                    bucket.entries.push(PipeEntry::Asking);
                }
                bucket.entries.push(PipeEntry::Cmd(idx));
                true
            }
            Err(_) => false,
        }
    }

    async fn pipeline_process_bucket(
        &self,
        cmds: &mut [Cmd],
        bucket: &Bucket,
        failed: &mut Buckets,
    ) {
        let pool = bucket.node.client().pool();
        let mut pooled = match pool.get().await {
            Ok(pooled) => pooled,
            Err(ClusterError::PoolClosed) => {
                self.remap_cmds(cmds, &bucket.cmd_indices(), failed).await;
                return;
            }
            Err(err) => {
                for i in bucket.cmd_indices() {
                    cmds[i].set_err(err.clone());
                }
                return;
            }
        };

        let mut buf = BytesMut::new();
        for entry in &bucket.entries {
            match entry {
                PipeEntry::Asking => write_command(&mut buf, &[b"ASKING".to_vec()]),
                PipeEntry::Cmd(i) => write_command(&mut buf, cmds[*i].args()),
            }
        }
        if let Err(err) = pooled.conn.write_raw(&buf).await {
            for i in bucket.cmd_indices() {
                cmds[i].set_err(err.clone());
            }
            carry_bucket(failed, bucket);
            pool.remove(pooled);
            return;
        }

        let mut broken = false;
        for pos in 0..bucket.entries.len() {
            match &bucket.entries[pos] {
                PipeEntry::Asking => {
                    if let Err(err) = pooled.conn.read_reply().await {
                        poison_rest(cmds, &bucket.entries[pos + 1..], &err);
                        broken = true;
                        break;
                    }
                }
                PipeEntry::Cmd(i) => {
                    let i = *i;
                    match cmds[i].read_reply(&mut pooled.conn).await {
                        Ok(()) => {}
                        Err(err) => {
                            if self.check_moved(&err, i, failed).await {
                                continue;
                            }
                            if err.is_server_error() {
                                continue;
                            }
                            poison_rest(cmds, &bucket.entries[pos + 1..], &err);
                            broken = true;
                            break;
                        }
                    }
                }
            }
        }

        if broken {
            pool.remove(pooled);
        } else {
            pool.put(pooled);
        }
    }

    async fn tx_process_bucket(&self, cmds: &mut [Cmd], bucket: &Bucket, failed: &mut Buckets) {
        let pool = bucket.node.client().pool();
        let mut pooled = match pool.get().await {
            Ok(pooled) => pooled,
            Err(ClusterError::PoolClosed) => {
                self.remap_cmds(cmds, &bucket.cmd_indices(), failed).await;
                return;
            }
            Err(err) => {
                for i in bucket.cmd_indices() {
                    cmds[i].set_err(err.clone());
                }
                return;
            }
        };

        let mut buf = BytesMut::new();
        write_command(&mut buf, &[b"MULTI".to_vec()]);
        for entry in &bucket.entries {
            match entry {
                PipeEntry::Asking => write_command(&mut buf, &[b"ASKING".to_vec()]),
                PipeEntry::Cmd(i) => write_command(&mut buf, cmds[*i].args()),
            }
        }
        write_command(&mut buf, &[b"EXEC".to_vec()]);

        if let Err(err) = pooled.conn.write_raw(&buf).await {
            for i in bucket.cmd_indices() {
                cmds[i].set_err(err.clone());
            }
            carry_bucket(failed, bucket);
            pool.remove(pooled);
            return;
        }

        match self.tx_read_replies(cmds, bucket, &mut pooled.conn, failed).await {
            Ok(()) => pool.put(pooled),
            Err(err) if err.is_server_error() => pool.put(pooled),
            Err(_) => pool.remove(pooled),
        }
    }

    /// Read one MULTI ack, one queued ack per entry, the EXEC header
    /// and finally the per-command replies. Redirects seen in the
    /// queued phase re-bucket single commands; a redirect in the EXEC
    /// header is fanned out to every contained command until the
    /// re-bucketing helper first declines.
    async fn tx_read_replies(
        &self,
        cmds: &mut [Cmd],
        bucket: &Bucket,
        conn: &mut crate::pool::Connection,
        failed: &mut Buckets,
    ) -> Result<()> {
        use crate::protocol::RespValue;

        match conn.read_reply().await {
            Ok(RespValue::Error(msg)) => {
                let err = ClusterError::Server(msg);
                mark_bucket(cmds, bucket, &err);
                return Err(err);
            }
            Ok(_) => {}
            Err(err) => {
                mark_bucket(cmds, bucket, &err);
                return Err(err);
            }
        }

        for entry in &bucket.entries {
            match conn.read_reply().await {
                Ok(RespValue::Error(msg)) => {
                    let err = ClusterError::Server(msg);
                    if let PipeEntry::Cmd(i) = entry {
                        let _ = self.check_moved(&err, *i, failed).await;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    mark_bucket(cmds, bucket, &err);
                    return Err(err);
                }
            }
        }

        match conn.read_array_header().await {
            Ok(Some(_count)) => {}
            Ok(None) => {
                let err = ClusterError::TxFailed;
                mark_bucket(cmds, bucket, &err);
                return Err(err);
            }
            Err(err) => {
                if err.is_server_error() {
                    for entry in &bucket.entries {
                        if let PipeEntry::Cmd(i) = entry {
                            if !self.check_moved(&err, *i, failed).await {
                                break;
                            }
                        }
                    }
                }
                mark_bucket(cmds, bucket, &err);
                return Err(err);
            }
        }

        for pos in 0..bucket.entries.len() {
            match &bucket.entries[pos] {
                PipeEntry::Asking => {
                    if let Err(err) = conn.read_reply().await {
                        poison_rest(cmds, &bucket.entries[pos + 1..], &err);
                        return Err(err);
                    }
                }
                PipeEntry::Cmd(i) => {
                    let i = *i;
                    match cmds[i].read_reply(conn).await {
                        Ok(()) => {}
                        Err(err) if err.is_server_error() => {}
                        Err(err) => {
                            poison_rest(cmds, &bucket.entries[pos + 1..], &err);
                            return Err(err);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Periodically ask every node's pool to drop idle connections.
    /// Per-node idle checking is disabled, so this tick is the only
    /// reaper. Stops once the registry reports closed.
    fn spawn_reaper(inner: Arc<Inner>, frequency: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frequency);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let nodes = match inner.registry.all() {
                    Ok(nodes) => nodes,
                    Err(_) => break,
                };
                for node in nodes {
                    node.client().pool().reap_idle();
                }
            }
        });
    }
}

async fn fan_out<F, Fut>(nodes: Vec<Arc<NodeHandle>>, f: F) -> Result<()>
where
    F: Fn(Arc<NodeHandle>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<ClusterError>(1);
    let mut tasks = Vec::with_capacity(nodes.len());
    for node in nodes {
        let f = f.clone();
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = f(node).await {
                let _ = tx.try_send(err);
            }
        }));
    }
    drop(tx);
    for task in tasks {
        let _ = task.await;
    }
    match rx.try_recv() {
        Ok(err) => Err(err),
        Err(_) => Ok(()),
    }
}

fn first_cmd_err(cmds: &[Cmd]) -> Result<()> {
    cmds.iter()
        .find_map(|cmd| cmd.err().cloned())
        .map_or(Ok(()), Err)
}

fn mark_bucket(cmds: &mut [Cmd], bucket: &Bucket, err: &ClusterError) {
    for i in bucket.cmd_indices() {
        cmds[i].set_err(err.clone());
    }
}

fn poison_rest(cmds: &mut [Cmd], rest: &[PipeEntry], err: &ClusterError) {
    for entry in rest {
        if let PipeEntry::Cmd(i) = entry {
            cmds[*i].set_err(err.clone());
        }
    }
}

fn carry_bucket(failed: &mut Buckets, bucket: &Bucket) {
    let target = failed
        .entry(bucket.node.addr().to_string())
        .or_insert_with(|| Bucket::new(bucket.node.clone()));
    for entry in &bucket.entries {
        target.entries.push(match entry {
            PipeEntry::Asking => PipeEntry::Asking,
            PipeEntry::Cmd(i) => PipeEntry::Cmd(*i),
        });
    }
}
