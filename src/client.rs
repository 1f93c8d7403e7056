// Single-node client: one pool, request/reply plumbing, map fetch

use crate::command::{parse_command_catalog, Cmd, CommandInfo};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::pool::{ConnPool, Connection, PoolStats, PooledConn};
use crate::protocol::RespValue;
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;

/// One slot range from the cluster map, primary address first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub addrs: Vec<String>,
}

/// Client for a single cluster node. The engine creates one per node
/// handle; it owns the node's connection pool.
pub struct NodeClient {
    addr: String,
    pool: ConnPool,
}

impl NodeClient {
    pub(crate) fn new(addr: String, config: Arc<ClusterConfig>) -> Self {
        Self {
            pool: ConnPool::new(addr.clone(), config),
            addr,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub(crate) fn pool(&self) -> &ConnPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Execute one command: borrow, write, read, classify. The
    /// connection survives server error replies and is dropped on
    /// transport failures.
    pub async fn execute(&self, cmd: &mut Cmd) -> Result<()> {
        let mut pooled = self.pool.get().await?;

        if let Err(err) = pooled.conn.write_command(cmd.args()).await {
            cmd.set_err(err.clone());
            self.pool.remove(pooled);
            return Err(err);
        }

        match cmd.read_reply(&mut pooled.conn).await {
            Ok(()) => {
                self.pool.put(pooled);
                Ok(())
            }
            Err(err) => {
                self.dispose(pooled, &err);
                Err(err)
            }
        }
    }

    /// Execute a command behind an ASKING prefix, both on the same
    /// connection. The ASKING acknowledgement is discarded.
    pub(crate) async fn execute_with_asking(&self, cmd: &mut Cmd) -> Result<()> {
        let mut pooled = self.pool.get().await?;

        let mut buf = BytesMut::new();
        crate::protocol::write_command(&mut buf, &[b"ASKING".to_vec()]);
        crate::protocol::write_command(&mut buf, cmd.args());
        if let Err(err) = pooled.conn.write_raw(&buf).await {
            cmd.set_err(err.clone());
            self.pool.remove(pooled);
            return Err(err);
        }

        match pooled.conn.read_reply().await {
            Ok(_) => {}
            Err(err) => {
                cmd.set_err(err.clone());
                self.pool.remove(pooled);
                return Err(err);
            }
        }

        match cmd.read_reply(&mut pooled.conn).await {
            Ok(()) => {
                self.pool.put(pooled);
                Ok(())
            }
            Err(err) => {
                self.dispose(pooled, &err);
                Err(err)
            }
        }
    }

    /// Pipeline a batch onto one connection: write everything, then
    /// read replies in order. Server errors stick to their command; a
    /// transport error poisons the commands left unread.
    pub async fn execute_batch(&self, cmds: &mut [Cmd]) -> Result<()> {
        if cmds.is_empty() {
            return Ok(());
        }
        let mut pooled = self.pool.get().await?;

        let mut buf = BytesMut::new();
        for cmd in cmds.iter() {
            crate::protocol::write_command(&mut buf, cmd.args());
        }
        if let Err(err) = pooled.conn.write_raw(&buf).await {
            for cmd in cmds.iter_mut() {
                cmd.set_err(err.clone());
            }
            self.pool.remove(pooled);
            return Err(err);
        }

        let mut transport_err = None;
        for i in 0..cmds.len() {
            match cmds[i].read_reply(&mut pooled.conn).await {
                Ok(()) => {}
                Err(err) if err.is_server_error() => {}
                Err(err) => {
                    for cmd in cmds[i + 1..].iter_mut() {
                        cmd.set_err(err.clone());
                    }
                    transport_err = Some(err);
                    break;
                }
            }
        }

        match transport_err {
            Some(err) => {
                self.pool.remove(pooled);
                Err(err)
            }
            None => {
                self.pool.put(pooled);
                cmds.iter()
                    .find_map(|c| c.err().cloned())
                    .map_or(Ok(()), Err)
            }
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.execute(&mut Cmd::new("PING")).await
    }

    /// Liveness probe; the reply body is irrelevant
    pub async fn cluster_info(&self) -> Result<()> {
        self.execute(&mut Cmd::new("CLUSTER").arg("INFO")).await
    }

    /// Fetch the authoritative shard map
    pub async fn cluster_slots(&self) -> Result<Vec<SlotRange>> {
        let mut cmd = Cmd::new("CLUSTER").arg("SLOTS");
        self.execute(&mut cmd).await?;
        let reply = cmd.take_reply().unwrap_or(RespValue::Array(None));
        parse_cluster_slots(&reply)
    }

    /// Fetch the server's command catalog
    pub async fn command_catalog(&self) -> Result<HashMap<String, CommandInfo>> {
        let mut cmd = Cmd::new("COMMAND");
        self.execute(&mut cmd).await?;
        let reply = cmd.take_reply().unwrap_or(RespValue::Array(None));
        Ok(parse_command_catalog(&reply))
    }

    /// Dedicated connection outside the pool; subscriptions pin one of
    /// these for their whole lifetime
    pub(crate) async fn new_conn(&self, config: &ClusterConfig) -> Result<Connection> {
        Connection::connect(&self.addr, config).await
    }

    pub(crate) fn close(&self) {
        self.pool.close();
    }

    fn dispose(&self, pooled: PooledConn, err: &ClusterError) {
        if err.is_server_error() {
            self.pool.put(pooled);
        } else {
            self.pool.remove(pooled);
        }
    }
}

/// Parse a CLUSTER SLOTS reply: entries of
/// `[start, end, [host, port, ...], [host, port, ...]...]`.
/// Malformed entries and empty hosts are skipped.
pub(crate) fn parse_cluster_slots(reply: &RespValue) -> Result<Vec<SlotRange>> {
    let entries = reply.as_array().ok_or_else(|| {
        ClusterError::Server("invalid CLUSTER SLOTS reply: expected array".to_string())
    })?;

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(fields) = entry.as_array() else {
            continue;
        };
        if fields.len() < 3 {
            continue;
        }
        let (Some(start), Some(end)) = (fields[0].as_integer(), fields[1].as_integer()) else {
            continue;
        };
        if !(0..=16383).contains(&start) || !(0..=16383).contains(&end) || end < start {
            continue;
        }

        let mut addrs = Vec::with_capacity(fields.len() - 2);
        for node in &fields[2..] {
            let Some(parts) = node.as_array() else {
                continue;
            };
            if parts.len() < 2 {
                continue;
            }
            let Some(host) = parts[0].as_text() else {
                continue;
            };
            if host.is_empty() {
                continue;
            }
            let Some(port) = parts[1].as_integer() else {
                continue;
            };
            addrs.push(format!("{}:{}", host, port));
        }
        if addrs.is_empty() {
            continue;
        }

        ranges.push(SlotRange {
            start: start as u16,
            end: end as u16,
            addrs,
        });
    }
    Ok(ranges)
}
