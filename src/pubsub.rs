// Cluster pub/sub sessions over a dedicated, pool-bypassing connection

use crate::cluster::slots::key_hash_slot;
use crate::cluster::Inner;
use crate::error::{ClusterError, Result};
use crate::pool::Connection;
use crate::protocol::RespValue;
use std::sync::Arc;
use tracing::debug;

/// One inbound pub/sub frame
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubMessage {
    /// Acknowledgement of a (p)subscribe / (p)unsubscribe command
    Subscription {
        kind: String,
        channel: String,
        count: i64,
    },
    /// Message on a directly subscribed channel
    Message { channel: String, payload: Vec<u8> },
    /// Message delivered through a pattern subscription
    PMessage {
        pattern: String,
        channel: String,
        payload: Vec<u8>,
    },
}

/// A subscription session. The node is picked once, from the slot of
/// the first channel, and keeps serving the session even across map
/// reloads; the connection bypasses the node's pool because a
/// subscribed connection cannot be reused for request/reply traffic.
pub struct ClusterPubSub {
    inner: Arc<Inner>,
    node_conn: Option<Connection>,
    node_addr: Option<String>,
    channels: Vec<String>,
    patterns: Vec<String>,
}

impl ClusterPubSub {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            node_conn: None,
            node_addr: None,
            channels: Vec::new(),
            patterns: Vec::new(),
        }
    }

    /// Address of the node serving this session, once pinned
    pub fn node_addr(&self) -> Option<&str> {
        self.node_addr.as_deref()
    }

    /// Subscribe to channels. Confirmations arrive as
    /// [`PubSubMessage::Subscription`] frames from `next_message`.
    pub async fn subscribe(&mut self, channels: &[&str]) -> Result<()> {
        self.send("SUBSCRIBE", channels).await?;
        for channel in channels {
            let channel = channel.to_string();
            if !self.channels.contains(&channel) {
                self.channels.push(channel);
            }
        }
        Ok(())
    }

    /// Subscribe to channel patterns
    pub async fn psubscribe(&mut self, patterns: &[&str]) -> Result<()> {
        self.send("PSUBSCRIBE", patterns).await?;
        for pattern in patterns {
            let pattern = pattern.to_string();
            if !self.patterns.contains(&pattern) {
                self.patterns.push(pattern);
            }
        }
        Ok(())
    }

    pub async fn unsubscribe(&mut self, channels: &[&str]) -> Result<()> {
        self.send("UNSUBSCRIBE", channels).await?;
        self.channels.retain(|c| !channels.contains(&c.as_str()));
        Ok(())
    }

    pub async fn punsubscribe(&mut self, patterns: &[&str]) -> Result<()> {
        self.send("PUNSUBSCRIBE", patterns).await?;
        self.patterns.retain(|p| !patterns.contains(&p.as_str()));
        Ok(())
    }

    /// Wait for the next inbound frame. A transport error tears the
    /// dedicated connection down; a later subscribe redials the pinned
    /// node.
    pub async fn next_message(&mut self) -> Result<PubSubMessage> {
        let conn = self
            .node_conn
            .as_mut()
            .ok_or(ClusterError::PoolClosed)?;

        let reply = match conn.read_reply().await {
            Ok(reply) => reply,
            Err(err) => {
                self.node_conn = None;
                return Err(err);
            }
        };
        parse_pubsub_frame(&reply)
    }

    /// Drop the dedicated connection; the server sees a disconnect and
    /// clears the subscriptions
    pub fn close(&mut self) {
        if self.node_conn.take().is_some() {
            debug!(addr = ?self.node_addr, "pub/sub session closed");
        }
    }

    async fn send(&mut self, name: &str, args: &[&str]) -> Result<()> {
        self.ensure_conn(args.first().copied()).await?;
        let mut cmd = vec![name.as_bytes().to_vec()];
        cmd.extend(args.iter().map(|a| a.as_bytes().to_vec()));

        let conn = self
            .node_conn
            .as_mut()
            .ok_or(ClusterError::PoolClosed)?;
        if let Err(err) = conn.write_command(&cmd).await {
            self.node_conn = None;
            return Err(err);
        }
        Ok(())
    }

    /// Pin the session's node and dial its dedicated connection if not
    /// done yet. Without a channel to hash, any known node serves.
    pub(crate) async fn ensure_conn(&mut self, first_channel: Option<&str>) -> Result<()> {
        if self.node_conn.is_some() {
            return Ok(());
        }

        let node = match &self.node_addr {
            Some(addr) => self.inner.registry.get_or_create(addr).await?,
            None => {
                let node = match first_channel {
                    Some(channel) => {
                        let slot = key_hash_slot(channel.as_bytes());
                        let state = self.inner.holder.get()?;
                        state.slot_master_node(slot, &self.inner.registry).await?
                    }
                    None => self.inner.registry.random().await?,
                };
                self.node_addr = Some(node.addr().to_string());
                node
            }
        };

        self.node_conn = Some(node.client().new_conn(&self.inner.config).await?);
        Ok(())
    }
}

fn parse_pubsub_frame(reply: &RespValue) -> Result<PubSubMessage> {
    let items = reply
        .as_array()
        .ok_or_else(|| bad_frame("expected array"))?;
    let kind = items
        .first()
        .and_then(|k| k.as_text())
        .ok_or_else(|| bad_frame("missing kind"))?;

    match kind {
        "message" if items.len() == 3 => Ok(PubSubMessage::Message {
            channel: text(&items[1])?,
            payload: items[2].as_bulk_string().unwrap_or_default().to_vec(),
        }),
        "pmessage" if items.len() == 4 => Ok(PubSubMessage::PMessage {
            pattern: text(&items[1])?,
            channel: text(&items[2])?,
            payload: items[3].as_bulk_string().unwrap_or_default().to_vec(),
        }),
        "subscribe" | "unsubscribe" | "psubscribe" | "punsubscribe" if items.len() == 3 => {
            Ok(PubSubMessage::Subscription {
                kind: kind.to_string(),
                channel: text(&items[1])?,
                count: items[2].as_integer().unwrap_or(0),
            })
        }
        other => Err(bad_frame(&format!("unexpected kind {:?}", other))),
    }
}

fn text(value: &RespValue) -> Result<String> {
    value
        .as_text()
        .map(|s| s.to_string())
        .ok_or_else(|| bad_frame("expected text field"))
}

fn bad_frame(detail: &str) -> ClusterError {
    ClusterError::Resp(crate::protocol::RespError::InvalidProtocol(format!(
        "pub/sub frame: {}",
        detail
    )))
}
