// Shared test support: in-process mock cluster nodes speaking RESP

#![allow(dead_code)]

use bytes::BytesMut;
use redis_cluster_client::{ClusterConfig, RespParser, RespSerializer, RespValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Per-connection command handler; returns the frames to write back
pub type Handler = Box<dyn FnMut(&[Vec<u8>]) -> Vec<RespValue> + Send>;

/// A bound-but-not-yet-serving mock node, so tests can learn every
/// address before wiring the handlers together
pub struct BoundNode {
    listener: TcpListener,
    pub addr: String,
}

/// A serving mock node with per-command counters
pub struct MockNode {
    pub addr: String,
    counters: Arc<Mutex<HashMap<String, usize>>>,
}

pub async fn bind() -> BoundNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    BoundNode { listener, addr }
}

impl BoundNode {
    /// Start serving; `factory` builds one handler per accepted
    /// connection, so handlers may keep per-connection state
    pub fn serve<F>(self, factory: F) -> MockNode
    where
        F: Fn() -> Handler + Send + Sync + 'static,
    {
        let counters: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let shared = counters.clone();
        let listener = self.listener;

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut handler = factory();
                let counters = shared.clone();
                tokio::spawn(async move {
                    let mut buf = BytesMut::with_capacity(4096);
                    loop {
                        let args = loop {
                            match RespParser::check_complete(&buf) {
                                Ok(Some(len)) => {
                                    let frame = buf.split_to(len);
                                    let value = RespParser::parse(&frame).unwrap();
                                    let args: Vec<Vec<u8>> = value
                                        .as_array()
                                        .unwrap_or(&[])
                                        .iter()
                                        .filter_map(|v| v.as_bulk_string().map(<[u8]>::to_vec))
                                        .collect();
                                    break args;
                                }
                                Ok(None) => {}
                                Err(_) => return,
                            }
                            match socket.read_buf(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(_) => {}
                            }
                        };

                        record(&counters, &args);
                        let mut out = Vec::new();
                        for reply in handler(&args) {
                            out.extend_from_slice(&RespSerializer::serialize(&reply));
                        }
                        if socket.write_all(&out).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        MockNode {
            addr: self.addr,
            counters,
        }
    }
}

impl MockNode {
    /// How many times a command arrived. Keys are lowercase names;
    /// CLUSTER and COMMAND also count as "cluster <sub>" composites.
    pub fn count(&self, key: &str) -> usize {
        *self.counters.lock().unwrap().get(key).unwrap_or(&0)
    }
}

fn record(counters: &Arc<Mutex<HashMap<String, usize>>>, args: &[Vec<u8>]) {
    if args.is_empty() {
        return;
    }
    let name = String::from_utf8_lossy(&args[0]).to_lowercase();
    let mut map = counters.lock().unwrap();
    *map.entry(name.clone()).or_insert(0) += 1;
    if name == "cluster" && args.len() > 1 {
        let sub = String::from_utf8_lossy(&args[1]).to_lowercase();
        *map.entry(format!("{} {}", name, sub)).or_insert(0) += 1;
    }
}

pub fn cmd_name(args: &[Vec<u8>]) -> String {
    args.first()
        .map(|a| String::from_utf8_lossy(a).to_lowercase())
        .unwrap_or_default()
}

pub fn arg_text(args: &[Vec<u8>], i: usize) -> String {
    args.get(i)
        .map(|a| String::from_utf8_lossy(a).to_lowercase())
        .unwrap_or_default()
}

pub fn ok() -> RespValue {
    RespValue::SimpleString("OK".to_string())
}

pub fn bulk(data: &[u8]) -> RespValue {
    RespValue::BulkString(Some(data.to_vec()))
}

pub fn moved(slot: u16, addr: &str) -> RespValue {
    RespValue::Error(format!("MOVED {} {}", slot, addr))
}

pub fn ask(slot: u16, addr: &str) -> RespValue {
    RespValue::Error(format!("ASK {} {}", slot, addr))
}

/// Answers the ambient commands every node must serve: PING, READONLY,
/// CLUSTER INFO/SLOTS and the command catalog. Returns None for
/// anything test-specific.
pub fn base_reply(args: &[Vec<u8>], slots: &RespValue) -> Option<Vec<RespValue>> {
    match cmd_name(args).as_str() {
        "ping" => Some(vec![RespValue::SimpleString("PONG".to_string())]),
        "readonly" => Some(vec![ok()]),
        "cluster" => match arg_text(args, 1).as_str() {
            "info" => Some(vec![bulk(b"cluster_state:ok\r\ncluster_slots_assigned:16384\r\n")]),
            "slots" => Some(vec![slots.clone()]),
            _ => Some(vec![ok()]),
        },
        "command" => Some(vec![command_catalog_reply()]),
        _ => None,
    }
}

/// CLUSTER SLOTS reply for the given `(start, end, [addr...])` ranges,
/// primary address first in each node list
pub fn slots_reply(ranges: &[(u16, u16, Vec<&str>)]) -> RespValue {
    let entries = ranges
        .iter()
        .map(|(start, end, addrs)| {
            let mut fields = vec![
                RespValue::Integer(*start as i64),
                RespValue::Integer(*end as i64),
            ];
            for addr in addrs {
                let (host, port) = addr.rsplit_once(':').unwrap();
                fields.push(RespValue::Array(Some(vec![
                    bulk(host.as_bytes()),
                    RespValue::Integer(port.parse().unwrap()),
                ])));
            }
            RespValue::Array(Some(fields))
        })
        .collect();
    RespValue::Array(Some(entries))
}

/// Catalog covering the commands the tests route
pub fn command_catalog_reply() -> RespValue {
    fn entry(name: &str, arity: i64, flags: &[&str], first_key: i64) -> RespValue {
        RespValue::Array(Some(vec![
            bulk(name.as_bytes()),
            RespValue::Integer(arity),
            RespValue::Array(Some(
                flags
                    .iter()
                    .map(|f| RespValue::SimpleString(f.to_string()))
                    .collect(),
            )),
            RespValue::Integer(first_key),
            RespValue::Integer(first_key),
            RespValue::Integer(1),
        ]))
    }

    RespValue::Array(Some(vec![
        entry("get", 2, &["readonly", "fast"], 1),
        entry("set", -3, &["write", "denyoom"], 1),
        entry("incr", 2, &["write", "denyoom", "fast"], 1),
        entry("ping", -1, &["fast"], 0),
    ]))
}

/// Client configuration tuned for fast test retries
pub fn fast_config(addrs: Vec<String>) -> ClusterConfig {
    let mut config = ClusterConfig::new(addrs);
    config.min_retry_backoff = Some(Duration::from_millis(1));
    config.max_retry_backoff = Some(Duration::from_millis(2));
    config.read_timeout = Some(Duration::from_secs(2));
    config
}

/// A handler that emulates MULTI/EXEC bookkeeping on top of per-command
/// canned replies: SET answers OK, INCR answers 1
pub fn transactional_handler(slots: RespValue) -> Handler {
    let mut queued: Vec<String> = Vec::new();
    let mut in_multi = false;

    Box::new(move |args: &[Vec<u8>]| {
        if let Some(reply) = base_reply(args, &slots) {
            return reply;
        }
        let name = cmd_name(args);
        match name.as_str() {
            "multi" => {
                in_multi = true;
                queued.clear();
                vec![ok()]
            }
            "exec" => {
                in_multi = false;
                let replies: Vec<RespValue> = queued
                    .drain(..)
                    .map(|cmd| match cmd.as_str() {
                        "incr" => RespValue::Integer(1),
                        _ => ok(),
                    })
                    .collect();
                vec![RespValue::Array(Some(replies))]
            }
            _ if in_multi => {
                queued.push(name);
                vec![RespValue::SimpleString("QUEUED".to_string())]
            }
            "set" => vec![ok()],
            "incr" => vec![RespValue::Integer(1)],
            _ => vec![ok()],
        }
    })
}
