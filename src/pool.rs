// Per-node connection pool and the buffered RESP connection it hands out

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::protocol::{find_crlf, parse_integer, write_command, RespParser, RespValue};
use bytes::BytesMut;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

async fn with_timeout<F, T>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ClusterError::Timeout),
        },
        None => Ok(fut.await?),
    }
}

/// A buffered RESP transport over one TCP connection.
///
/// Write-then-read ordering is the caller's responsibility; the pool
/// guarantees a single owner at a time.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    buf: BytesMut,
    last_used: Instant,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Connection {
    /// Dial a node and run the connection init sequence: READONLY when
    /// the client routes reads to replicas, then the user callback.
    pub(crate) async fn connect(addr: &str, config: &ClusterConfig) -> Result<Self> {
        let stream = match config.dial_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| ClusterError::Timeout)??,
            None => TcpStream::connect(addr).await?,
        };
        let _ = stream.set_nodelay(true);

        let mut conn = Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            last_used: Instant::now(),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        };

        if config.read_only {
            // Accepted by replicas, harmless elsewhere; an error reply
            // must not kill the connection.
            conn.write_command(&[b"READONLY".to_vec()]).await?;
            let _ = conn.read_reply().await?;
        }
        if let Some(on_connect) = &config.on_connect {
            on_connect(&conn)?;
        }
        Ok(conn)
    }

    /// Write one command as a RESP array
    pub(crate) async fn write_command(&mut self, args: &[Vec<u8>]) -> Result<()> {
        let mut buf = BytesMut::new();
        write_command(&mut buf, args);
        self.write_raw(&buf).await
    }

    /// Write pre-framed bytes, e.g. a pipelined batch
    pub(crate) async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.last_used = Instant::now();
        with_timeout(self.write_timeout, async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        })
        .await
    }

    /// Read one RESP value. Error replies come back as
    /// `RespValue::Error`; classification is the caller's job.
    pub(crate) async fn read_reply(&mut self) -> Result<RespValue> {
        self.last_used = Instant::now();
        loop {
            if let Some(len) = RespParser::check_complete(&self.buf)? {
                let frame = self.buf.split_to(len);
                return Ok(RespParser::parse(&frame)?);
            }
            let n = with_timeout(self.read_timeout, self.stream.read_buf(&mut self.buf)).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    /// Read a bare array header without consuming its elements. Used
    /// for EXEC framing: returns the element count, `None` for the nil
    /// array, or the error reply.
    pub(crate) async fn read_array_header(&mut self) -> Result<Option<i64>> {
        self.last_used = Instant::now();
        loop {
            if let Some(end) = find_crlf(&self.buf) {
                let line = self.buf.split_to(end + 2);
                let line = &line[..end];
                return match line.first() {
                    Some(b'*') => {
                        let len = parse_integer(&line[1..]).map_err(ClusterError::Resp)?;
                        if len == -1 {
                            Ok(None)
                        } else {
                            Ok(Some(len))
                        }
                    }
                    Some(b'-') => Err(ClusterError::Server(
                        String::from_utf8_lossy(&line[1..]).to_string(),
                    )),
                    _ => Err(ClusterError::Resp(crate::protocol::RespError::InvalidProtocol(
                        format!("expected '*', got {:?}", String::from_utf8_lossy(line)),
                    ))),
                };
            }
            let n = with_timeout(self.read_timeout, self.stream.read_buf(&mut self.buf)).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u32,
    pub misses: u32,
    pub timeouts: u32,
    pub total_conns: u32,
    pub idle_conns: u32,
    pub stale_conns: u32,
}

/// A borrowed connection; give it back with `ConnPool::put` or discard
/// it with `ConnPool::remove`
#[derive(Debug)]
pub struct PooledConn {
    pub(crate) conn: Connection,
    _permit: OwnedSemaphorePermit,
}

/// Connection pool for one node address.
///
/// Capacity bounds borrows, not connections: a connection is either
/// borrowed (its permit held) or sitting in the idle list. Idle reaping
/// is driven externally by the engine tick.
pub struct ConnPool {
    addr: String,
    config: Arc<ClusterConfig>,
    sem: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    closed: AtomicBool,
    hits: AtomicU32,
    misses: AtomicU32,
    timeouts: AtomicU32,
    total_conns: AtomicU32,
    stale_conns: AtomicU32,
}

impl ConnPool {
    pub(crate) fn new(addr: String, config: Arc<ClusterConfig>) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(config.pool_size)),
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            hits: AtomicU32::new(0),
            misses: AtomicU32::new(0),
            timeouts: AtomicU32::new(0),
            total_conns: AtomicU32::new(0),
            stale_conns: AtomicU32::new(0),
            addr,
            config,
        }
    }

    /// Borrow a connection, dialing a fresh one when the idle list is
    /// empty. Waits at most `pool_timeout` for capacity.
    pub async fn get(&self) -> Result<PooledConn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::PoolClosed);
        }

        let acquire = self.sem.clone().acquire_owned();
        let permit = match self.config.pool_timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(ClusterError::PoolClosed),
                Err(_) => {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(ClusterError::PoolTimeout);
                }
            },
            None => match acquire.await {
                Ok(permit) => permit,
                Err(_) => return Err(ClusterError::PoolClosed),
            },
        };

        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::PoolClosed);
        }

        loop {
            let conn = {
                let mut idle = self.idle.lock().unwrap();
                idle.pop()
            };
            match conn {
                Some(conn) => {
                    if self.is_stale(&conn) {
                        self.stale_conns.fetch_add(1, Ordering::Relaxed);
                        self.total_conns.fetch_sub(1, Ordering::Relaxed);
                        continue;
                    }
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(PooledConn {
                        conn,
                        _permit: permit,
                    });
                }
                None => break,
            }
        }

        let conn = Connection::connect(&self.addr, &self.config).await?;
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.total_conns.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConn {
            conn,
            _permit: permit,
        })
    }

    /// Return a healthy connection to the idle list
    pub fn put(&self, mut pooled: PooledConn) {
        if self.closed.load(Ordering::Acquire) {
            self.total_conns.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        pooled.conn.last_used = Instant::now();
        self.idle.lock().unwrap().push(pooled.conn);
        // dropping the permit frees capacity
    }

    /// Discard a connection, e.g. after a transport error
    pub fn remove(&self, _pooled: PooledConn) {
        self.total_conns.fetch_sub(1, Ordering::Relaxed);
    }

    /// Drop idle connections older than `idle_timeout`; returns how many
    pub fn reap_idle(&self) -> usize {
        if self.config.idle_timeout.is_none() {
            return 0;
        }
        let reaped = {
            let mut idle = self.idle.lock().unwrap();
            let before = idle.len();
            idle.retain(|conn| !self.is_stale(conn));
            before - idle.len()
        };
        if reaped > 0 {
            self.stale_conns.fetch_add(reaped as u32, Ordering::Relaxed);
            self.total_conns.fetch_sub(reaped as u32, Ordering::Relaxed);
            debug!(addr = %self.addr, reaped, "reaped idle connections");
        }
        reaped
    }

    fn is_stale(&self, conn: &Connection) -> bool {
        match self.config.idle_timeout {
            Some(limit) => conn.idle_for() >= limit,
            None => false,
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            total_conns: self.total_conns.load(Ordering::Relaxed),
            idle_conns: self.idle.lock().unwrap().len() as u32,
            stale_conns: self.stale_conns.load(Ordering::Relaxed),
        }
    }

    /// Idempotent; subsequent `get` calls fail with PoolClosed
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sem.close();
        let drained = {
            let mut idle = self.idle.lock().unwrap();
            std::mem::take(&mut *idle).len()
        };
        self.total_conns.fetch_sub(drained as u32, Ordering::Relaxed);
    }
}
